//! Statement classification
//!
//! Decides what each statement in a query batch means to the proxy:
//! transaction control, table DDL (with its target table), an ELECTRIC
//! command, or opaque DML to forward untouched. Whether a table DDL
//! counts as *electrified* is the caller's decision; classification here
//! is purely lexical.

use electric_common::error::{ProxyError, Result};

use super::lexer::{lex, Token, TokenKind};
use crate::ddlx::{self, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxControl {
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlOp {
    CreateTable,
    AlterTable,
    DropTable,
    CreateIndex,
}

/// A possibly schema-qualified table name. Unquoted identifiers fold to
/// lower case the way the server does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    pub fn bare(name: &str) -> Self {
        Self::new(None, name)
    }

    /// Cache / registry key with the schema defaulted
    pub fn key(&self) -> String {
        format!(
            "{}.{}",
            self.schema.as_deref().unwrap_or("public"),
            self.name
        )
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What one statement means to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    TxControl(TxControl),
    /// Anything the proxy does not interpret
    PlainDml,
    PlainDdl {
        table: TableRef,
        op: DdlOp,
    },
    Electric(Command),
}

/// Classify every statement in a semicolon-separated batch.
///
/// A batch that mixes an ELECTRIC command with ordinary statements is
/// rejected: the command's synthetic completion would interleave with
/// real server replies in unspecifiable ways.
pub fn classify_batch(sql: &str) -> Result<Vec<Statement>> {
    Ok(split_batch(sql)?.into_iter().map(|(_, s)| s).collect())
}

/// Like [`classify_batch`], keeping each statement's original text so
/// the caller can forward statements individually.
pub fn split_batch(sql: &str) -> Result<Vec<(String, Statement)>> {
    let tokens = lex(sql)?;
    let chars: Vec<char> = sql.chars().collect();

    let mut groups: Vec<(&[Token], usize)> = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Semicolon | TokenKind::Eof => {
                if i > start {
                    groups.push((&tokens[start..i], token.offset));
                }
                start = i + 1;
            }
            _ => {}
        }
    }

    let statements = groups
        .into_iter()
        .map(|(group, end)| {
            let text: String = chars[group[0].offset..end].iter().collect();
            Ok((text.trim_end().to_string(), classify_tokens(group)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let electric_count = statements
        .iter()
        .filter(|(_, s)| matches!(s, Statement::Electric(_)))
        .count();
    if electric_count > 0 && electric_count != statements.len() {
        return Err(ProxyError::MixedBatch);
    }

    Ok(statements)
}

/// Classify a single statement (errors if the input is a batch)
pub fn classify_statement(sql: &str) -> Result<Statement> {
    let mut statements = classify_batch(sql)?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Ok(Statement::PlainDml),
        n => Err(ProxyError::Protocol(format!(
            "expected a single statement, got a batch of {n}"
        ))),
    }
}

fn classify_tokens(tokens: &[Token]) -> Result<Statement> {
    let mut cursor = Cursor::new(tokens);

    if cursor.eat_word("ELECTRIC") {
        return Ok(Statement::Electric(ddlx::parse_command(&mut cursor)?));
    }

    if cursor.eat_word("BEGIN") {
        return Ok(Statement::TxControl(TxControl::Begin));
    }
    if cursor.eat_word("START") {
        if cursor.eat_word("TRANSACTION") {
            return Ok(Statement::TxControl(TxControl::Begin));
        }
        return Ok(Statement::PlainDml);
    }
    if cursor.eat_word("COMMIT") {
        // COMMIT PREPARED is two-phase commit, not transaction control here
        if cursor.peek_word("PREPARED") {
            return Ok(Statement::PlainDml);
        }
        return Ok(Statement::TxControl(TxControl::Commit));
    }
    if cursor.eat_word("END") {
        return Ok(Statement::TxControl(TxControl::Commit));
    }
    if cursor.eat_word("ROLLBACK") || cursor.eat_word("ABORT") {
        // ROLLBACK TO savepoint / ROLLBACK PREPARED keep the transaction open
        if cursor.peek_word("TO") || cursor.peek_word("PREPARED") {
            return Ok(Statement::PlainDml);
        }
        return Ok(Statement::TxControl(TxControl::Rollback));
    }

    if cursor.eat_word("CREATE") {
        cursor.eat_any_word(&["GLOBAL", "LOCAL"]);
        cursor.eat_any_word(&["TEMP", "TEMPORARY", "UNLOGGED"]);
        if cursor.eat_word("TABLE") {
            eat_if_not_exists(&mut cursor);
            if let Some(table) = cursor.table_ref() {
                return Ok(Statement::PlainDdl {
                    table,
                    op: DdlOp::CreateTable,
                });
            }
            return Ok(Statement::PlainDml);
        }
        cursor.eat_word("UNIQUE");
        if cursor.eat_word("INDEX") {
            cursor.eat_word("CONCURRENTLY");
            eat_if_not_exists(&mut cursor);
            // Optional index name, then ON <table>
            while !cursor.at_eof() && !cursor.peek_word("ON") {
                cursor.advance();
            }
            if cursor.eat_word("ON") {
                cursor.eat_word("ONLY");
                if let Some(table) = cursor.table_ref() {
                    return Ok(Statement::PlainDdl {
                        table,
                        op: DdlOp::CreateIndex,
                    });
                }
            }
            return Ok(Statement::PlainDml);
        }
        return Ok(Statement::PlainDml);
    }

    if cursor.eat_word("ALTER") {
        if cursor.eat_word("TABLE") {
            cursor.eat_word("IF");
            cursor.eat_word("EXISTS");
            cursor.eat_word("ONLY");
            if let Some(table) = cursor.table_ref() {
                // ALTER TABLE t ENABLE ELECTRIC is the electrification DDL
                if cursor.peek_word("ENABLE") && cursor.peek_word_at(1, "ELECTRIC") {
                    return Ok(Statement::Electric(Command::Enable { table }));
                }
                if cursor.peek_word("DISABLE") && cursor.peek_word_at(1, "ELECTRIC") {
                    return Ok(Statement::Electric(Command::Disable { table }));
                }
                return Ok(Statement::PlainDdl {
                    table,
                    op: DdlOp::AlterTable,
                });
            }
        }
        return Ok(Statement::PlainDml);
    }

    if cursor.eat_word("DROP") {
        if cursor.eat_word("TABLE") {
            cursor.eat_word("IF");
            cursor.eat_word("EXISTS");
            if let Some(table) = cursor.table_ref() {
                return Ok(Statement::PlainDdl {
                    table,
                    op: DdlOp::DropTable,
                });
            }
        }
        return Ok(Statement::PlainDml);
    }

    Ok(Statement::PlainDml)
}

fn eat_if_not_exists(cursor: &mut Cursor) {
    if cursor.peek_word("IF") && cursor.peek_word_at(1, "NOT") && cursor.peek_word_at(2, "EXISTS") {
        cursor.advance();
        cursor.advance();
        cursor.advance();
    }
}

/// Token cursor shared with the ELECTRIC command parser
pub struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub fn peek_at(&self, offset: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + offset)
    }

    pub fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    pub fn peek_word(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_word(keyword))
    }

    pub fn peek_word_at(&self, offset: usize, keyword: &str) -> bool {
        self.peek_at(offset).is_some_and(|t| t.is_word(keyword))
    }

    pub fn eat_word(&mut self, keyword: &str) -> bool {
        if self.peek_word(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn eat_any_word(&mut self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.eat_word(k))
    }

    /// Line/column of the current token, for error reporting
    pub fn location(&self) -> (usize, usize) {
        match self.peek().or_else(|| self.tokens.last()) {
            Some(token) => (token.line, token.col),
            None => (1, 1),
        }
    }

    /// One identifier part: unquoted word (folded) or quoted identifier
    pub fn ident(&mut self) -> Option<String> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Word(w)) => {
                let name = w.to_lowercase();
                self.pos += 1;
                Some(name)
            }
            Some(TokenKind::QuotedIdent(name)) => {
                let name = name.clone();
                self.pos += 1;
                Some(name)
            }
            _ => None,
        }
    }

    /// `name` or `schema.name`
    pub fn table_ref(&mut self) -> Option<TableRef> {
        let first = self.ident()?;
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Dot)) {
            self.pos += 1;
            let name = self.ident()?;
            Some(TableRef {
                schema: Some(first),
                name,
            })
        } else {
            Some(TableRef {
                schema: None,
                name: first,
            })
        }
    }
}
