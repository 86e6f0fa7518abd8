//! Recursive-descent parser for the ELECTRIC grammar
//!
//! Entered from statement classification once the leading `ELECTRIC`
//! keyword (or the `ALTER TABLE … ENABLE ELECTRIC` form) has been seen.

use electric_common::error::{ProxyError, Result};

use super::{ColumnRef, Command, Privilege, RoleExpr, RoleName};
use crate::parser::ddl::{Cursor, TableRef};
use crate::parser::lexer::{Token, TokenKind};

/// Parse one command; the `ELECTRIC` keyword is already consumed.
pub fn parse_command(cursor: &mut Cursor) -> Result<Command> {
    let command = if cursor.eat_word("ENABLE") {
        Command::Enable {
            table: table(cursor)?,
        }
    } else if cursor.eat_word("DISABLE") {
        Command::Disable {
            table: table(cursor)?,
        }
    } else if cursor.eat_word("GRANT") {
        let privilege = privilege(cursor)?;
        let columns = column_list(cursor)?;
        expect_word(cursor, "ON")?;
        let table = table(cursor)?;
        expect_word(cursor, "TO")?;
        let role = role(cursor)?;
        let check = if cursor.eat_word("WHERE") {
            Some(paren_expr(cursor)?)
        } else {
            None
        };
        Command::Grant {
            privilege,
            table,
            role,
            columns,
            check,
        }
    } else if cursor.eat_word("REVOKE") {
        let privilege = privilege(cursor)?;
        let columns = column_list(cursor)?;
        expect_word(cursor, "ON")?;
        let table = table(cursor)?;
        expect_word(cursor, "FROM")?;
        let role = role(cursor)?;
        Command::Revoke {
            privilege,
            table,
            role,
            columns,
        }
    } else if cursor.eat_word("ASSIGN") {
        let role = role_expr(cursor)?;
        expect_word(cursor, "TO")?;
        let user = column_ref(cursor)?;
        let condition = if cursor.eat_word("IF") {
            Some(paren_expr(cursor)?)
        } else {
            None
        };
        Command::Assign {
            role,
            user,
            condition,
        }
    } else if cursor.eat_word("UNASSIGN") {
        let role = role_expr(cursor)?;
        expect_word(cursor, "FROM")?;
        let user = column_ref(cursor)?;
        Command::Unassign { role, user }
    } else if cursor.eat_word("SQLITE") {
        let body = sqlite_body(cursor)?;
        Command::SqliteVerbatim { body }
    } else {
        let found = describe_token(cursor.peek());
        return Err(err_at(cursor, format!("unrecognised ELECTRIC command: {found}")));
    };

    if !cursor.at_eof() && !matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::Eof)) {
        let found = describe_token(cursor.peek());
        return Err(err_at(
            cursor,
            format!("unexpected input after {}: {found}", command.tag()),
        ));
    }

    Ok(command)
}

fn err_at(cursor: &Cursor, message: impl Into<String>) -> ProxyError {
    let (line, col) = cursor.location();
    ProxyError::Parse {
        line,
        col,
        message: message.into(),
    }
}

fn describe_token(token: Option<&Token>) -> String {
    match token.map(|t| &t.kind) {
        None | Some(TokenKind::Eof) => "end of statement".into(),
        Some(TokenKind::Word(w)) => format!("{w:?}"),
        Some(TokenKind::QuotedIdent(w)) => format!("\"{w}\""),
        Some(TokenKind::String(_)) => "string literal".into(),
        Some(other) => format!("{other:?}"),
    }
}

fn expect_word(cursor: &mut Cursor, keyword: &str) -> Result<()> {
    if cursor.eat_word(keyword) {
        Ok(())
    } else {
        let found = describe_token(cursor.peek());
        Err(err_at(cursor, format!("expected {keyword}, found {found}")))
    }
}

fn table(cursor: &mut Cursor) -> Result<TableRef> {
    cursor
        .table_ref()
        .ok_or_else(|| err_at(cursor, "expected a table name"))
}

fn privilege(cursor: &mut Cursor) -> Result<Privilege> {
    for (keyword, privilege) in [
        ("ALL", Privilege::All),
        ("READ", Privilege::Read),
        ("WRITE", Privilege::Write),
        ("SELECT", Privilege::Select),
        ("INSERT", Privilege::Insert),
        ("UPDATE", Privilege::Update),
        ("DELETE", Privilege::Delete),
    ] {
        if cursor.eat_word(keyword) {
            // GRANT ALL PRIVILEGES is accepted PostgreSQL-style
            if privilege == Privilege::All {
                cursor.eat_word("PRIVILEGES");
            }
            return Ok(privilege);
        }
    }
    let found = describe_token(cursor.peek());
    Err(err_at(cursor, format!("expected a privilege, found {found}")))
}

/// Optional parenthesized column list after the privilege
fn column_list(cursor: &mut Cursor) -> Result<Option<Vec<String>>> {
    if !matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
        return Ok(None);
    }
    cursor.advance();
    let mut columns = Vec::new();
    loop {
        let column = cursor
            .ident()
            .ok_or_else(|| err_at(cursor, "expected a column name"))?;
        columns.push(column);
        match cursor.peek().map(|t| &t.kind) {
            Some(TokenKind::Comma) => {
                cursor.advance();
            }
            Some(TokenKind::RParen) => {
                cursor.advance();
                return Ok(Some(columns));
            }
            _ => {
                let found = describe_token(cursor.peek());
                return Err(err_at(cursor, format!("expected , or ) found {found}")));
            }
        }
    }
}

/// Role on the GRANT/REVOKE side: a quoted literal or a bare name
fn role(cursor: &mut Cursor) -> Result<String> {
    if let Some(TokenKind::String(role)) = cursor.peek().map(|t| &t.kind) {
        let role = role.clone();
        cursor.advance();
        return Ok(role);
    }
    cursor
        .ident()
        .ok_or_else(|| err_at(cursor, "expected a role name"))
}

/// Role expression on the ASSIGN/UNASSIGN side:
/// `'literal'` | `table.column` | `( scope, 'literal' | table.column )`
fn role_expr(cursor: &mut Cursor) -> Result<RoleExpr> {
    if matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
        cursor.advance();
        let scope = table(cursor)?;
        if !matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::Comma)) {
            return Err(err_at(cursor, "expected , in scoped role expression"));
        }
        cursor.advance();
        let name = role_name(cursor)?;
        if !matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::RParen)) {
            return Err(err_at(cursor, "expected ) closing scoped role expression"));
        }
        cursor.advance();
        return Ok(RoleExpr {
            scope: Some(scope),
            name,
        });
    }
    Ok(RoleExpr {
        scope: None,
        name: role_name(cursor)?,
    })
}

fn role_name(cursor: &mut Cursor) -> Result<RoleName> {
    if let Some(TokenKind::String(role)) = cursor.peek().map(|t| &t.kind) {
        let role = role.clone();
        cursor.advance();
        return Ok(RoleName::Literal(role));
    }
    let column = column_ref(cursor)?;
    Ok(RoleName::Column(column.table, column.column))
}

/// `[schema.]table.column`
fn column_ref(cursor: &mut Cursor) -> Result<ColumnRef> {
    let mut parts = Vec::new();
    loop {
        let part = cursor
            .ident()
            .ok_or_else(|| err_at(cursor, "expected table.column"))?;
        parts.push(part);
        if matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::Dot)) {
            cursor.advance();
        } else {
            break;
        }
    }
    match parts.len() {
        2 => Ok(ColumnRef {
            table: TableRef::bare(&parts[0]),
            column: parts[1].clone(),
        }),
        3 => Ok(ColumnRef {
            table: TableRef::new(Some(&parts[0]), &parts[1]),
            column: parts[2].clone(),
        }),
        _ => Err(err_at(
            cursor,
            "expected table.column, got a bare identifier",
        )),
    }
}

/// Capture a parenthesized expression as canonical text
fn paren_expr(cursor: &mut Cursor) -> Result<String> {
    if !matches!(cursor.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
        return Err(err_at(cursor, "expected ( opening an expression"));
    }
    cursor.advance();
    let mut depth = 1usize;
    let mut parts: Vec<String> = Vec::new();
    loop {
        let Some(token) = cursor.peek() else {
            return Err(err_at(cursor, "unterminated expression"));
        };
        match &token.kind {
            TokenKind::Eof => return Err(err_at(cursor, "unterminated expression")),
            TokenKind::LParen => {
                depth += 1;
                parts.push("(".into());
            }
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    cursor.advance();
                    return Ok(parts.join(" "));
                }
                parts.push(")".into());
            }
            other => parts.push(render_token(other)),
        }
        cursor.advance();
    }
}

/// `ELECTRIC SQLITE '<body>'`, or bare SQL to the end of the statement
fn sqlite_body(cursor: &mut Cursor) -> Result<String> {
    if let Some(TokenKind::String(body)) = cursor.peek().map(|t| &t.kind) {
        let body = body.clone();
        cursor.advance();
        if cursor.at_eof() {
            return Ok(body);
        }
    }
    let mut parts = Vec::new();
    while let Some(token) = cursor.peek() {
        if matches!(token.kind, TokenKind::Eof) {
            break;
        }
        parts.push(render_token(&token.kind));
        cursor.advance();
    }
    if parts.is_empty() {
        return Err(err_at(cursor, "expected SQL after ELECTRIC SQLITE"));
    }
    Ok(parts.join(" "))
}

fn render_token(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Word(w) => w.clone(),
        TokenKind::QuotedIdent(w) => format!("\"{}\"", w.replace('"', "\"\"")),
        TokenKind::String(s) => format!("'{}'", s.replace('\'', "''")),
        TokenKind::Number(n) => n.clone(),
        TokenKind::Parameter(n) => format!("${n}"),
        TokenKind::LParen => "(".into(),
        TokenKind::RParen => ")".into(),
        TokenKind::Comma => ",".into(),
        TokenKind::Dot => ".".into(),
        TokenKind::Semicolon => ";".into(),
        TokenKind::Operator(op) => op.clone(),
        TokenKind::Eof => String::new(),
    }
}
