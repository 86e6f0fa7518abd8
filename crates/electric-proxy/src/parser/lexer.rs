//! SQL token scanner
//!
//! Tolerant of line and block comments (nested), single-quoted strings
//! with doubled-quote escapes, E-strings, quoted identifiers,
//! dollar-quoted bodies, positional parameters and numeric literals.
//! Tokens carry line/column so parse errors can point at their source.

use electric_common::error::{ProxyError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted word, stored as written; compare case-insensitively
    Word(String),
    /// Double-quoted identifier, case preserved, quotes stripped
    QuotedIdent(String),
    /// Single-quoted or dollar-quoted literal, quotes stripped
    String(String),
    Number(String),
    /// Positional parameter `$n`
    Parameter(i32),
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    /// Any other operator run (`=`, `<>`, `||`, …)
    Operator(String),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
    /// Character offset of the token start, for batch splitting
    pub offset: usize,
}

impl Token {
    /// Case-insensitive keyword match for unquoted words
    pub fn is_word(&self, keyword: &str) -> bool {
        match &self.kind {
            TokenKind::Word(w) => w.eq_ignore_ascii_case(keyword),
            _ => false,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}

/// Scan `input` into tokens, or a parse error naming the offending spot
pub fn lex(input: &str) -> Result<Vec<Token>> {
    Scanner::new(input).scan_all()
}

struct Scanner<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    _input: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            _input: input,
        }
    }

    fn scan_all(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let (line, col, offset) = (self.line, self.col, self.pos);
            let Some(ch) = self.peek() else {
                out.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    col,
                    offset,
                });
                break;
            };

            let kind = match ch {
                '\'' => self.scan_single_quoted()?,
                '"' => self.scan_quoted_ident()?,
                '$' => self.scan_dollar()?,
                'e' | 'E' if self.peek_at(1) == Some('\'') => {
                    self.bump();
                    self.scan_single_quoted()?
                }
                '(' => {
                    self.bump();
                    TokenKind::LParen
                }
                ')' => {
                    self.bump();
                    TokenKind::RParen
                }
                ',' => {
                    self.bump();
                    TokenKind::Comma
                }
                ';' => {
                    self.bump();
                    TokenKind::Semicolon
                }
                '.' if !matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) => {
                    self.bump();
                    TokenKind::Dot
                }
                c if c.is_ascii_digit() || c == '.' => self.scan_number(),
                c if is_ident_start(c) => self.scan_word(),
                _ => self.scan_operator(),
            };

            out.push(Token {
                kind,
                line,
                col,
                offset,
            });
        }
        Ok(out)
    }

    fn error(&self, message: impl Into<String>) -> ProxyError {
        ProxyError::Parse {
            line: self.line,
            col: self.col,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek_at(1) == Some('-') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    let mut depth = 1usize;
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('/'), Some('*')) => {
                                self.bump();
                                self.bump();
                                depth += 1;
                            }
                            (Some('*'), Some('/')) => {
                                self.bump();
                                self.bump();
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => return Err(self.error("unterminated block comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_single_quoted(&mut self) -> Result<TokenKind> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('\'') if self.peek() == Some('\'') => {
                    self.bump();
                    value.push('\'');
                }
                Some('\'') => return Ok(TokenKind::String(value)),
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated string literal")),
            }
        }
    }

    fn scan_quoted_ident(&mut self) -> Result<TokenKind> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') if self.peek() == Some('"') => {
                    self.bump();
                    value.push('"');
                }
                Some('"') => return Ok(TokenKind::QuotedIdent(value)),
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated quoted identifier")),
            }
        }
    }

    /// `$n` parameter, `$tag$…$tag$` dollar-quoted literal, or a bare `$`
    fn scan_dollar(&mut self) -> Result<TokenKind> {
        // Positional parameter
        if matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    digits.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            let n: i32 = digits
                .parse()
                .map_err(|_| self.error(format!("invalid parameter number ${digits}")))?;
            return Ok(TokenKind::Parameter(n));
        }

        // Scan the opening delimiter $tag$
        let mut offset = 1;
        let mut tag = String::new();
        loop {
            match self.peek_at(offset) {
                Some('$') => break,
                Some(c) if is_ident_part(c) => {
                    tag.push(c);
                    offset += 1;
                }
                _ => {
                    self.bump();
                    return Ok(TokenKind::Operator("$".into()));
                }
            }
        }
        for _ in 0..offset + 1 {
            self.bump();
        }

        let delimiter: Vec<char> = format!("${tag}$").chars().collect();
        let mut value = String::new();
        loop {
            if self.peek().is_none() {
                return Err(self.error("unterminated dollar-quoted string"));
            }
            if self.chars[self.pos..].starts_with(&delimiter[..]) {
                for _ in 0..delimiter.len() {
                    self.bump();
                }
                return Ok(TokenKind::String(value));
            }
            if let Some(c) = self.bump() {
                value.push(c);
            }
        }
    }

    fn scan_number(&mut self) -> TokenKind {
        let mut value = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                value.push(c);
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Number(value)
    }

    fn scan_word(&mut self) -> TokenKind {
        let mut value = String::new();
        while let Some(c) = self.peek() {
            if is_ident_part(c) {
                value.push(c);
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Word(value)
    }

    fn scan_operator(&mut self) -> TokenKind {
        let mut value = String::new();
        while let Some(c) = self.peek() {
            if is_operator_char(c) {
                value.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if value.is_empty() {
            // Lone unrecognised character; consume it so the scan advances
            if let Some(c) = self.bump() {
                value.push(c);
            }
        }
        TokenKind::Operator(value)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_operator_char(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '<' | '>' | '=' | '~' | '!' | '@' | '#' | '%' | '^' | '&' | '|'
            | '?' | ':'
    )
}
