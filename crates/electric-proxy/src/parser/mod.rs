//! SQL statement analysis
//!
//! Just enough parsing to classify what flows through the proxy:
//! transaction control, table DDL with its target, the ELECTRIC
//! vocabulary, and everything else as opaque DML. Full SQL understanding
//! stays with the upstream server.

pub mod ddl;
pub mod lexer;

pub use ddl::{
    classify_batch, classify_statement, split_batch, DdlOp, Statement, TableRef, TxControl,
};
pub use lexer::{lex, Token, TokenKind};
