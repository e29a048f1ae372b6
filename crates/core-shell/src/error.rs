//! Shell error taxonomy.
//!
//! Parse errors abort only the current line; the shell itself keeps running
//! and the failure is recorded on the line's backlog. IO errors during
//! pipeline startup abort the whole pipeline after cleanup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("invalid path")]
    InvalidPath,

    #[error("invalid program: {0}")]
    InvalidProgram(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated string while parsing")]
    UnterminatedString,
    #[error("unterminated variable while parsing")]
    UnterminatedVariable,
    #[error("unterminated program while parsing")]
    UnterminatedProgram,
    #[error("unterminated parenthesis expression while parsing")]
    UnterminatedParen,
    #[error("unterminated if statement while parsing")]
    UnterminatedIf,
    #[error("unterminated function declaration while parsing")]
    UnterminatedFunctionDeclaration,
    #[error("unterminated sub expression while parsing")]
    UnterminatedSubExpr,
    #[error("stray close paren")]
    StrayCloseParen,
    #[error("expected end of statement, found a token instead")]
    ExpectedEndOfStatement,
    #[error("unexpected empty program")]
    EmptyProgram,
    #[error("nothing to indirect")]
    NothingToIndirect,
}
