//! # Query Errors
//!
//! Every rejection the compilers can produce, classified by [`ErrorKind`]
//! so the server can map it onto its wire taxonomy without string matching.

use serde::Serialize;
use thiserror::Error;

/// Classification of a rejected filter, order clause, or token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The expression text does not parse.
    Syntax,
    /// An identifier or attribute is not in the symbol table.
    UnknownAttribute,
    /// A flat-filter entity prefix is not recognised.
    UnknownEntity,
    /// An operand has the wrong shape for its position.
    InvalidOperand,
    /// The operator is not allowed for this key's type.
    InvalidOperator,
    /// The value could not be coerced to the key's type.
    InvalidValue,
    /// `and`/`or`/`not` applied to something that is not a condition.
    NotABooleanExpression,
    /// A flat-filter conjunct or order clause does not match the grammar.
    MalformedFilter,
    /// The page token is not a valid encoded cursor.
    InvalidPageToken,
    /// `max_results` is outside the accepted range.
    InvalidMaxResults,
    /// A metric value is neither numeric nor a known sentinel.
    InvalidMetricValue,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Syntax => "syntax error",
            Self::UnknownAttribute => "unknown attribute",
            Self::UnknownEntity => "unknown entity",
            Self::InvalidOperand => "invalid operand",
            Self::InvalidOperator => "invalid operator",
            Self::InvalidValue => "invalid value",
            Self::NotABooleanExpression => "not a boolean expression",
            Self::MalformedFilter => "malformed filter",
            Self::InvalidPageToken => "invalid page token",
            Self::InvalidMaxResults => "invalid max_results",
            Self::InvalidMetricValue => "invalid metric value",
        };
        f.write_str(name)
    }
}

/// Where in the expression text an error was detected.
///
/// `line` and `offset` are 1-based, counted in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub statement: String,
    pub line: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// A Grammar A expression failed to parse.
    #[error("syntax error at ({}, {}) in {:?}: {message}", .location.line, .location.offset, .location.statement)]
    Syntax { location: Location, message: String },

    /// A Grammar A expression parsed, but does not compile.
    #[error("{kind} at ({}, {}) in {:?}: {message}", .location.line, .location.offset, .location.statement)]
    Compile {
        kind: ErrorKind,
        location: Location,
        message: String,
    },

    /// A flat filter, order clause, token or value was rejected.
    #[error("{message}")]
    Invalid { kind: ErrorKind, message: String },
}

impl QueryError {
    pub fn invalid(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Invalid {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Compile { kind, .. } | Self::Invalid { kind, .. } => *kind,
        }
    }

    /// Source position, for errors raised against expression text.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Syntax { location, .. } | Self::Compile { location, .. } => Some(location),
            Self::Invalid { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
