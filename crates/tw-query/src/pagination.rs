//! # Pagination
//!
//! Two schemes over a total ordering:
//!
//! - **Offset**: an opaque token wrapping `{"offset": n}`. Stores fetch
//!   `limit + 1` rows so a next token is only issued when more rows exist.
//! - **Keyset**: a cursor holding the last row's sort value and id. The next
//!   page is the rows strictly after that position, which stays stable when
//!   rows are inserted ahead of it.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, QueryError, Result};
use crate::predicate::{ColumnDescriptor, CompareOp, Predicate};

pub const DEFAULT_MAX_RESULTS: usize = 1000;
pub const MAX_RESULTS_LIMIT: usize = 1_000_000;

/// Resolve a requested page size. Absent or zero means `default`.
pub fn validate_max_results(requested: Option<i64>, default: usize, limit: usize) -> Result<usize> {
    match requested {
        None | Some(0) => Ok(default),
        Some(n) if n < 0 => Err(QueryError::invalid(
            ErrorKind::InvalidMaxResults,
            format!("invalid value {} for parameter 'max_results', must be positive", n),
        )),
        Some(n) => match usize::try_from(n) {
            Ok(n) if n <= limit => Ok(n),
            _ => Err(QueryError::invalid(
                ErrorKind::InvalidMaxResults,
                format!(
                    "invalid value {} for parameter 'max_results', supplied value must be at most {}",
                    n, limit
                ),
            )),
        },
    }
}

// =============================================================================
// Offset tokens
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub offset: i32,
}

impl PageToken {
    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::json!({ "offset": self.offset }).to_string())
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| bad_token(format!("invalid page token: {}", e)))?;
        let parsed: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| bad_token(format!("invalid page token: {}", e)))?;
        let offset = parsed
            .get("offset")
            .and_then(Value::as_i64)
            .ok_or_else(|| bad_token("invalid page token: missing 'offset'"))?;
        let offset = i32::try_from(offset)
            .ok()
            .filter(|o| *o >= 0)
            .ok_or_else(|| bad_token(format!("invalid page token offset {}", offset)))?;
        Ok(Self { offset })
    }

    /// Starting offset for an optional token. Absent or empty means 0.
    pub fn resolve(token: Option<&str>) -> Result<i32> {
        match token.map(str::trim) {
            None | Some("") => Ok(0),
            Some(t) => Ok(Self::decode(t)?.offset),
        }
    }
}

/// Token for the page after `[offset, offset + limit)`, given how many rows
/// the store returned for a `limit + 1` fetch.
pub fn next_page_token(offset: i32, limit: usize, fetched: usize) -> Result<Option<String>> {
    if fetched <= limit {
        return Ok(None);
    }
    let next = i32::try_from(limit)
        .ok()
        .and_then(|l| offset.checked_add(l))
        .ok_or_else(|| bad_token("page offset overflows"))?;
    Ok(Some(PageToken { offset: next }.encode()))
}

/// One page of results and the token for the next, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    /// Cut a `limit + 1` fetch down to a page.
    pub fn from_lookahead(mut rows: Vec<T>, offset: i32, limit: usize) -> Result<Self> {
        let next_page_token = next_page_token(offset, limit, rows.len())?;
        rows.truncate(limit);
        Ok(Self {
            items: rows,
            next_page_token,
        })
    }
}

fn bad_token(message: impl Into<String>) -> QueryError {
    QueryError::invalid(ErrorKind::InvalidPageToken, message)
}

// =============================================================================
// Keyset cursors
// =============================================================================

/// Position of the last row returned: its sort value and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysetCursor {
    pub sort_value: Value,
    pub tie_break: String,
}

impl KeysetCursor {
    pub fn encode(&self) -> String {
        let json = serde_json::json!({
            "sort_value": self.sort_value,
            "tie_break": self.tie_break,
        });
        URL_SAFE_NO_PAD.encode(json.to_string())
    }

    pub fn decode(cursor: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor.trim().trim_end_matches('='))
            .map_err(|e| bad_token(format!("invalid cursor: {}", e)))?;
        serde_json::from_slice(&bytes).map_err(|e| bad_token(format!("invalid cursor: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    /// Operator selecting values that come after a position in this direction.
    fn after(self) -> CompareOp {
        match self {
            Self::Asc => CompareOp::Gt,
            Self::Desc => CompareOp::Lt,
        }
    }
}

/// A two-column total order: a sort column and a unique tie-break column.
#[derive(Debug, Clone, PartialEq)]
pub struct KeysetOrder {
    pub sort_column: ColumnDescriptor,
    pub sort: Direction,
    pub tie_break_column: ColumnDescriptor,
    pub tie_break: Direction,
}

impl KeysetOrder {
    /// Rows strictly after `cursor`:
    /// `sort after prior OR (sort == prior AND id after priorId)`.
    pub fn resume_predicate(&self, cursor: &KeysetCursor) -> Predicate {
        Predicate::Or {
            children: vec![
                Predicate::compare(
                    self.sort_column.clone(),
                    self.sort.after(),
                    cursor.sort_value.clone(),
                ),
                Predicate::And {
                    children: vec![
                        Predicate::compare(
                            self.sort_column.clone(),
                            CompareOp::Eq,
                            cursor.sort_value.clone(),
                        ),
                        Predicate::compare(
                            self.tie_break_column.clone(),
                            self.tie_break.after(),
                            cursor.tie_break.clone(),
                        ),
                    ],
                },
            ],
        }
    }
}
