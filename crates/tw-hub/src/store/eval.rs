//! # Predicate Evaluation
//!
//! Turns a [`Predicate`] and its join requirements into a [`Matcher`] that
//! the in-memory store runs against one row at a time. Comparisons follow
//! SQL null semantics: a missing column makes a comparison unknown, unknown
//! propagates through `NOT`/`AND`/`OR`, and only a definite `true` selects
//! the row. Comparing against `null` is `IS NULL` / `IS NOT NULL`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde_json::Value;
use tw_query::symbols::RUN_DURATION_EXPR;
use tw_query::{ColumnDescriptor, CompareOp, EntityKind, JoinKind, JoinRequirement, ListOp, Predicate};

use super::{Experiment, LatestMetric, Run, StoreError};

/// Everything a predicate may read for one candidate row.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowContext<'a> {
    pub run: Option<&'a Run>,
    pub params: Option<&'a BTreeMap<String, String>>,
    /// Run tags for run rows, experiment tags for experiment rows.
    pub tags: Option<&'a BTreeMap<String, String>>,
    pub metrics: Option<&'a BTreeMap<String, LatestMetric>>,
    pub experiment: Option<&'a Experiment>,
    /// The current row of a metric-series search.
    pub metric: Option<&'a LatestMetric>,
}

impl<'a> RowContext<'a> {
    fn side(&self, join: &JoinRequirement, column: &str) -> Option<Value> {
        match join.entity {
            EntityKind::Tag => self.tags?.get(&join.key).map(|v| Value::from(v.as_str())),
            EntityKind::Param => self.params?.get(&join.key).map(|v| Value::from(v.as_str())),
            EntityKind::Metric => self.metrics?.get(&join.key)?.field(column),
            EntityKind::Attribute => None,
        }
    }

    fn has_side(&self, join: &JoinRequirement) -> bool {
        match join.entity {
            EntityKind::Tag => self.tags.is_some_and(|t| t.contains_key(&join.key)),
            EntityKind::Param => self.params.is_some_and(|p| p.contains_key(&join.key)),
            EntityKind::Metric => self.metrics.is_some_and(|m| m.contains_key(&join.key)),
            EntityKind::Attribute => true,
        }
    }

    fn own(&self, column: &ColumnDescriptor) -> Option<Value> {
        if column.computed {
            return match column.name.as_str() {
                RUN_DURATION_EXPR => {
                    let run = self.run?;
                    let end = run.end_time?;
                    Some(Value::from((end - run.start_time) / 1000))
                }
                _ => None,
            };
        }
        match column.table.as_str() {
            "runs" => self.run?.field(&column.name),
            "experiments" => self.experiment?.field(&column.name),
            "latest_metrics" => self.metric?.field(&column.name),
            _ => None,
        }
    }
}

/// Resolves columns of a compiled query against a [`RowContext`].
#[derive(Debug, Clone)]
pub struct Resolver {
    joins: HashMap<String, JoinRequirement>,
}

impl Resolver {
    pub fn new(joins: &[JoinRequirement]) -> Self {
        Self {
            joins: joins
                .iter()
                .map(|j| (j.alias.clone(), j.clone()))
                .collect(),
        }
    }

    /// False if an inner join has no row for this context.
    pub fn joins_satisfied(&self, row: &RowContext<'_>) -> bool {
        self.joins
            .values()
            .filter(|j| j.kind == JoinKind::Inner)
            .all(|j| row.has_side(j))
    }

    pub fn value(&self, column: &ColumnDescriptor, row: &RowContext<'_>) -> Option<Value> {
        let value = match &column.join_alias {
            Some(alias) => row.side(self.joins.get(alias)?, &column.name),
            None => row.own(column),
        }?;
        if column.fold_case {
            if let Value::String(s) = &value {
                return Some(Value::from(s.to_lowercase()));
            }
        }
        Some(value)
    }
}

// =============================================================================
// Matcher
// =============================================================================

#[derive(Debug, Clone)]
pub enum Matcher {
    Compare {
        column: ColumnDescriptor,
        op: CompareOp,
        literal: Value,
    },
    Pattern {
        column: ColumnDescriptor,
        regex: Regex,
    },
    List {
        column: ColumnDescriptor,
        negated: bool,
        literals: Vec<Value>,
    },
    All(Vec<Matcher>),
    Any(Vec<Matcher>),
    Not(Box<Matcher>),
}

impl Matcher {
    /// Compile patterns once per query.
    pub fn compile(predicate: &Predicate) -> Result<Self, StoreError> {
        let matcher = match predicate {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => match op {
                CompareOp::Like | CompareOp::ILike | CompareOp::Regex => {
                    let pattern = literal.as_str().ok_or_else(|| {
                        StoreError::InvalidState(format!(
                            "{} pattern must be a string, got {}",
                            op.as_str(),
                            literal
                        ))
                    })?;
                    let source = match op {
                        CompareOp::Like => like_to_regex(pattern, false),
                        CompareOp::ILike => like_to_regex(pattern, true),
                        _ => pattern.to_string(),
                    };
                    let regex = Regex::new(&source).map_err(|e| {
                        StoreError::InvalidState(format!("invalid pattern '{}': {}", pattern, e))
                    })?;
                    Self::Pattern {
                        column: column.clone(),
                        regex,
                    }
                }
                _ => Self::Compare {
                    column: column.clone(),
                    op: *op,
                    literal: literal.clone(),
                },
            },
            Predicate::ListMembership {
                column,
                op,
                literals,
            } => Self::List {
                column: column.clone(),
                negated: *op == ListOp::NotIn,
                literals: literals.clone(),
            },
            Predicate::And { children } => {
                Self::All(children.iter().map(Self::compile).collect::<Result<_, _>>()?)
            }
            Predicate::Or { children } => {
                Self::Any(children.iter().map(Self::compile).collect::<Result<_, _>>()?)
            }
            Predicate::Not { child } => Self::Not(Box::new(Self::compile(child)?)),
        };
        Ok(matcher)
    }

    /// Three-valued evaluation; `None` is SQL `UNKNOWN`.
    pub fn eval(&self, resolver: &Resolver, row: &RowContext<'_>) -> Option<bool> {
        match self {
            Self::Compare {
                column,
                op,
                literal,
            } => {
                let value = resolver.value(column, row);
                if literal.is_null() {
                    let is_null = value.map_or(true, |v| v.is_null());
                    return match op {
                        CompareOp::Eq => Some(is_null),
                        CompareOp::Neq => Some(!is_null),
                        _ => None,
                    };
                }
                compare(&value?, *op, literal)
            }
            Self::Pattern { column, regex } => {
                let value = resolver.value(column, row)?;
                Some(regex.is_match(&value_to_string(&value)))
            }
            Self::List {
                column,
                negated,
                literals,
            } => {
                let value = resolver.value(column, row)?;
                let found = literals.iter().any(|l| values_equal(&value, l));
                Some(found != *negated)
            }
            Self::All(children) => {
                let mut unknown = false;
                for child in children {
                    match child.eval(resolver, row) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                (!unknown).then_some(true)
            }
            Self::Any(children) => {
                let mut unknown = false;
                for child in children {
                    match child.eval(resolver, row) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                (!unknown).then_some(false)
            }
            Self::Not(child) => child.eval(resolver, row).map(|b| !b),
        }
    }

    pub fn matches(&self, resolver: &Resolver, row: &RowContext<'_>) -> bool {
        resolver.joins_satisfied(row) && self.eval(resolver, row) == Some(true)
    }
}

/// SQL `LIKE` pattern to an anchored regex: `%` is any run, `_` any char.
fn like_to_regex(pattern: &str, case_insensitive: bool) -> String {
    let mut out = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '%' | '_' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '%' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

// =============================================================================
// Value comparison
// =============================================================================

fn compare(a: &Value, op: CompareOp, b: &Value) -> Option<bool> {
    let result = match op {
        CompareOp::Eq => values_equal(a, b),
        CompareOp::Neq => !values_equal(a, b),
        CompareOp::Gt => value_cmp(a, b)? == Ordering::Greater,
        CompareOp::Gte => value_cmp(a, b)? != Ordering::Less,
        CompareOp::Lt => value_cmp(a, b)? == Ordering::Less,
        CompareOp::Lte => value_cmp(a, b)? != Ordering::Greater,
        CompareOp::Like | CompareOp::ILike | CompareOp::Regex => return None,
    };
    Some(result)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match value_cmp(a, b) {
        Some(o) => o == Ordering::Equal,
        None => value_to_string(a) == value_to_string(b),
    }
}

/// Numbers compare numerically and strings lexically. A string compared
/// with a number is read as a number if it parses as one.
pub fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => value_to_f64(a)?.partial_cmp(&value_to_f64(b)?),
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Ordering for `ORDER BY`: nulls last in either direction.
pub fn order_values(a: Option<&Value>, b: Option<&Value>, descending: bool) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let o = value_cmp(x, y).unwrap_or_else(|| value_to_string(x).cmp(&value_to_string(y)));
            if descending {
                o.reverse()
            } else {
                o
            }
        }
    }
}
