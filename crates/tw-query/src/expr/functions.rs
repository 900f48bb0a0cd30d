//! # Function Registry
//!
//! The allow-list of callables an expression may invoke. A registry is a
//! plain value built at startup and handed to the compiler; nothing is
//! registered globally, so tests can build their own.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::Value;

use super::compiler::Operand;
use crate::predicate::{CompareOp, Predicate};

/// Per-request inputs a builtin may read.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext {
    /// Client timezone offset in minutes, as reported by the browser
    /// (positive west of UTC).
    pub tz_offset_minutes: i32,
}

/// Signature of a builtin: compiled arguments in, compiled operand out.
/// An `Err` carries a message; the compiler attaches kind and position.
pub type Builtin = for<'s> fn(&[Operand<'s>], &CallContext) -> Result<Operand<'s>, String>;

#[derive(Clone, Copy)]
pub struct Function {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    pub apply: Builtin,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<&'static str, Function>,
}

impl FunctionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `datetime`, `re.match` and `re.search`.
    pub fn builtin() -> Self {
        Self::empty()
            .register(Function {
                name: "datetime",
                min_args: 1,
                max_args: 7,
                apply: datetime,
            })
            .register(Function {
                name: "re.match",
                min_args: 2,
                max_args: 2,
                apply: regex_match,
            })
            .register(Function {
                name: "re.search",
                min_args: 2,
                max_args: 2,
                apply: regex_search,
            })
    }

    pub fn register(mut self, function: Function) -> Self {
        self.functions.insert(function.name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<Function> {
        self.functions.get(name).copied()
    }

    /// True if some registered name starts with `name.`.
    pub fn is_namespace(&self, name: &str) -> bool {
        self.functions
            .keys()
            .any(|k| k.strip_prefix(name).is_some_and(|rest| rest.starts_with('.')))
    }
}

// =============================================================================
// Builtins
// =============================================================================

/// `datetime(year, month=1, day=1, hour=0, minute=0, second=0, microsecond=0)`
/// as epoch milliseconds in the caller's timezone.
fn datetime<'s>(args: &[Operand<'s>], ctx: &CallContext) -> Result<Operand<'s>, String> {
    const NAMES: [&str; 7] = [
        "year",
        "month",
        "day",
        "hour",
        "minute",
        "second",
        "microsecond",
    ];
    let mut fields: [i64; 7] = [0, 1, 1, 0, 0, 0, 0];
    for (i, arg) in args.iter().enumerate() {
        fields[i] = match arg {
            Operand::Literal(v) => v
                .as_i64()
                .ok_or_else(|| format!("datetime {} must be an integer, got {}", NAMES[i], v))?,
            other => {
                return Err(format!(
                    "datetime {} must be an integer literal, got {}",
                    NAMES[i],
                    other.describe()
                ))
            }
        };
    }

    let narrow = |i: usize| {
        u32::try_from(fields[i]).map_err(|_| format!("datetime {} out of range", NAMES[i]))
    };
    let year = i32::try_from(fields[0]).map_err(|_| "datetime year out of range".to_string())?;
    let date = NaiveDate::from_ymd_opt(year, narrow(1)?, narrow(2)?)
        .ok_or_else(|| format!("invalid date {}-{}-{}", fields[0], fields[1], fields[2]))?;
    let stamp = date
        .and_hms_micro_opt(narrow(3)?, narrow(4)?, narrow(5)?, narrow(6)?)
        .ok_or_else(|| "invalid time of day".to_string())?;

    let millis =
        stamp.and_utc().timestamp_millis() + i64::from(ctx.tz_offset_minutes) * 60_000;
    Ok(Operand::Literal(Value::from(millis)))
}

fn regex_match<'s>(args: &[Operand<'s>], _: &CallContext) -> Result<Operand<'s>, String> {
    regex_predicate(args, true)
}

fn regex_search<'s>(args: &[Operand<'s>], _: &CallContext) -> Result<Operand<'s>, String> {
    regex_predicate(args, false)
}

fn regex_predicate<'s>(args: &[Operand<'s>], anchored: bool) -> Result<Operand<'s>, String> {
    let (pattern, column) = match args {
        [Operand::Literal(Value::String(p)), target] => match target.clone().comparable() {
            Operand::Column(c) => (p, c),
            other => {
                return Err(format!(
                    "regular expression target must be a column, got {}",
                    other.describe()
                ))
            }
        },
        _ => return Err("expected (pattern, column)".to_string()),
    };
    let pattern = if anchored && !pattern.starts_with('^') {
        format!("^{}", pattern)
    } else {
        pattern.clone()
    };
    regex::Regex::new(&pattern).map_err(|e| format!("invalid regular expression: {}", e))?;
    Ok(Operand::Predicate(Predicate::compare(
        column,
        CompareOp::Regex,
        pattern,
    )))
}
