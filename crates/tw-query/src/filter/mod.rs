//! # Flat Filter Grammar
//!
//! The `entity.key op value AND ...` filters of the search endpoints:
//!
//! ```text
//! metrics.accuracy > 0.9 AND params.optimizer = 'adam' AND attributes.status != 'FAILED'
//! ```
//!
//! Each conjunct is validated against an [`EntityRuleTable`]: which keys an
//! entity accepts, which operators each key type allows, and how its value
//! is coerced. Side-entity conjuncts add an inner join; conjuncts on the same
//! `(entity, key)` share one join, so `metrics.loss > 0.1 AND metrics.loss < 0.5`
//! constrains a single joined row.

pub mod order;
pub mod rules;

pub use order::{SortKey, SortSpec};
pub use rules::{AttributeRule, AttributeType, DialectHints, EntityRuleTable, OrderStyle};

use regex::Regex;
use serde_json::Value;

use crate::error::{ErrorKind, QueryError, Result};
use crate::predicate::{
    ColumnDescriptor, CompareOp, CompiledFilter, EntityKind, JoinKind, JoinSet, ListOp, Predicate,
};

const AND_SEPARATOR: &str = r"(?i)\s+AND\s+";
const CONDITION: &str = concat!(
    r"^(?:(\w+)\.)?",
    r#"("[^"]+"|`[^`]+`|[\w\.]+)"#,
    r"\s+(<=|>=|!=|<|>|=|(?i:I?LIKE)|(?i:(?:NOT\s+)?IN))\s+",
    r#"(\((?:'[^']+'(?:,\s*)?)+\)|"[^"]+"|'[^']+'|-?[\w\.]+)$"#,
);
const IN_GROUP_SEPARATOR: &str = r",\s*";
const ORDER_CLAUSE: &str =
    r#"^(attribute|metric|param|tag)s?\.("[^"]+"|`[^`]+`|[\w\.]+)(?i:\s+(ASC|DESC))?$"#;
const ATTRIBUTE_ORDER_CLAUSE: &str = r"^(?:attr(?:ibutes?)?\.)?(\w+)(?i:\s+(ASC|DESC))?$";

/// Operator of one flat conjunct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlatOp {
    Compare(CompareOp),
    In,
    NotIn,
}

impl FlatOp {
    fn parse(raw: &str) -> Option<Self> {
        let upper = raw.to_ascii_uppercase();
        let op = match upper.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["<"] => Self::Compare(CompareOp::Lt),
            ["<="] => Self::Compare(CompareOp::Lte),
            [">"] => Self::Compare(CompareOp::Gt),
            [">="] => Self::Compare(CompareOp::Gte),
            ["="] => Self::Compare(CompareOp::Eq),
            ["!="] => Self::Compare(CompareOp::Neq),
            ["LIKE"] => Self::Compare(CompareOp::Like),
            ["ILIKE"] => Self::Compare(CompareOp::ILike),
            ["IN"] => Self::In,
            ["NOT", "IN"] => Self::NotIn,
            _ => return None,
        };
        Some(op)
    }

    /// The comparison, if it is one of `<`, `<=`, `>`, `>=`, `=`, `!=`.
    fn numeric(self) -> Option<CompareOp> {
        match self {
            Self::Compare(
                op @ (CompareOp::Lt
                | CompareOp::Lte
                | CompareOp::Gt
                | CompareOp::Gte
                | CompareOp::Eq
                | CompareOp::Neq),
            ) => Some(op),
            _ => None,
        }
    }

    /// The comparison, if it is one of `=`, `!=`, `LIKE`, `ILIKE`.
    fn string(self) -> Option<CompareOp> {
        match self {
            Self::Compare(
                op @ (CompareOp::Eq | CompareOp::Neq | CompareOp::Like | CompareOp::ILike),
            ) => Some(op),
            _ => None,
        }
    }
}

/// Compiled patterns of the flat grammar. Build once, share freely.
#[derive(Debug, Clone)]
pub struct FlatFilter {
    and_separator: Regex,
    condition: Regex,
    in_group_separator: Regex,
    order_clause: Regex,
    attribute_order_clause: Regex,
}

impl FlatFilter {
    pub fn new() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            and_separator: Regex::new(AND_SEPARATOR)?,
            condition: Regex::new(CONDITION)?,
            in_group_separator: Regex::new(IN_GROUP_SEPARATOR)?,
            order_clause: Regex::new(ORDER_CLAUSE)?,
            attribute_order_clause: Regex::new(ATTRIBUTE_ORDER_CLAUSE)?,
        })
    }

    /// Compile filter text into a predicate and its inner joins.
    /// Blank text is always true.
    pub fn compile(
        &self,
        text: &str,
        rules: &EntityRuleTable,
        dialect: DialectHints,
    ) -> Result<CompiledFilter> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(CompiledFilter::always());
        }

        let mut joins = JoinSet::prefixed("filter", JoinKind::Inner);
        let mut conjuncts = Vec::new();
        for part in self.and_separator.split(text) {
            conjuncts.push(self.conjunct(part.trim(), rules, dialect, &mut joins)?);
        }

        let predicate = if conjuncts.len() == 1 {
            conjuncts.remove(0)
        } else {
            Predicate::And {
                children: conjuncts,
            }
        };
        Ok(CompiledFilter {
            predicate,
            joins: joins.into_vec(),
        })
    }

    fn conjunct(
        &self,
        part: &str,
        rules: &EntityRuleTable,
        dialect: DialectHints,
        joins: &mut JoinSet,
    ) -> Result<Predicate> {
        let caps = self
            .condition
            .captures(part)
            .ok_or_else(|| malformed(part))?;
        let entity_raw = caps.get(1).map_or("", |m| m.as_str());
        let key = unquote_key(caps.get(2).map_or("", |m| m.as_str()));
        let op_raw = caps.get(3).map_or("", |m| m.as_str());
        let value = caps.get(4).map_or("", |m| m.as_str());
        let op = FlatOp::parse(op_raw).ok_or_else(|| malformed(part))?;

        let entity = parse_entity(entity_raw)
            .filter(|e| rules.allows(*e))
            .ok_or_else(|| {
                QueryError::invalid(
                    ErrorKind::UnknownEntity,
                    format!(
                        "invalid entity type '{}'. Valid values are {}",
                        entity_raw,
                        rules.entity_list()
                    ),
                )
            })?;

        match entity {
            EntityKind::Attribute => self.attribute(key, op, op_raw, value, rules, dialect, joins),
            EntityKind::Metric => {
                let cmp = op
                    .numeric()
                    .ok_or_else(|| invalid_operator("metric", op_raw))?;
                let number = parse_float(value)?;
                let join = joins.require(EntityKind::Metric, key);
                Ok(Predicate::compare(
                    ColumnDescriptor::joined(join, "value"),
                    cmp,
                    number,
                ))
            }
            EntityKind::Param | EntityKind::Tag => {
                let label = if entity == EntityKind::Param {
                    "param"
                } else {
                    "tag"
                };
                let cmp = op.string().ok_or_else(|| invalid_operator(label, op_raw))?;
                let text = parse_string(value)?;
                let join = joins.require(entity, key);
                Ok(string_predicate(
                    ColumnDescriptor::joined(join, "value"),
                    cmp,
                    text,
                    dialect,
                ))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attribute(
        &self,
        key: &str,
        op: FlatOp,
        op_raw: &str,
        value: &str,
        rules: &EntityRuleTable,
        dialect: DialectHints,
        joins: &mut JoinSet,
    ) -> Result<Predicate> {
        let rule = rules.attribute(key).ok_or_else(|| {
            QueryError::invalid(
                ErrorKind::UnknownAttribute,
                format!(
                    "invalid attribute '{}'. Valid values are {}",
                    key,
                    rules.attribute_list()
                ),
            )
        })?;

        match rule.kind {
            AttributeType::Numeric => {
                let cmp = op
                    .numeric()
                    .ok_or_else(|| invalid_operator("numeric attribute", op_raw))?;
                let number = value.parse::<i64>().map_err(|_| {
                    QueryError::invalid(
                        ErrorKind::InvalidValue,
                        format!("invalid numeric value '{}' for attribute '{}'", value, key),
                    )
                })?;
                Ok(Predicate::compare(rules.column(rule.column), cmp, number))
            }
            AttributeType::Text | AttributeType::TagAlias(_) => {
                let cmp = op
                    .string()
                    .ok_or_else(|| invalid_operator("string attribute", op_raw))?;
                let text = parse_string(value)?;
                let column = match rule.kind {
                    AttributeType::TagAlias(tag) => {
                        ColumnDescriptor::joined(joins.require(EntityKind::Tag, tag), "value")
                    }
                    _ => rules.column(rule.column),
                };
                Ok(string_predicate(column, cmp, text, dialect))
            }
            AttributeType::Id => match op {
                FlatOp::In | FlatOp::NotIn => {
                    let literals = self.parse_list(value)?;
                    Ok(Predicate::ListMembership {
                        column: rules.column(rule.column),
                        op: if op == FlatOp::In {
                            ListOp::In
                        } else {
                            ListOp::NotIn
                        },
                        literals,
                    })
                }
                FlatOp::Compare(_) => {
                    let cmp = op
                        .string()
                        .ok_or_else(|| invalid_operator("id attribute", op_raw))?;
                    let text = parse_string(value)?;
                    Ok(string_predicate(rules.column(rule.column), cmp, text, dialect))
                }
            },
        }
    }

    /// `('a', 'b')` to its items, quotes removed.
    fn parse_list(&self, value: &str) -> Result<Vec<Value>> {
        let inner = value
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| {
                QueryError::invalid(
                    ErrorKind::InvalidValue,
                    format!(
                        "while parsing a list in the query, expected a non-empty list of string values, got '{}'",
                        value
                    ),
                )
            })?;
        Ok(self
            .in_group_separator
            .split(inner.trim())
            .filter(|item| !item.is_empty())
            .map(|item| Value::String(item.trim_matches('\'').to_string()))
            .collect())
    }

    pub(crate) fn order_clause(&self) -> &Regex {
        &self.order_clause
    }

    pub(crate) fn attribute_order_clause(&self) -> &Regex {
        &self.attribute_order_clause
    }
}

fn parse_entity(raw: &str) -> Option<EntityKind> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "attribute" | "attributes" | "attr" | "run" => Some(EntityKind::Attribute),
        "metric" | "metrics" => Some(EntityKind::Metric),
        "param" | "params" | "parameter" | "parameters" => Some(EntityKind::Param),
        "tag" | "tags" => Some(EntityKind::Tag),
        _ => None,
    }
}

/// Strip one layer of `"` or `` ` `` quoting from a key.
pub(crate) fn unquote_key(raw: &str) -> &str {
    for q in ['"', '`'] {
        if let Some(inner) = raw.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return inner;
        }
    }
    raw
}

fn parse_string(value: &str) -> Result<String> {
    if value.starts_with('(') {
        return Err(QueryError::invalid(
            ErrorKind::InvalidValue,
            format!("expected a quoted string value, got '{}'", value),
        ));
    }
    for q in ['\'', '"'] {
        if let Some(inner) = value.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return Ok(inner.to_string());
        }
    }
    Ok(value.to_string())
}

fn parse_float(value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .ok_or_else(|| {
            QueryError::invalid(
                ErrorKind::InvalidValue,
                format!("invalid numeric value '{}'", value),
            )
        })
}

fn string_predicate(
    column: ColumnDescriptor,
    op: CompareOp,
    value: String,
    dialect: DialectHints,
) -> Predicate {
    if op == CompareOp::ILike && !dialect.native_ilike {
        Predicate::compare(column.folded(), CompareOp::Like, value.to_lowercase())
    } else {
        Predicate::compare(column, op, value)
    }
}

fn malformed(part: &str) -> QueryError {
    QueryError::invalid(
        ErrorKind::MalformedFilter,
        format!("malformed filter '{}'", part),
    )
}

fn invalid_operator(what: &str, op: &str) -> QueryError {
    QueryError::invalid(
        ErrorKind::InvalidOperator,
        format!("invalid {} comparison operator '{}'", what, op),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runs(text: &str) -> Result<CompiledFilter> {
        FlatFilter::new()
            .unwrap()
            .compile(text, &EntityRuleTable::runs(), DialectHints::sqlite())
    }

    #[test]
    fn test_blank_filter_is_always_true() {
        assert!(runs("  ").unwrap().predicate.is_always());
    }

    #[test]
    fn test_metric_rejects_like() {
        let err = runs("metric.accuracy LIKE '0.9'").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperator);
        assert_eq!(err.to_string(), "invalid metric comparison operator 'LIKE'");
    }

    #[test]
    fn test_string_attribute_rejects_ordering() {
        let err = runs("attribute.status <= 'x'").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperator);
    }

    #[test]
    fn test_unknown_attribute_lists_valid_values() {
        let err = runs("attribute.name = 'x'").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAttribute);
        assert_eq!(
            err.to_string(),
            "invalid attribute 'name'. Valid values are \
             ['run_name','start_time','end_time','status','user_id','artifact_uri','run_id']"
        );
    }

    #[test]
    fn test_unknown_entity() {
        let err = runs("dataset.name = 'x'").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownEntity);
    }

    #[test]
    fn test_malformed_conjunct_is_named() {
        let err = runs("metrics.loss > 1 AND params.lr").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFilter);
        assert_eq!(err.to_string(), "malformed filter 'params.lr'");
    }

    #[test]
    fn test_same_key_shares_join() {
        let compiled =
            runs("metrics.loss > 0.1 and metrics.loss < 0.5 AND params.lr = '0.1'").unwrap();
        assert_eq!(compiled.joins.len(), 2);
        assert_eq!(compiled.joins[0].alias, "filter_0");
        assert_eq!(compiled.joins[0].kind, JoinKind::Inner);
        let Predicate::And { children } = &compiled.predicate else {
            panic!("expected conjunction");
        };
        let aliases: Vec<_> = children
            .iter()
            .map(|c| match c {
                Predicate::Comparison { column, .. } => column.table.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(aliases, vec!["filter_0", "filter_0", "filter_1"]);
    }

    #[test]
    fn test_numeric_attribute_parses_integer() {
        let compiled = runs("attributes.start_time >= 1700000000000").unwrap();
        assert_eq!(
            compiled.predicate,
            Predicate::compare(
                ColumnDescriptor::attribute("runs", "start_time"),
                CompareOp::Gte,
                1_700_000_000_000i64
            )
        );
        assert_eq!(
            runs("start_time > 'yesterday'").unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_metric_value_parsed_as_float() {
        let compiled = runs("metrics.loss <= -0.5").unwrap();
        match compiled.predicate {
            Predicate::Comparison { literal, op, .. } => {
                assert_eq!(op, CompareOp::Lte);
                assert_eq!(literal, json!(-0.5));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(runs("metrics.loss = abc").unwrap_err().kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_run_id_in_list() {
        let compiled = runs("attributes.run_id IN ('a1', 'b2','c3')").unwrap();
        assert_eq!(
            compiled.predicate,
            Predicate::ListMembership {
                column: ColumnDescriptor::attribute("runs", "run_uuid"),
                op: ListOp::In,
                literals: vec![json!("a1"), json!("b2"), json!("c3")],
            }
        );
        let compiled = runs("run_id not in ('a1')").unwrap();
        assert!(matches!(
            compiled.predicate,
            Predicate::ListMembership { op: ListOp::NotIn, .. }
        ));
        assert_eq!(
            runs("status IN ('RUNNING')").unwrap_err().kind(),
            ErrorKind::InvalidOperator
        );
    }

    #[test]
    fn test_string_value_rejects_list() {
        assert_eq!(
            runs("status = ('RUNNING')").unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn test_ilike_rewritten_without_native_support() {
        let compiled = runs("tags.team ILIKE '%Vision%'").unwrap();
        match compiled.predicate {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => {
                assert!(column.fold_case);
                assert_eq!(op, CompareOp::Like);
                assert_eq!(literal, json!("%vision%"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let native = FlatFilter::new()
            .unwrap()
            .compile(
                "tags.team ILIKE '%Vision%'",
                &EntityRuleTable::runs(),
                DialectHints::postgres(),
            )
            .unwrap();
        assert!(matches!(
            native.predicate,
            Predicate::Comparison { op: CompareOp::ILike, .. }
        ));
    }

    #[test]
    fn test_run_name_reads_tag() {
        let compiled = runs("attributes.run_name = 'bert'").unwrap();
        assert_eq!(compiled.joins.len(), 1);
        assert_eq!(compiled.joins[0].entity, EntityKind::Tag);
        assert_eq!(compiled.joins[0].key, "mlflow.runName");
    }

    #[test]
    fn test_quoted_keys() {
        let compiled = runs("params.\"model name\" = 'x' AND tags.`a b` != \"y\"").unwrap();
        let keys: Vec<_> = compiled.joins.iter().map(|j| j.key.as_str()).collect();
        assert_eq!(keys, vec!["model name", "a b"]);
    }

    #[test]
    fn test_experiment_rules() {
        let flat = FlatFilter::new().unwrap();
        let rules = EntityRuleTable::experiments();
        assert!(flat
            .compile("name LIKE 'bert%' AND creation_time > 5", &rules, DialectHints::sqlite())
            .is_ok());
        assert_eq!(
            flat.compile("metrics.loss > 1", &rules, DialectHints::sqlite())
                .unwrap_err()
                .kind(),
            ErrorKind::UnknownEntity
        );
    }
}
