//! `order_by` clauses: `metrics.loss DESC`, `attributes.start_time`, ...
//! Experiment tables take the bare form: `name DESC`, `attr.creation_time`.

use super::rules::{AttributeType, EntityRuleTable, OrderStyle};
use super::{unquote_key, FlatFilter};
use crate::error::{ErrorKind, QueryError, Result};
use crate::predicate::{ColumnDescriptor, EntityKind, JoinKind, JoinRequirement, JoinSet};

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub column: ColumnDescriptor,
    pub descending: bool,
}

/// Sort keys in priority order plus the left-outer joins they read from.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
    pub joins: Vec<JoinRequirement>,
}

impl SortSpec {
    /// Make the ordering total: the primary sort column descending unless
    /// already present, then the id column ascending unless already present.
    pub fn complete(mut self, rules: &EntityRuleTable) -> Self {
        let primary = rules.column(rules.primary_sort);
        if !self.keys.iter().any(|k| k.column == primary) {
            self.keys.push(SortKey {
                column: primary,
                descending: true,
            });
        }
        let id = rules.column(rules.id_column);
        if !self.keys.iter().any(|k| k.column == id) {
            self.keys.push(SortKey {
                column: id,
                descending: false,
            });
        }
        self
    }
}

impl FlatFilter {
    /// Parse `order_by` clauses. The result is not yet total; see
    /// [`SortSpec::complete`].
    pub fn parse_order_by<S: AsRef<str>>(
        &self,
        clauses: &[S],
        rules: &EntityRuleTable,
    ) -> Result<SortSpec> {
        let mut joins = JoinSet::prefixed("order", JoinKind::LeftOuter);
        let mut keys = Vec::with_capacity(clauses.len());

        for clause in clauses {
            let clause = clause.as_ref().trim();
            let invalid = || {
                QueryError::invalid(
                    ErrorKind::MalformedFilter,
                    format!("invalid order_by clause '{}'", clause),
                )
            };
            let (entity, key, direction) = match rules.order_style {
                OrderStyle::Prefixed => {
                    let caps = self.order_clause().captures(clause).ok_or_else(invalid)?;
                    let entity = match caps.get(1).map_or("", |m| m.as_str()) {
                        "metric" => EntityKind::Metric,
                        "param" => EntityKind::Param,
                        "tag" => EntityKind::Tag,
                        _ => EntityKind::Attribute,
                    };
                    (entity, unquote_key(caps.get(2).map_or("", |m| m.as_str())), caps.get(3))
                }
                OrderStyle::AttributeOnly => {
                    let caps = self
                        .attribute_order_clause()
                        .captures(clause)
                        .ok_or_else(invalid)?;
                    (
                        EntityKind::Attribute,
                        caps.get(1).map_or("", |m| m.as_str()),
                        caps.get(2),
                    )
                }
            };
            if !rules.allows(entity) {
                return Err(QueryError::invalid(
                    ErrorKind::UnknownEntity,
                    format!(
                        "invalid order_by entity '{}'. Valid values are {}",
                        entity,
                        rules.entity_list()
                    ),
                ));
            }
            let descending = direction.is_some_and(|m| m.as_str().eq_ignore_ascii_case("DESC"));

            let column = match entity {
                EntityKind::Attribute => {
                    let rule = rules.attribute(key).ok_or_else(|| {
                        QueryError::invalid(
                            ErrorKind::UnknownAttribute,
                            format!(
                                "invalid order_by attribute '{}'. Valid values are {}",
                                key,
                                rules.attribute_list()
                            ),
                        )
                    })?;
                    match rule.kind {
                        AttributeType::TagAlias(tag) => {
                            ColumnDescriptor::joined(joins.require(EntityKind::Tag, tag), "value")
                        }
                        _ => rules.column(rule.column),
                    }
                }
                side => ColumnDescriptor::joined(joins.require(side, key), "value"),
            };
            keys.push(SortKey { column, descending });
        }

        Ok(SortSpec {
            keys,
            joins: joins.into_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(clauses: &[&str]) -> Result<SortSpec> {
        FlatFilter::new()
            .unwrap()
            .parse_order_by(clauses, &EntityRuleTable::runs())
    }

    #[test]
    fn test_empty_order_completes_to_start_time_then_id() {
        let spec = parse(&[]).unwrap().complete(&EntityRuleTable::runs());
        let keys: Vec<_> = spec
            .keys
            .iter()
            .map(|k| (k.column.to_string(), k.descending))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("runs.start_time".to_string(), true),
                ("runs.run_uuid".to_string(), false)
            ]
        );
    }

    #[test]
    fn test_metric_order_uses_left_outer_join() {
        let spec = parse(&["metrics.loss DESC", "params.lr"]).unwrap();
        assert_eq!(spec.joins.len(), 2);
        assert_eq!(spec.joins[0].alias, "order_0");
        assert_eq!(spec.joins[0].kind, JoinKind::LeftOuter);
        assert!(spec.keys[0].descending);
        assert!(!spec.keys[1].descending);
    }

    #[test]
    fn test_explicit_primary_is_not_duplicated() {
        let spec = parse(&["attributes.start_time asc"])
            .unwrap()
            .complete(&EntityRuleTable::runs());
        assert_eq!(spec.keys.len(), 2);
        assert!(!spec.keys[0].descending);
    }

    #[test]
    fn test_malformed_clause() {
        let err = parse(&["metrics.loss sideways"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFilter);
        assert_eq!(
            parse(&["attributes.bogus"]).unwrap_err().kind(),
            ErrorKind::UnknownAttribute
        );
    }

    #[test]
    fn test_experiment_order_completion() {
        let rules = EntityRuleTable::experiments();
        let spec = FlatFilter::new()
            .unwrap()
            .parse_order_by(&["name"], &rules)
            .unwrap()
            .complete(&rules);
        let columns: Vec<_> = spec.keys.iter().map(|k| k.column.to_string()).collect();
        assert_eq!(
            columns,
            vec![
                "experiments.name",
                "experiments.creation_time",
                "experiments.experiment_id"
            ]
        );
    }

    #[test]
    fn test_experiment_order_prefixes_and_direction() {
        let rules = EntityRuleTable::experiments();
        let filter = FlatFilter::new().unwrap();
        for clause in [
            "name DESC",
            "attr.name desc",
            "attribute.name DESC",
            "attributes.name DESC",
        ] {
            let spec = filter.parse_order_by(&[clause], &rules).unwrap();
            assert_eq!(spec.keys.len(), 1, "{}", clause);
            assert_eq!(spec.keys[0].column.to_string(), "experiments.name");
            assert!(spec.keys[0].descending, "{}", clause);
            assert!(spec.joins.is_empty());
        }

        let spec = filter.parse_order_by(&["creation_time asc"], &rules).unwrap();
        assert!(!spec.keys[0].descending);

        let err = filter.parse_order_by(&["tags.owner"], &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFilter);
        let err = filter.parse_order_by(&["bogus"], &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAttribute);
    }
}
