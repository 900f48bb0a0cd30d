//! Per-entity validation tables for flat filters.

use crate::predicate::{ColumnDescriptor, EntityKind};

/// How an attribute key may be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    /// Ordering and equality operators; value parsed as an integer.
    Numeric,
    /// `=`, `!=`, `LIKE`, `ILIKE`; value is a quoted or bare string.
    Text,
    /// Like `Text`, plus `IN` / `NOT IN` over a parenthesised list.
    Id,
    /// Like `Text`, but stored as the tag with this key.
    TagAlias(&'static str),
}

#[derive(Debug, Clone)]
pub struct AttributeRule {
    pub name: &'static str,
    pub column: &'static str,
    pub kind: AttributeType,
}

impl AttributeRule {
    const fn new(name: &'static str, column: &'static str, kind: AttributeType) -> Self {
        Self { name, column, kind }
    }
}

/// Shape of the `order_by` clauses a table accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStyle {
    /// `<entity>s?.<key> [ASC|DESC]`, any allowed entity.
    Prefixed,
    /// `[attr.|attribute.|attributes.]<key> [ASC|DESC]`, attributes only.
    AttributeOnly,
}

/// Which keys and entities a flat filter over one table may reference.
#[derive(Debug, Clone)]
pub struct EntityRuleTable {
    pub table: &'static str,
    /// Unique id column, the final tie-break of every ordering.
    pub id_column: &'static str,
    /// Default primary sort column.
    pub primary_sort: &'static str,
    pub order_style: OrderStyle,
    attributes: Vec<AttributeRule>,
    entities: &'static [EntityKind],
}

impl EntityRuleTable {
    pub fn runs() -> Self {
        Self {
            table: "runs",
            id_column: "run_uuid",
            primary_sort: "start_time",
            order_style: OrderStyle::Prefixed,
            attributes: vec![
                AttributeRule::new("run_name", "name", AttributeType::TagAlias("mlflow.runName")),
                AttributeRule::new("start_time", "start_time", AttributeType::Numeric),
                AttributeRule::new("end_time", "end_time", AttributeType::Numeric),
                AttributeRule::new("status", "status", AttributeType::Text),
                AttributeRule::new("user_id", "user_id", AttributeType::Text),
                AttributeRule::new("artifact_uri", "artifact_uri", AttributeType::Text),
                AttributeRule::new("run_id", "run_uuid", AttributeType::Id),
            ],
            entities: &[
                EntityKind::Attribute,
                EntityKind::Metric,
                EntityKind::Param,
                EntityKind::Tag,
            ],
        }
    }

    pub fn experiments() -> Self {
        Self {
            table: "experiments",
            id_column: "experiment_id",
            primary_sort: "creation_time",
            order_style: OrderStyle::AttributeOnly,
            attributes: vec![
                AttributeRule::new("name", "name", AttributeType::Text),
                AttributeRule::new("creation_time", "creation_time", AttributeType::Numeric),
                AttributeRule::new("last_update_time", "last_update_time", AttributeType::Numeric),
            ],
            entities: &[EntityKind::Attribute, EntityKind::Tag],
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeRule> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn allows(&self, entity: EntityKind) -> bool {
        self.entities.contains(&entity)
    }

    pub fn column(&self, name: &str) -> ColumnDescriptor {
        ColumnDescriptor::attribute(self.table, name)
    }

    /// `['a','b']`, as quoted in error messages.
    pub fn attribute_list(&self) -> String {
        let names: Vec<String> = self
            .attributes
            .iter()
            .map(|a| format!("'{}'", a.name))
            .collect();
        format!("[{}]", names.join(","))
    }

    pub fn entity_list(&self) -> String {
        let names: Vec<String> = self
            .entities
            .iter()
            .rev()
            .map(|e| match e {
                EntityKind::Param => "'parameter'".to_string(),
                other => format!("'{}'", other),
            })
            .collect();
        format!("[{}]", names.join(", "))
    }
}

/// What the storage dialect can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DialectHints {
    /// `ILIKE` is supported; otherwise it is rewritten to
    /// `LOWER(column) LIKE lower(value)`.
    pub native_ilike: bool,
}

impl DialectHints {
    pub fn postgres() -> Self {
        Self { native_ilike: true }
    }

    pub fn sqlite() -> Self {
        Self {
            native_ilike: false,
        }
    }

    /// Hints for a dialect by name. Unknown names get the conservative set.
    pub fn named(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Self::postgres(),
            _ => Self::sqlite(),
        }
    }
}
