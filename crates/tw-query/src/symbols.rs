//! # Symbol Table
//!
//! Maps expression identifiers to typed columns, one scope per entity the
//! expression language can name (`run`, `metric`). Built once at startup and
//! shared read-only across requests.
//!
//! A scope attribute resolves to one of:
//! - a plain column (`run.name`),
//! - a computed boolean that is already a predicate (`run.archived`),
//! - a constant (`metric.first_step`),
//! - a side-entity collection keyed by subscript (`run.metrics['loss']`).
//!
//! Latest-metric rows keep no separate iteration counter, so `last_step`
//! reads the step of the latest sample and `first_step` is always `0`.
//!
//! A scope may define a wildcard entity: any attribute it does not know
//! resolves to that entity keyed by the attribute name (`run.lr` reads the
//! `lr` param).

use std::collections::HashMap;

use serde_json::Value;

use crate::predicate::{ColumnDescriptor, CompareOp, EntityKind, Predicate};

/// Raw expression for a run's duration in seconds.
pub const RUN_DURATION_EXPR: &str = "(runs.end_time - runs.start_time) / 1000";

#[derive(Debug, Clone)]
pub enum Symbol {
    Column(ColumnDescriptor),
    Computed(Predicate),
    Constant(Value),
    Collection(SideEntity),
}

/// A field of a joined side-entity row.
#[derive(Debug, Clone)]
pub enum RowField {
    Column(&'static str),
    Constant(Value),
}

/// A side entity reached through a join, keyed by name.
///
/// When `fields` is empty the joined row reads as its `value_column`
/// directly (`run.tags.team == 'x'`); otherwise the row must be narrowed
/// with a field (`run.metrics['loss'].last`), and a bare row compares as
/// its value column.
#[derive(Debug, Clone)]
pub struct SideEntity {
    pub entity: EntityKind,
    pub value_column: &'static str,
    pub fields: HashMap<&'static str, RowField>,
}

impl SideEntity {
    pub fn plain(entity: EntityKind) -> Self {
        Self {
            entity,
            value_column: "value",
            fields: HashMap::new(),
        }
    }

    pub fn metrics() -> Self {
        let fields = HashMap::from([
            ("last", RowField::Column("value")),
            ("last_step", RowField::Column("step")),
            ("first_step", RowField::Constant(Value::from(0))),
        ]);
        Self {
            entity: EntityKind::Metric,
            value_column: "value",
            fields,
        }
    }
}

/// One named scope: `run` or `metric`.
#[derive(Debug, Clone)]
pub struct EntityTable {
    pub name: &'static str,
    pub table: &'static str,
    symbols: HashMap<&'static str, Symbol>,
    wildcard: Option<EntityKind>,
}

impl EntityTable {
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            symbols: HashMap::new(),
            wildcard: None,
        }
    }

    pub fn with(mut self, attr: &'static str, symbol: Symbol) -> Self {
        self.symbols.insert(attr, symbol);
        self
    }

    /// Column `column` of this scope's own table, under `attr`.
    pub fn column(self, attr: &'static str, column: &str) -> Self {
        let desc = ColumnDescriptor::attribute(self.table, column);
        self.with(attr, Symbol::Column(desc))
    }

    pub fn with_wildcard(mut self, entity: EntityKind) -> Self {
        self.wildcard = Some(entity);
        self
    }

    pub fn resolve(&self, attr: &str) -> Option<&Symbol> {
        self.symbols.get(attr)
    }

    pub fn wildcard(&self) -> Option<EntityKind> {
        self.wildcard
    }

    /// Known attribute names, sorted. Used in error messages.
    pub fn attribute_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.symbols.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// All scopes an expression may start from.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    scopes: HashMap<&'static str, EntityTable>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, table: EntityTable) -> Self {
        self.scopes.insert(table.name, table);
        self
    }

    pub fn scope(&self, name: &str) -> Option<&EntityTable> {
        self.scopes.get(name)
    }

    /// The `run` and `metric` scopes of the tracking schema.
    pub fn builtin() -> Self {
        Self::new().with_scope(run_scope()).with_scope(metric_scope())
    }
}

fn run_scope() -> EntityTable {
    let archived = Predicate::compare(
        ColumnDescriptor::attribute("runs", "lifecycle_stage"),
        CompareOp::Eq,
        tw_core::LIFECYCLE_DELETED,
    );
    let active = Predicate::compare(
        ColumnDescriptor::attribute("runs", "status"),
        CompareOp::Eq,
        tw_core::STATUS_RUNNING,
    );

    EntityTable::new("run", "runs")
        .column("hash", "run_uuid")
        .column("name", "name")
        .column("status", "status")
        .column("experiment_id", "experiment_id")
        .column("creation_time", "start_time")
        .column("created_at", "start_time")
        .column("end_time", "end_time")
        .column("finalized_at", "end_time")
        .with(
            "experiment",
            Symbol::Column(ColumnDescriptor::attribute("experiments", "name")),
        )
        .with("archived", Symbol::Computed(archived))
        .with("active", Symbol::Computed(active))
        .with(
            "duration",
            Symbol::Column(ColumnDescriptor::computed("runs", RUN_DURATION_EXPR)),
        )
        .with("metrics", Symbol::Collection(SideEntity::metrics()))
        .with("tags", Symbol::Collection(SideEntity::plain(EntityKind::Tag)))
        .with(
            "params",
            Symbol::Collection(SideEntity::plain(EntityKind::Param)),
        )
        .with_wildcard(EntityKind::Param)
}

fn metric_scope() -> EntityTable {
    let table = EntityKind::Metric.table();
    let metric_column = |name: &str| {
        let mut desc = ColumnDescriptor::attribute(table, name);
        desc.entity = EntityKind::Metric;
        Symbol::Column(desc)
    };

    EntityTable::new("metric", table)
        .with("name", metric_column("key"))
        .with("last", metric_column("value"))
        .with("last_step", metric_column("step"))
        .with("first_step", Symbol::Constant(Value::from(0)))
}
