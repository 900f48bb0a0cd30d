//! # Predicate Tree
//!
//! The backend-neutral output of both filter grammars. A tree of comparisons
//! over [`ColumnDescriptor`]s joined by boolean connectives, plus the set of
//! side-entity joins the columns refer to. Stores turn this into physical
//! joins and where-clauses; nothing here knows about SQL.

use serde::Serialize;
use serde_json::Value;

// =============================================================================
// Columns
// =============================================================================

/// The four kinds of entity a filter can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Attribute,
    Tag,
    Param,
    Metric,
}

impl EntityKind {
    /// Prefix used when naming joins for this entity.
    pub fn alias_prefix(self) -> &'static str {
        match self {
            Self::Attribute => "attributes",
            Self::Tag => "tags",
            Self::Param => "params",
            Self::Metric => "metrics",
        }
    }

    /// Physical table backing this entity.
    pub fn table(self) -> &'static str {
        match self {
            Self::Attribute => "runs",
            Self::Tag => "tags",
            Self::Param => "params",
            Self::Metric => "latest_metrics",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Attribute => "attribute",
            Self::Tag => "tag",
            Self::Param => "param",
            Self::Metric => "metric",
        };
        f.write_str(name)
    }
}

/// A resolved, typed reference to a physical column.
///
/// For side entities `table` is the join alias, so two descriptors with the
/// same alias always read the same joined row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnDescriptor {
    pub entity: EntityKind,
    /// Table or join alias the column is read from.
    pub table: String,
    /// Physical column name, or the raw expression for computed columns.
    pub name: String,
    pub join_alias: Option<String>,
    pub computed: bool,
    /// Compare `LOWER(column)` instead of the column itself.
    pub fold_case: bool,
}

impl ColumnDescriptor {
    pub fn attribute(table: &str, name: &str) -> Self {
        Self {
            entity: EntityKind::Attribute,
            table: table.to_string(),
            name: name.to_string(),
            join_alias: None,
            computed: false,
            fold_case: false,
        }
    }

    /// A column computed from other columns of `table`.
    pub fn computed(table: &str, expression: &str) -> Self {
        Self {
            computed: true,
            ..Self::attribute(table, expression)
        }
    }

    /// The `name` column of a joined side-entity row.
    pub fn joined(join: &JoinRequirement, name: &str) -> Self {
        Self {
            entity: join.entity,
            table: join.alias.clone(),
            name: name.to_string(),
            join_alias: Some(join.alias.clone()),
            computed: false,
            fold_case: false,
        }
    }

    pub fn folded(self) -> Self {
        Self {
            fold_case: true,
            ..self
        }
    }
}

impl std::fmt::Display for ColumnDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.computed {
            write!(f, "{}", self.name)
        } else if self.fold_case {
            write!(f, "LOWER({}.{})", self.table, self.name)
        } else {
            write!(f, "{}.{}", self.table, self.name)
        }
    }
}

// =============================================================================
// Operators
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// SQL `LIKE` with `%` and `_` wildcards.
    Like,
    /// Case-insensitive `LIKE`, for dialects that support it natively.
    ILike,
    /// Regular-expression match.
    Regex,
}

impl CompareOp {
    /// The operator that holds with operands swapped: `a < b` iff `b > a`.
    /// `None` for operators that are not symmetric in this sense.
    pub fn reversed(self) -> Option<Self> {
        match self {
            Self::Eq => Some(Self::Eq),
            Self::Neq => Some(Self::Neq),
            Self::Lt => Some(Self::Gt),
            Self::Lte => Some(Self::Gte),
            Self::Gt => Some(Self::Lt),
            Self::Gte => Some(Self::Lte),
            Self::Like | Self::ILike | Self::Regex => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
            Self::Regex => "REGEXP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOp {
    In,
    NotIn,
}

// =============================================================================
// Tree
// =============================================================================

/// A composable boolean condition over resolved columns.
///
/// An empty `And` is always true; an empty `Or` is always false.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Predicate {
    Comparison {
        column: ColumnDescriptor,
        op: CompareOp,
        literal: Value,
    },
    ListMembership {
        column: ColumnDescriptor,
        op: ListOp,
        literals: Vec<Value>,
    },
    And {
        children: Vec<Predicate>,
    },
    Or {
        children: Vec<Predicate>,
    },
    Not {
        child: Box<Predicate>,
    },
}

impl Predicate {
    /// The predicate that matches every row.
    pub fn always() -> Self {
        Self::And {
            children: Vec::new(),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Self::And { children } if children.is_empty())
    }

    pub fn compare(column: ColumnDescriptor, op: CompareOp, literal: impl Into<Value>) -> Self {
        Self::Comparison {
            column,
            op,
            literal: literal.into(),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not {
            child: Box::new(self),
        }
    }

    /// Conjoin two predicates, dropping always-true sides.
    pub fn and(self, other: Predicate) -> Self {
        match (self.is_always(), other.is_always()) {
            (true, _) => other,
            (_, true) => self,
            _ => Self::And {
                children: vec![self, other],
            },
        }
    }

    /// Nesting depth, for logging.
    pub fn depth(&self) -> usize {
        match self {
            Self::Comparison { .. } | Self::ListMembership { .. } => 1,
            Self::And { children } | Self::Or { children } => {
                1 + children.iter().map(Predicate::depth).max().unwrap_or(0)
            }
            Self::Not { child } => 1 + child.depth(),
        }
    }

    /// Every column the tree reads.
    pub fn columns(&self) -> Vec<&ColumnDescriptor> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnDescriptor>) {
        match self {
            Self::Comparison { column, .. } | Self::ListMembership { column, .. } => {
                out.push(column)
            }
            Self::And { children } | Self::Or { children } => {
                for c in children {
                    c.collect_columns(out);
                }
            }
            Self::Not { child } => child.collect_columns(out),
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Comparison {
                column,
                op,
                literal,
            } => write!(f, "{} {} {}", column, op.as_str(), literal),
            Self::ListMembership {
                column,
                op,
                literals,
            } => {
                let op = match op {
                    ListOp::In => "IN",
                    ListOp::NotIn => "NOT IN",
                };
                let items: Vec<String> = literals.iter().map(|v| v.to_string()).collect();
                write!(f, "{} {} ({})", column, op, items.join(", "))
            }
            Self::And { children } if children.is_empty() => f.write_str("TRUE"),
            Self::Or { children } if children.is_empty() => f.write_str("FALSE"),
            Self::And { children } | Self::Or { children } => {
                let sep = if matches!(self, Self::And { .. }) {
                    " AND "
                } else {
                    " OR "
                };
                let parts: Vec<String> = children.iter().map(|c| format!("({})", c)).collect();
                f.write_str(&parts.join(sep))
            }
            Self::Not { child } => write!(f, "NOT ({})", child),
        }
    }
}

// =============================================================================
// Joins
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Row must exist: filtering on a side entity.
    Inner,
    /// Row may be absent: ordering, or filters that tolerate `None`.
    LeftOuter,
}

/// One side-entity join a compiled query needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinRequirement {
    pub entity: EntityKind,
    pub key: String,
    pub alias: String,
    pub kind: JoinKind,
}

/// Joins registered while compiling one query, deduplicated by
/// `(entity, key)` so repeated references share a single alias.
#[derive(Debug, Clone)]
pub struct JoinSet {
    prefix: Option<&'static str>,
    kind: JoinKind,
    joins: Vec<JoinRequirement>,
}

impl JoinSet {
    /// Aliases are named `{entity prefix}_{n}`.
    pub fn per_entity(kind: JoinKind) -> Self {
        Self {
            prefix: None,
            kind,
            joins: Vec::new(),
        }
    }

    /// Aliases are named `{prefix}_{n}` regardless of entity.
    pub fn prefixed(prefix: &'static str, kind: JoinKind) -> Self {
        Self {
            prefix: Some(prefix),
            kind,
            joins: Vec::new(),
        }
    }

    /// Return the join for `(entity, key)`, registering it if new.
    pub fn require(&mut self, entity: EntityKind, key: &str) -> &JoinRequirement {
        let idx = match self
            .joins
            .iter()
            .position(|j| j.entity == entity && j.key == key)
        {
            Some(idx) => idx,
            None => {
                let prefix = self.prefix.unwrap_or_else(|| entity.alias_prefix());
                let alias = format!("{}_{}", prefix, self.joins.len());
                self.joins.push(JoinRequirement {
                    entity,
                    key: key.to_string(),
                    alias,
                    kind: self.kind,
                });
                self.joins.len() - 1
            }
        };
        &self.joins[idx]
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn into_vec(self) -> Vec<JoinRequirement> {
        self.joins
    }
}

/// A compiled filter: the tree and the joins its columns refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub predicate: Predicate,
    pub joins: Vec<JoinRequirement>,
}

impl CompiledFilter {
    pub fn always() -> Self {
        Self {
            predicate: Predicate::always(),
            joins: Vec::new(),
        }
    }
}
