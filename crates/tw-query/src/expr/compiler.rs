//! # Predicate Compiler
//!
//! Walks an [`Expr`] and resolves every node to an [`Operand`]. Each rule
//! matches on operand shape exhaustively; a shape a rule cannot use is a
//! structured error, never a silent fallthrough.
//!
//! Comparison rules, in order:
//! 1. Chains desugar pairwise: `a < b <= c` is `(a < b) and (b <= c)`, with
//!    `b` compiled once.
//! 2. A column on the right and a literal on the left swap sides with the
//!    operator mirrored (`5 < x` is `x > 5`).
//! 3. A comparison with no column on either side is rejected.
//! 4. `in` / `not in` need a literal list on the right, except that a
//!    string literal on the left tests substring containment.
//! 5. `and`, `or` and `not` need conditions as operands.

use serde_json::Value;

use super::ast::{BoolOp, CmpOp, Expr, ExprKind, Literal, Pos};
use super::functions::{CallContext, Function, FunctionRegistry};
use super::parser;
use crate::error::{ErrorKind, Location, QueryError, Result};
use crate::predicate::{
    ColumnDescriptor, CompareOp, JoinKind, JoinRequirement, JoinSet, ListOp, Predicate,
};
use crate::symbols::{EntityTable, RowField, SideEntity, Symbol, SymbolTable};

/// What an expression node compiled to.
#[derive(Debug, Clone)]
pub enum Operand<'s> {
    Column(ColumnDescriptor),
    Literal(Value),
    Predicate(Predicate),
    Function(Function),
    /// A named scope such as `run`.
    Scope(&'s EntityTable),
    /// A side-entity collection awaiting a key: `run.metrics`.
    Collection(&'s SideEntity),
    /// One keyed side-entity row: `run.metrics['loss']`.
    Row {
        side: &'s SideEntity,
        join: JoinRequirement,
    },
    /// A function namespace such as `re`.
    Namespace(String),
    /// A bound column method: `run.name.startswith`.
    Method {
        column: ColumnDescriptor,
        method: Method,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    StartsWith,
    EndsWith,
}

impl<'s> Operand<'s> {
    /// Collapse a keyed row to its value column; everything else is unchanged.
    pub fn comparable(self) -> Self {
        match self {
            Operand::Row { side, join } => {
                Operand::Column(ColumnDescriptor::joined(&join, side.value_column))
            }
            other => other,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operand::Column(c) => format!("column {}", c),
            Operand::Literal(v) => format!("literal {}", v),
            Operand::Predicate(_) => "condition".to_string(),
            Operand::Function(f) => format!("function {}", f.name),
            Operand::Scope(s) => format!("scope '{}'", s.name),
            Operand::Collection(side) => format!("{} collection", side.entity),
            Operand::Row { side, join } => format!("{} '{}'", side.entity, join.key),
            Operand::Namespace(ns) => format!("namespace '{}'", ns),
            Operand::Method { method, .. } => match method {
                Method::StartsWith => "method startswith".to_string(),
                Method::EndsWith => "method endswith".to_string(),
            },
        }
    }
}

/// A compile failure before the statement text is attached.
#[derive(Debug)]
struct Fault {
    kind: ErrorKind,
    pos: Pos,
    message: String,
}

impl Fault {
    fn new(kind: ErrorKind, pos: Pos, message: impl Into<String>) -> Self {
        Self {
            kind,
            pos,
            message: message.into(),
        }
    }
}

type Step<T> = std::result::Result<T, Fault>;

/// Compiles one or more expressions against a shared join set.
pub struct Compiler<'s> {
    symbols: &'s SymbolTable,
    functions: &'s FunctionRegistry,
    ctx: CallContext,
    joins: JoinSet,
}

impl<'s> Compiler<'s> {
    pub fn new(
        symbols: &'s SymbolTable,
        functions: &'s FunctionRegistry,
        tz_offset_minutes: i32,
    ) -> Self {
        Self {
            symbols,
            functions,
            ctx: CallContext { tz_offset_minutes },
            joins: JoinSet::per_entity(JoinKind::LeftOuter),
        }
    }

    /// Compile `text` to a predicate. Blank text is always true.
    pub fn compile_text(&mut self, text: &str) -> Result<Predicate> {
        if text.trim().is_empty() {
            return Ok(Predicate::always());
        }
        let expr = parser::parse(text)?;
        let compiled = self.operand(&expr).and_then(|op| match op {
            Operand::Predicate(p) => Ok(p),
            other => Err(Fault::new(
                ErrorKind::NotABooleanExpression,
                expr.pos,
                format!("expression must be a condition, found {}", other.describe()),
            )),
        });
        compiled.map_err(|f| QueryError::Compile {
            kind: f.kind,
            location: Location {
                statement: text.to_string(),
                line: f.pos.line,
                offset: f.pos.col,
            },
            message: f.message,
        })
    }

    /// The joins registered so far, in registration order.
    pub fn finish(self) -> Vec<JoinRequirement> {
        self.joins.into_vec()
    }

    // =========================================================================
    // Node dispatch
    // =========================================================================

    fn operand(&mut self, expr: &Expr) -> Step<Operand<'s>> {
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(Operand::Literal(literal_value(lit))),
            ExprKind::ListLiteral(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    match self.operand(item)? {
                        Operand::Literal(v) => values.push(v),
                        other => {
                            return Err(Fault::new(
                                ErrorKind::InvalidOperand,
                                item.pos,
                                format!("list items must be literals, found {}", other.describe()),
                            ))
                        }
                    }
                }
                Ok(Operand::Literal(Value::Array(values)))
            }
            ExprKind::Name(name) => self.name(name, expr.pos),
            ExprKind::Attribute { target, attr } => {
                let base = self.operand(target)?;
                self.attribute(base, attr, expr.pos)
            }
            ExprKind::Subscript { target, index } => {
                let base = self.operand(target)?;
                let key = match self.operand(index)? {
                    Operand::Literal(Value::String(key)) => key,
                    other => {
                        return Err(Fault::new(
                            ErrorKind::InvalidOperand,
                            index.pos,
                            format!(
                                "subscript must be a string literal, found {}",
                                other.describe()
                            ),
                        ))
                    }
                };
                match base {
                    Operand::Collection(side) => Ok(self.side_row(side, &key)),
                    other => Err(Fault::new(
                        ErrorKind::InvalidOperand,
                        expr.pos,
                        format!("{} is not subscriptable", other.describe()),
                    )),
                }
            }
            ExprKind::Call { func, args } => self.call(func, args, expr.pos),
            ExprKind::UnaryNot(inner) => match self.operand(inner)? {
                Operand::Predicate(p) => Ok(Operand::Predicate(p.negate())),
                other => Err(not_boolean("not", inner.pos, &other)),
            },
            ExprKind::BoolOp { op, operands } => {
                let word = match op {
                    BoolOp::And => "and",
                    BoolOp::Or => "or",
                };
                let mut children = Vec::with_capacity(operands.len());
                for o in operands {
                    match self.operand(o)? {
                        Operand::Predicate(p) => children.push(p),
                        other => return Err(not_boolean(word, o.pos, &other)),
                    }
                }
                Ok(Operand::Predicate(match op {
                    BoolOp::And => Predicate::And { children },
                    BoolOp::Or => Predicate::Or { children },
                }))
            }
            ExprKind::Compare {
                left,
                ops,
                comparators,
            } => self.compare(left, ops, comparators),
        }
    }

    // =========================================================================
    // Names, attributes, calls
    // =========================================================================

    fn name(&self, name: &str, pos: Pos) -> Step<Operand<'s>> {
        if let Some(scope) = self.symbols.scope(name) {
            return Ok(Operand::Scope(scope));
        }
        if let Some(f) = self.functions.get(name) {
            return Ok(Operand::Function(f));
        }
        if self.functions.is_namespace(name) {
            return Ok(Operand::Namespace(name.to_string()));
        }
        Err(Fault::new(
            ErrorKind::UnknownAttribute,
            pos,
            format!("unknown identifier '{}'", name),
        ))
    }

    fn attribute(&mut self, base: Operand<'s>, attr: &str, pos: Pos) -> Step<Operand<'s>> {
        match base {
            Operand::Scope(scope) => match scope.resolve(attr) {
                Some(Symbol::Column(c)) => Ok(Operand::Column(c.clone())),
                Some(Symbol::Computed(p)) => Ok(Operand::Predicate(p.clone())),
                Some(Symbol::Constant(v)) => Ok(Operand::Literal(v.clone())),
                Some(Symbol::Collection(side)) => Ok(Operand::Collection(side)),
                None => match scope.wildcard() {
                    Some(entity) => {
                        let join = self.joins.require(entity, attr);
                        Ok(Operand::Column(ColumnDescriptor::joined(join, "value")))
                    }
                    None => Err(Fault::new(
                        ErrorKind::UnknownAttribute,
                        pos,
                        format!(
                            "unknown attribute '{}' of '{}', expected one of {:?}",
                            attr,
                            scope.name,
                            scope.attribute_names()
                        ),
                    )),
                },
            },
            Operand::Collection(side) => Ok(self.side_row(side, attr)),
            Operand::Row { side, join } => match side.fields.get(attr) {
                Some(RowField::Column(column)) => {
                    Ok(Operand::Column(ColumnDescriptor::joined(&join, column)))
                }
                Some(RowField::Constant(v)) => Ok(Operand::Literal(v.clone())),
                None => Err(Fault::new(
                    ErrorKind::UnknownAttribute,
                    pos,
                    format!("unknown attribute '{}' of {} '{}'", attr, side.entity, join.key),
                )),
            },
            Operand::Column(column) => {
                let method = match attr {
                    "startswith" => Method::StartsWith,
                    "endswith" => Method::EndsWith,
                    _ => {
                        return Err(Fault::new(
                            ErrorKind::UnknownAttribute,
                            pos,
                            format!("unknown attribute '{}' of column {}", attr, column),
                        ))
                    }
                };
                Ok(Operand::Method { column, method })
            }
            Operand::Namespace(ns) => {
                let full = format!("{}.{}", ns, attr);
                self.functions.get(&full).map(Operand::Function).ok_or_else(|| {
                    Fault::new(
                        ErrorKind::UnknownAttribute,
                        pos,
                        format!("unknown function '{}'", full),
                    )
                })
            }
            other @ (Operand::Literal(_)
            | Operand::Predicate(_)
            | Operand::Function(_)
            | Operand::Method { .. }) => Err(Fault::new(
                ErrorKind::InvalidOperand,
                pos,
                format!("{} has no attribute '{}'", other.describe(), attr),
            )),
        }
    }

    fn side_row(&mut self, side: &'s SideEntity, key: &str) -> Operand<'s> {
        let join = self.joins.require(side.entity, key).clone();
        if side.fields.is_empty() {
            Operand::Column(ColumnDescriptor::joined(&join, side.value_column))
        } else {
            Operand::Row { side, join }
        }
    }

    fn call(&mut self, func: &Expr, args: &[Expr], pos: Pos) -> Step<Operand<'s>> {
        match self.operand(func)? {
            Operand::Function(f) => {
                if args.len() < f.min_args || args.len() > f.max_args {
                    return Err(Fault::new(
                        ErrorKind::InvalidOperand,
                        pos,
                        format!(
                            "{}() takes {} to {} arguments, {} given",
                            f.name,
                            f.min_args,
                            f.max_args,
                            args.len()
                        ),
                    ));
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.operand(arg)?);
                }
                (f.apply)(&values, &self.ctx)
                    .map_err(|m| Fault::new(ErrorKind::InvalidOperand, pos, m))
            }
            Operand::Method { column, method } => {
                let needle = match args {
                    [arg] => match self.operand(arg)? {
                        Operand::Literal(Value::String(s)) => s,
                        other => {
                            return Err(Fault::new(
                                ErrorKind::InvalidOperand,
                                arg.pos,
                                format!("expected a string literal, found {}", other.describe()),
                            ))
                        }
                    },
                    _ => {
                        return Err(Fault::new(
                            ErrorKind::InvalidOperand,
                            pos,
                            format!("expected exactly one argument, {} given", args.len()),
                        ))
                    }
                };
                let pattern = match method {
                    Method::StartsWith => format!("{}%", needle),
                    Method::EndsWith => format!("%{}", needle),
                };
                Ok(Operand::Predicate(Predicate::compare(
                    column,
                    CompareOp::Like,
                    pattern,
                )))
            }
            other => Err(Fault::new(
                ErrorKind::InvalidOperand,
                pos,
                format!("{} is not callable", other.describe()),
            )),
        }
    }

    // =========================================================================
    // Comparisons
    // =========================================================================

    fn compare(&mut self, left: &Expr, ops: &[CmpOp], comparators: &[Expr]) -> Step<Operand<'s>> {
        let mut operands = Vec::with_capacity(comparators.len() + 1);
        operands.push((self.operand(left)?.comparable(), left.pos));
        for c in comparators {
            operands.push((self.operand(c)?.comparable(), c.pos));
        }

        let mut parts = Vec::with_capacity(ops.len());
        for (i, op) in ops.iter().enumerate() {
            let (lhs, pos) = operands[i].clone();
            let (rhs, _) = operands[i + 1].clone();
            parts.push(pairwise(*op, lhs, rhs, pos)?);
        }

        let predicate = if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::And { children: parts }
        };
        Ok(Operand::Predicate(predicate))
    }
}

fn pairwise(op: CmpOp, lhs: Operand<'_>, rhs: Operand<'_>, pos: Pos) -> Step<Predicate> {
    match (lhs, rhs) {
        (Operand::Column(column), rhs) => column_compare(column, op, rhs, pos),
        (Operand::Literal(Value::String(needle)), Operand::Column(column))
            if matches!(op, CmpOp::In | CmpOp::NotIn) =>
        {
            let contains = Predicate::compare(column, CompareOp::Like, format!("%{}%", needle));
            Ok(if op == CmpOp::In {
                contains
            } else {
                contains.negate()
            })
        }
        (Operand::Literal(lit), Operand::Column(column)) => match mirrored(op) {
            Some(op) => column_compare(column, op, Operand::Literal(lit), pos),
            None => Err(Fault::new(
                ErrorKind::InvalidOperand,
                pos,
                format!("'{}' needs a list literal on the right", op.as_str()),
            )),
        },
        (Operand::Predicate(p), Operand::Literal(Value::Bool(b)))
        | (Operand::Literal(Value::Bool(b)), Operand::Predicate(p)) => match op {
            CmpOp::Eq | CmpOp::Is => Ok(if b { p } else { p.negate() }),
            CmpOp::NotEq | CmpOp::IsNot => Ok(if b { p.negate() } else { p }),
            _ => Err(Fault::new(
                ErrorKind::InvalidOperand,
                pos,
                format!("a condition cannot be compared with '{}'", op.as_str()),
            )),
        },
        (lhs, rhs) => Err(Fault::new(
            ErrorKind::InvalidOperand,
            pos,
            format!(
                "cannot compare {} with {}: one side must be a column",
                lhs.describe(),
                rhs.describe()
            ),
        )),
    }
}

fn column_compare(
    column: ColumnDescriptor,
    op: CmpOp,
    rhs: Operand<'_>,
    pos: Pos,
) -> Step<Predicate> {
    let cmp = match op {
        CmpOp::Eq | CmpOp::Is => CompareOp::Eq,
        CmpOp::NotEq | CmpOp::IsNot => CompareOp::Neq,
        CmpOp::Lt => CompareOp::Lt,
        CmpOp::LtE => CompareOp::Lte,
        CmpOp::Gt => CompareOp::Gt,
        CmpOp::GtE => CompareOp::Gte,
        CmpOp::In | CmpOp::NotIn => {
            let list_op = if op == CmpOp::In {
                ListOp::In
            } else {
                ListOp::NotIn
            };
            return match rhs {
                Operand::Literal(Value::Array(literals)) => Ok(Predicate::ListMembership {
                    column,
                    op: list_op,
                    literals,
                }),
                other => Err(Fault::new(
                    ErrorKind::InvalidOperand,
                    pos,
                    format!(
                        "'{}' needs a list literal on the right, found {}",
                        op.as_str(),
                        other.describe()
                    ),
                )),
            };
        }
    };
    match rhs {
        Operand::Literal(Value::Array(_)) => Err(Fault::new(
            ErrorKind::InvalidOperand,
            pos,
            format!("a list literal cannot be compared with '{}'", op.as_str()),
        )),
        Operand::Literal(literal) => Ok(Predicate::Comparison {
            column,
            op: cmp,
            literal,
        }),
        other => Err(Fault::new(
            ErrorKind::InvalidOperand,
            pos,
            format!("cannot compare column {} with {}", column, other.describe()),
        )),
    }
}

/// The operator that holds with sides swapped. `None` for list operators.
fn mirrored(op: CmpOp) -> Option<CmpOp> {
    match op {
        CmpOp::Lt => Some(CmpOp::Gt),
        CmpOp::LtE => Some(CmpOp::GtE),
        CmpOp::Gt => Some(CmpOp::Lt),
        CmpOp::GtE => Some(CmpOp::LtE),
        CmpOp::Eq | CmpOp::NotEq | CmpOp::Is | CmpOp::IsNot => Some(op),
        CmpOp::In | CmpOp::NotIn => None,
    }
}

fn not_boolean(word: &str, pos: Pos, operand: &Operand<'_>) -> Fault {
    Fault::new(
        ErrorKind::NotABooleanExpression,
        pos,
        format!(
            "'{}' needs conditions as operands, found {}",
            word,
            operand.describe()
        ),
    )
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(i) => Value::from(*i),
        Literal::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Literal::Str(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::None => Value::Null,
    }
}
