//! # Expression Language
//!
//! The Python-flavoured filter language of the run explorer:
//!
//! ```text
//! run.metrics['loss'].last < 0.1 and run.tags.team == 'vision'
//!     and run.creation_time >= datetime(2024, 3, 1)
//! ```
//!
//! Text is tokenized by [`lexer`], parsed by [`parser`] into an [`ast::Expr`],
//! and compiled by [`compiler`] against a [`SymbolTable`] and a
//! [`FunctionRegistry`] into a [`CompiledFilter`].

pub mod ast;
pub mod compiler;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use compiler::{Compiler, Operand};
pub use functions::{CallContext, Function, FunctionRegistry};

use crate::error::Result;
use crate::predicate::CompiledFilter;
use crate::symbols::SymbolTable;

/// Compile expression text into a predicate tree and its joins.
///
/// Blank text compiles to the always-true predicate.
pub fn compile(
    text: &str,
    symbols: &SymbolTable,
    functions: &FunctionRegistry,
    tz_offset_minutes: i32,
) -> Result<CompiledFilter> {
    let mut compiler = Compiler::new(symbols, functions, tz_offset_minutes);
    let predicate = compiler.compile_text(text)?;
    Ok(CompiledFilter {
        predicate,
        joins: compiler.finish(),
    })
}

/// A filter conjoined to every query that does not mention `guard`.
#[derive(Debug, Clone)]
pub struct DefaultFilter {
    pub guard: String,
    pub expression: String,
}

/// Symbols, functions and an optional default filter, bundled for reuse
/// across requests.
#[derive(Debug, Clone)]
pub struct ExpressionCompiler {
    symbols: SymbolTable,
    functions: FunctionRegistry,
    default_filter: Option<DefaultFilter>,
}

impl ExpressionCompiler {
    pub fn new(symbols: SymbolTable, functions: FunctionRegistry) -> Self {
        Self {
            symbols,
            functions,
            default_filter: None,
        }
    }

    /// Conjoin `expression` to every query whose text does not contain `guard`,
    /// e.g. hide archived runs unless the query asks about `run.archived`.
    pub fn with_default_filter(mut self, guard: &str, expression: &str) -> Self {
        self.default_filter = Some(DefaultFilter {
            guard: guard.to_string(),
            expression: expression.to_string(),
        });
        self
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn compile(&self, text: &str, tz_offset_minutes: i32) -> Result<CompiledFilter> {
        let mut compiler = Compiler::new(&self.symbols, &self.functions, tz_offset_minutes);
        let mut predicate = compiler.compile_text(text)?;
        if let Some(default) = &self.default_filter {
            if !text.contains(&default.guard) {
                predicate = predicate.and(compiler.compile_text(&default.expression)?);
            }
        }
        let joins = compiler.finish();
        tracing::debug!(
            joins = joins.len(),
            depth = predicate.depth(),
            "compiled expression"
        );
        Ok(CompiledFilter { predicate, joins })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::predicate::{
        ColumnDescriptor, CompareOp, EntityKind, JoinKind, ListOp, Predicate,
    };
    use crate::symbols::RUN_DURATION_EXPR;
    use serde_json::{json, Value};

    fn compile_ok(text: &str) -> CompiledFilter {
        compile(
            text,
            &SymbolTable::builtin(),
            &FunctionRegistry::builtin(),
            0,
        )
        .unwrap()
    }

    fn compile_err(text: &str) -> ErrorKind {
        compile(
            text,
            &SymbolTable::builtin(),
            &FunctionRegistry::builtin(),
            0,
        )
        .unwrap_err()
        .kind()
    }

    fn duration() -> ColumnDescriptor {
        ColumnDescriptor::computed("runs", RUN_DURATION_EXPR)
    }

    #[test]
    fn test_empty_text_is_always_true() {
        let compiled = compile_ok("   ");
        assert!(compiled.predicate.is_always());
        assert!(compiled.joins.is_empty());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let text = "run.metrics['loss'].last < 1 and run.tags.team == 'a' or run.lr > 0.1";
        assert_eq!(compile_ok(text), compile_ok(text));
    }

    #[test]
    fn test_operand_order_normalization() {
        let a = compile_ok("5 < run.duration");
        let b = compile_ok("run.duration > 5");
        assert_eq!(a, b);
        assert_eq!(
            a.predicate,
            Predicate::compare(duration(), CompareOp::Gt, 5)
        );
    }

    #[test]
    fn test_chained_comparison() {
        let compiled = compile_ok("1 < run.duration < 10");
        assert_eq!(
            compiled.predicate,
            Predicate::And {
                children: vec![
                    Predicate::compare(duration(), CompareOp::Gt, 1),
                    Predicate::compare(duration(), CompareOp::Lt, 10),
                ]
            }
        );
    }

    #[test]
    fn test_chained_comparison_registers_join_once() {
        let compiled = compile_ok("0 <= run.metrics['acc'].last <= 1");
        assert_eq!(compiled.joins.len(), 1);
        assert_eq!(compiled.joins[0].alias, "metrics_0");
        assert_eq!(compiled.joins[0].kind, JoinKind::LeftOuter);
    }

    #[test]
    fn test_list_membership_preserves_order() {
        let compiled = compile_ok("run.status in ['RUNNING', 'FAILED']");
        assert_eq!(
            compiled.predicate,
            Predicate::ListMembership {
                column: ColumnDescriptor::attribute("runs", "status"),
                op: ListOp::In,
                literals: vec![json!("RUNNING"), json!("FAILED")],
            }
        );
    }

    #[test]
    fn test_list_operator_needs_list() {
        assert_eq!(compile_err("run.status in 'RUNNING'"), ErrorKind::InvalidOperand);
        assert_eq!(compile_err("run.status in [run.name]"), ErrorKind::InvalidOperand);
    }

    #[test]
    fn test_unknown_identifier() {
        let err = compile(
            "bogus.field == 1",
            &SymbolTable::builtin(),
            &FunctionRegistry::builtin(),
            0,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAttribute);
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_unknown_metric_field() {
        assert_eq!(
            compile_err("run.metrics['loss'].median < 1"),
            ErrorKind::UnknownAttribute
        );
        assert_eq!(compile_err("metric.bogus == 1"), ErrorKind::UnknownAttribute);
    }

    #[test]
    fn test_wildcard_resolves_to_param_join() {
        let compiled = compile_ok("run.learning_rate == '0.01'");
        assert_eq!(compiled.joins.len(), 1);
        assert_eq!(compiled.joins[0].entity, EntityKind::Param);
        assert_eq!(compiled.joins[0].key, "learning_rate");
        match &compiled.predicate {
            Predicate::Comparison { column, .. } => {
                assert_eq!(column.table, "params_0");
                assert_eq!(column.join_alias.as_deref(), Some("params_0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_repeated_side_entity_shares_alias() {
        let compiled = compile_ok(
            "run.tags['team'] == 'a' or run.tags.team == 'b' or run.metrics.loss.last < 2",
        );
        assert_eq!(compiled.joins.len(), 2);
        assert_eq!(compiled.joins[0].alias, "tags_0");
        assert_eq!(compiled.joins[1].alias, "metrics_1");
    }

    #[test]
    fn test_computed_boolean_comparisons() {
        let archived = compile_ok("run.archived").predicate;
        assert_eq!(compile_ok("run.archived == True").predicate, archived);
        assert_eq!(compile_ok("run.archived == False").predicate, archived.clone().negate());
        assert_eq!(compile_ok("not run.archived").predicate, archived.clone().negate());
        assert_eq!(compile_ok("False != run.archived").predicate, archived);
        assert_eq!(compile_err("run.archived < True"), ErrorKind::InvalidOperand);
    }

    #[test]
    fn test_comparison_without_column_is_rejected() {
        assert_eq!(compile_err("1 < 2"), ErrorKind::InvalidOperand);
        assert_eq!(compile_err("'a' == 'a'"), ErrorKind::InvalidOperand);
    }

    #[test]
    fn test_boolean_connectives_need_conditions() {
        assert_eq!(compile_err("run.name and run.active"), ErrorKind::NotABooleanExpression);
        assert_eq!(compile_err("not run.name"), ErrorKind::NotABooleanExpression);
        assert_eq!(compile_err("run.name"), ErrorKind::NotABooleanExpression);
    }

    #[test]
    fn test_datetime_call() {
        let compiled = compile_ok("run.created_at >= datetime(2022, 2, 2)");
        assert_eq!(
            compiled.predicate,
            Predicate::compare(
                ColumnDescriptor::attribute("runs", "start_time"),
                CompareOp::Gte,
                1_643_760_000_000i64
            )
        );
        assert_eq!(
            compile_err("run.created_at > datetime(2022, 1, 1, 0, 0, 0, 0, 0)"),
            ErrorKind::InvalidOperand
        );
    }

    #[test]
    fn test_datetime_uses_timezone_offset() {
        let compiled = compile(
            "run.end_time < datetime(1970, 1, 1)",
            &SymbolTable::builtin(),
            &FunctionRegistry::builtin(),
            120,
        )
        .unwrap();
        match compiled.predicate {
            Predicate::Comparison { literal, .. } => assert_eq!(literal, json!(7_200_000)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_helpers() {
        let name = ColumnDescriptor::attribute("runs", "name");
        assert_eq!(
            compile_ok("run.name.startswith('bert')").predicate,
            Predicate::compare(name.clone(), CompareOp::Like, "bert%")
        );
        assert_eq!(
            compile_ok("run.name.endswith('v2')").predicate,
            Predicate::compare(name.clone(), CompareOp::Like, "%v2")
        );
        assert_eq!(
            compile_ok("'base' not in run.name").predicate,
            Predicate::compare(name.clone(), CompareOp::Like, "%base%").negate()
        );
        assert_eq!(
            compile_ok("re.match('bert-.*', run.name)").predicate,
            Predicate::compare(name, CompareOp::Regex, "^bert-.*")
        );
        assert_eq!(compile_err("re.search('(', run.name)"), ErrorKind::InvalidOperand);
        assert_eq!(compile_err("re.compile('x')"), ErrorKind::UnknownAttribute);
    }

    #[test]
    fn test_metric_scope_constants() {
        let compiled = compile_ok("metric.name == 'loss' and metric.last_step > 10");
        assert!(compiled.joins.is_empty());
        // `first_step` is a constant, so this comparison has no column.
        assert_eq!(compile_err("metric.first_step == 0"), ErrorKind::InvalidOperand);
    }

    #[test]
    fn test_none_literal() {
        let compiled = compile_ok("run.tags.team is None");
        match compiled.predicate {
            Predicate::Comparison { op, literal, .. } => {
                assert_eq!(op, CompareOp::Eq);
                assert_eq!(literal, Value::Null);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compile_error_carries_location() {
        let err = compile(
            "run.name == 'a' and\n  run.bogus.x == 1",
            &SymbolTable::builtin(),
            &FunctionRegistry::builtin(),
            0,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAttribute);
        let loc = err.location().unwrap();
        assert_eq!(loc.line, 2);
        assert_eq!(loc.offset, 3);
    }

    #[test]
    fn test_default_filter_applies_unless_guarded() {
        let compiler = ExpressionCompiler::new(SymbolTable::builtin(), FunctionRegistry::builtin())
            .with_default_filter("run.archived", "not run.archived");
        let archived = compile_ok("run.archived").predicate;

        let blank = compiler.compile("", 0).unwrap();
        assert_eq!(blank.predicate, archived.clone().negate());

        let guarded = compiler.compile("run.archived == True", 0).unwrap();
        assert_eq!(guarded.predicate, archived);

        let combined = compiler.compile("run.active", 0).unwrap();
        match combined.predicate {
            Predicate::And { children } => assert_eq!(children.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_custom_registry_is_isolated() {
        let err = compile(
            "run.created_at > datetime(2020)",
            &SymbolTable::builtin(),
            &FunctionRegistry::empty(),
            0,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownAttribute);
    }
}
