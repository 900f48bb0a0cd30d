//! # tw-query
//!
//! Search compilation for the tracking server. Two filter grammars compile
//! to one backend-neutral [`Predicate`] tree:
//!
//! - [`expr`]: the expression language of the run explorer
//!   (`run.metrics['loss'].last < 0.1 and not run.archived`).
//! - [`filter`]: the flat `entity.key op value AND ...` filters of the
//!   search endpoints, plus `order_by` clauses.
//!
//! [`pagination`] turns a total ordering into offset tokens or keyset
//! cursors. Nothing in this crate touches storage; see `tw-hub` for the
//! store adapter that evaluates compiled trees.

pub mod error;
pub mod expr;
pub mod filter;
pub mod pagination;
pub mod predicate;
pub mod symbols;

pub use error::{ErrorKind, Location, QueryError, Result};
pub use expr::{ExpressionCompiler, FunctionRegistry};
pub use filter::{DialectHints, EntityRuleTable, FlatFilter, SortKey, SortSpec};
pub use pagination::{KeysetCursor, KeysetOrder, Page, PageToken};
pub use predicate::{
    ColumnDescriptor, CompareOp, CompiledFilter, EntityKind, JoinKind, JoinRequirement, ListOp,
    Predicate,
};
pub use symbols::SymbolTable;
