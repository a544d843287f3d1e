//! Clinical edit-check rule compiler.
//!
//! Rule text goes through [`lexer`] and [`parser`] once, then two code
//! generators run over the same AST: [`predicate`] builds closures for
//! synchronous data-entry validation, [`sql_compiler`] builds parameterized
//! violation queries for batch QC. Both artifacts live in a [`cache`] that is
//! swapped atomically when the rule dictionary changes, and [`qc`] runs the
//! batch side against a database and keeps violation records current.

pub mod ast;
pub mod cache;
pub mod config;
pub mod functions;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod predicate;
pub mod qc;
pub mod rule;
pub mod sql_compiler;
pub mod token;
pub mod value;

pub use cache::{CacheBuild, CacheHandle, RuleCompiler, ValidationCache};
pub use config::EngineConfig;
pub use parser::parse_rule;
pub use predicate::{CompiledValidator, ValidationResult};
pub use qc::{QcEngine, RunSummary};
pub use rule::{Rule, RuleId, RuleScope, Severity};
pub use sql_compiler::{CompiledQuery, SqlCompiler, SqlDialect};
pub use value::{FieldValue, RecordContext};
