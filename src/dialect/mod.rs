//! Dialect adaptation of planned SQL.
//!
//! The adapter runs after the rewrite engine and transforms
//! engine-specific constructs for the physical backend: function-name
//! rewrites (`generate_array` -> `generate_series`) and an identifier
//! quoting audit that keeps case-sensitive names stable on engines that
//! fold unquoted identifiers. Unknown constructs pass through, and the
//! adapter is idempotent: rewrite targets are never rewrite sources, and
//! quoting an already-quoted identifier is a no-op.

use std::ops::ControlFlow;
use std::str::FromStr;

use sqlparser::ast::{visit_expressions_mut, visit_relations_mut, Expr, Ident, ObjectName};

use crate::error::{PlanError, PlanResult};
use crate::sql::{self, needs_quoting};

/// Behavior of one target backend.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display and logging.
    fn name(&self) -> &'static str;

    /// Rewrite a function name (given lowercase); `None` passes through.
    fn rewrite_function(&self, _name: &str) -> Option<&'static str> {
        None
    }

    /// Whether identifiers that are not lowercase, or collide with a
    /// keyword, must be quoted on output.
    fn quotes_mixed_case(&self) -> bool {
        false
    }
}

/// No-op adapter: canonical formatting only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Generic;

impl SqlDialect for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }
}

/// The default columnar backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn rewrite_function(&self, name: &str) -> Option<&'static str> {
        match name {
            "generate_array" => Some("generate_series"),
            "array_length" => Some("len"),
            _ => None,
        }
    }

    fn quotes_mixed_case(&self) -> bool {
        true
    }
}

/// Supported target dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Generic,
    DuckDb,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::DuckDb
    }
}

impl FromStr for Dialect {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(Dialect::Generic),
            "duckdb" => Ok(Dialect::DuckDb),
            other => Err(PlanError::UnsupportedDialect {
                name: other.to_string(),
            }),
        }
    }
}

impl Dialect {
    fn implementation(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Generic => &Generic,
            Dialect::DuckDb => &DuckDb,
        }
    }
}

/// Apply a dialect to planned SQL. Semantics-preserving and idempotent:
/// `apply(d, apply(d, sql)) == apply(d, sql)`.
pub fn apply(dialect: Dialect, sql_text: &str) -> PlanResult<String> {
    let implementation = dialect.implementation();
    let mut statement = sql::parse_statement(sql_text)?;

    let _: ControlFlow<()> = visit_expressions_mut(&mut statement, |expr: &mut Expr| {
        match expr {
            Expr::Function(function) => {
                if let Some(last) = function.name.0.last_mut() {
                    if last.quote_style.is_none() {
                        if let Some(renamed) =
                            implementation.rewrite_function(&last.value.to_lowercase())
                        {
                            *last = Ident::new(renamed);
                        }
                    }
                }
            }
            Expr::Identifier(ident) => quote_audit(implementation, ident),
            Expr::CompoundIdentifier(parts) => {
                for ident in parts.iter_mut() {
                    quote_audit(implementation, ident);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });

    let _: ControlFlow<()> = visit_relations_mut(&mut statement, |name: &mut ObjectName| {
        for ident in name.0.iter_mut() {
            quote_audit(implementation, ident);
        }
        ControlFlow::Continue(())
    });

    Ok(statement.to_string())
}

fn quote_audit(dialect: &dyn SqlDialect, ident: &mut Ident) {
    if dialect.quotes_mixed_case() && ident.quote_style.is_none() && needs_quoting(&ident.value)
    {
        ident.quote_style = Some('"');
    }
}
