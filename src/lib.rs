//! # Mantle
//!
//! A semantic SQL planner: queries written against a logical data model
//! are rewritten into SQL any standard engine can execute.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                Manifest (JSON catalog)                   │
//! │   models, metrics, cumulative metrics, views, enums      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [semantic analysis + lineage]
//! ┌─────────────────────────────────────────────────────────┐
//! │                   AnalyzedManifest                       │
//! └─────────────────────────────────────────────────────────┘
//!                          │         incoming SQL
//!                          │              │
//!                          ▼              ▼ [statement analyzer]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Query descriptors (one CTE per object)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [rewrite engine]
//! ┌─────────────────────────────────────────────────────────┐
//! │        WITH-prefixed statement, dependency order         │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [dialect adapter]
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Backend-ready SQL                        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The planner is synchronous and stateless at the request boundary:
//! one plan operates over an immutable shared [`AnalyzedManifest`] and
//! request-owned state only. Embedders that want memoization across
//! requests use [`cache::PlanCache`].

use log::{debug, info};
use sqlparser::ast::{Expr, Query, Select, SelectItem, SetExpr, Statement, TableFactor};

pub mod analyzer;
pub mod cache;
pub mod dialect;
pub mod error;
pub mod manifest;
pub mod planner;
pub mod rewrite;
pub mod semantic;
pub mod session;
pub mod sql;
pub mod validation;

pub use cache::PlanCache;
pub use dialect::Dialect;
pub use error::{ErrorCode, ManifestError, PlanError, PlanResult};
pub use manifest::Manifest;
pub use semantic::AnalyzedManifest;
pub use session::SessionContext;
pub use validation::{validate, ValidationResult, ValidationStatus};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::cache::PlanCache;
    pub use crate::dialect::Dialect;
    pub use crate::error::{ErrorCode, ManifestError, PlanError, PlanResult};
    pub use crate::manifest::builder::{
        ColumnBuilder, CumulativeMetricBuilder, EnumDefinitionBuilder, ManifestBuilder,
        MetricBuilder, ModelBuilder, RelationshipBuilder, ViewBuilder,
    };
    pub use crate::manifest::{JoinType, Manifest, TimeUnit};
    pub use crate::semantic::AnalyzedManifest;
    pub use crate::session::SessionContext;
    pub use crate::{dry_plan, dry_run, plan, plan_with_dialect, OutputColumn};
}

/// Plan a statement for the default backend dialect.
pub fn plan(
    sql_text: &str,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
) -> PlanResult<String> {
    plan_with_dialect(sql_text, session, analyzed, Dialect::default())
}

/// Plan a statement and adapt it for `dialect`.
pub fn plan_with_dialect(
    sql_text: &str,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
    dialect: Dialect,
) -> PlanResult<String> {
    info!("planning SQL: {}", sql::excerpt(sql_text));
    let rewritten = rewrite::rewrite_statement(sql_text, session, analyzed)?;
    let adapted = dialect::apply(dialect, &rewritten)?;
    debug!("planned SQL: {}", sql::excerpt(&adapted));
    Ok(adapted)
}

/// As [`plan`], but `modeling_only` skips the dialect adapter.
pub fn dry_plan(
    sql_text: &str,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
    modeling_only: bool,
) -> PlanResult<String> {
    let rewritten = rewrite::rewrite_statement(sql_text, session, analyzed)?;
    if modeling_only {
        Ok(rewritten)
    } else {
        dialect::apply(Dialect::default(), &rewritten)
    }
}

/// One column of a statement's output shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    /// The declared manifest type, when the column resolves to one.
    pub r#type: Option<String>,
}

/// Parse and check a statement, returning its output shape without
/// producing executable SQL.
pub fn dry_run(
    sql_text: &str,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
) -> PlanResult<Vec<OutputColumn>> {
    let statement = sql::parse_statement(sql_text)?;
    // Analysis validates references and surfaces ambiguity errors.
    analyzer::analyze_statement(&statement, analyzed, session)?;
    let Statement::Query(query) = &statement else {
        return Ok(Vec::new());
    };
    Ok(query_shape(query, session, analyzed))
}

fn query_shape(
    query: &Query,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
) -> Vec<OutputColumn> {
    set_expr_shape(&query.body, session, analyzed)
}

fn set_expr_shape(
    body: &SetExpr,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
) -> Vec<OutputColumn> {
    match body {
        SetExpr::Select(select) => select_shape(select, session, analyzed),
        SetExpr::Query(inner) => query_shape(inner, session, analyzed),
        // Set operations take the left branch's shape.
        SetExpr::SetOperation { left, .. } => set_expr_shape(left, session, analyzed),
        _ => Vec::new(),
    }
}

fn select_shape(
    select: &Select,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
) -> Vec<OutputColumn> {
    // Visible manifest relations of this select, alias -> object.
    let mut relations: Vec<(String, String)> = Vec::new();
    for table in &select.from {
        let mut factors = vec![&table.relation];
        factors.extend(table.joins.iter().map(|j| &j.relation));
        for factor in factors {
            if let TableFactor::Table { name, alias, .. } = factor {
                if let Some(object) = analyzer::resolve_table_name(
                    analyzed,
                    session,
                    name,
                    &Default::default(),
                ) {
                    let visible = alias
                        .as_ref()
                        .map(|a| a.name.value.clone())
                        .unwrap_or_else(|| object.clone());
                    relations.push((visible, object));
                }
            }
        }
    }

    let column_type = |qualifier: Option<&str>, column: &str| -> Option<String> {
        let candidates = relations.iter().filter(|(visible, _)| {
            qualifier.map(|q| q == visible.as_str()).unwrap_or(true)
        });
        for (_, object) in candidates {
            if let Some(dataset) = analyzed.object(object) {
                if let Some(found) = dataset.column(column) {
                    return Some(found.r#type.clone());
                }
                if let semantic::Dataset::CumulativeMetric(cm) = &dataset {
                    if cm.window.name == column {
                        return Some("date".to_string());
                    }
                    if cm.measure.name == column {
                        return Some(cm.measure.r#type.clone());
                    }
                }
            }
        }
        None
    };

    let mut shape = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => match expr {
                Expr::Identifier(ident) => shape.push(OutputColumn {
                    name: ident.value.clone(),
                    r#type: column_type(None, &ident.value),
                }),
                Expr::CompoundIdentifier(parts) => {
                    let qualifier = parts
                        .len()
                        .checked_sub(2)
                        .map(|i| parts[i].value.as_str());
                    let column = parts.last().map(|i| i.value.clone()).unwrap_or_default();
                    shape.push(OutputColumn {
                        r#type: column_type(qualifier, &column),
                        name: column,
                    });
                }
                other => shape.push(OutputColumn {
                    name: other.to_string(),
                    r#type: None,
                }),
            },
            SelectItem::ExprWithAlias { expr, alias } => {
                let r#type = match expr {
                    Expr::Identifier(ident) => column_type(None, &ident.value),
                    Expr::CompoundIdentifier(parts) => {
                        let qualifier = parts
                            .len()
                            .checked_sub(2)
                            .map(|i| parts[i].value.as_str());
                        parts
                            .last()
                            .and_then(|c| column_type(qualifier, &c.value))
                    }
                    _ => None,
                };
                shape.push(OutputColumn {
                    name: alias.value.clone(),
                    r#type,
                });
            }
            SelectItem::Wildcard(_) => {
                for (_, object) in &relations {
                    if let Some(dataset) = analyzed.object(object) {
                        for column in dataset.column_names() {
                            let r#type = column_type(None, &column);
                            shape.push(OutputColumn {
                                name: column,
                                r#type,
                            });
                        }
                    }
                }
            }
            SelectItem::QualifiedWildcard(name, _) => {
                let qualifier = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                for (visible, object) in &relations {
                    if visible != &qualifier {
                        continue;
                    }
                    if let Some(dataset) = analyzed.object(object) {
                        for column in dataset.column_names() {
                            let r#type = column_type(Some(visible), &column);
                            shape.push(OutputColumn {
                                name: column,
                                r#type,
                            });
                        }
                    }
                }
            }
        }
    }
    shape
}
