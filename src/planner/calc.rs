//! Calculated-field rewriting.
//!
//! A calculated column is classified by the relationships its expression
//! traverses:
//!
//! - *to-one* (only ONE_TO_ONE / MANY_TO_ONE hops): every hop becomes a
//!   `LEFT JOIN` against the target's CTE and the expression is inlined
//!   with dereferences replaced by join-alias references;
//! - *to-many* (at least one ONE_TO_MANY / MANY_TO_MANY hop): the whole
//!   expression moves into an aggregated sub-select over the target
//!   chain, grouped by the first hop's join keys and `LEFT JOIN`ed back
//!   to the owner — preserving the owner's row cardinality. Empty groups
//!   surface as SQL-standard NULL; no identity value is substituted.
//!
//! Enum accesses (`Status.ACTIVE`) are replaced by their literal value.
//! Same-object calculated references are inlined recursively.

use indexmap::{IndexMap, IndexSet};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Value,
};
use std::sync::Arc;

use crate::analyzer::is_aggregate_function;
use crate::error::{ManifestError, PlanError, PlanResult};
use crate::manifest::{Column, ColumnKind};
use crate::semantic::{AnalyzedManifest, JoinKeyPair};
use crate::sql::{self, quote_ident, quote_qualified};

/// Recursion guard for same-object calculated references. Cycles are
/// caught earlier by the lineage traversal; this bound is defensive.
const MAX_INLINE_DEPTH: usize = 64;

/// The rewritten form of one calculated column.
pub struct CalcRewrite {
    /// Projection expression for the owner's select list.
    pub expression: String,
    /// `LEFT JOIN` clauses in first-use order, deduplicated by alias.
    pub joins: Vec<JoinClause>,
    /// Objects whose CTEs the joins reference.
    pub required_objects: IndexSet<String>,
}

#[derive(Clone)]
pub struct JoinClause {
    pub alias: String,
    pub sql: String,
}

/// Rewrite `column` of `owner`, qualifying owner columns with
/// `owner_alias`.
pub fn rewrite_column(
    analyzed: &AnalyzedManifest,
    owner: &str,
    owner_alias: &str,
    column: &Column,
) -> PlanResult<CalcRewrite> {
    let mut rewriter = CalcRewriter {
        analyzed,
        owner: owner.to_string(),
        owner_alias: owner_alias.to_string(),
        current_column: column.name.clone(),
        joins: IndexMap::new(),
        required: IndexSet::new(),
        agg_anchor: None,
        agg_joins: IndexMap::new(),
        depth: 0,
    };
    let expression = rewriter.rewrite(column)?;
    Ok(CalcRewrite {
        expression,
        joins: rewriter
            .joins
            .into_iter()
            .map(|(alias, sql)| JoinClause { alias, sql })
            .collect(),
        required_objects: rewriter.required,
    })
}

/// One relationship traversal step.
struct Hop {
    rel_column: String,
    target: String,
    to_many: bool,
    pairs: Vec<JoinKeyPair>,
    owner_is_left: bool,
}

/// A resolved identifier reference inside a calculated expression.
enum Resolved {
    EnumValue(String),
    SelfColumn(String),
    Chain {
        hops: Vec<Hop>,
        /// `None` for a bare relationship reference (`count(orders)`).
        terminal: Option<String>,
    },
}

struct CalcRewriter<'a> {
    analyzed: &'a AnalyzedManifest,
    owner: String,
    owner_alias: String,
    current_column: String,
    joins: IndexMap<String, String>,
    required: IndexSet<String>,
    /// Set while rewriting inside a to-many sub-select: the first-hop
    /// relationship column, which is the sub-select's FROM alias.
    agg_anchor: Option<String>,
    agg_joins: IndexMap<String, String>,
    depth: usize,
}

impl CalcRewriter<'_> {
    fn rewrite(&mut self, column: &Column) -> PlanResult<String> {
        let mut expr = sql::parse_expression(column.source_expression())?;
        if self.is_to_many(&expr)? {
            self.rewrite_to_many(column, expr)
        } else {
            self.transform(&mut expr)?;
            Ok(expr.to_string())
        }
    }

    /// Whether the expression dereferences through any to-many hop.
    fn is_to_many(&self, expr: &Expr) -> PlanResult<bool> {
        let mut refs = Vec::new();
        collect_parts(expr, &mut refs);
        for parts in refs {
            if let Resolved::Chain { hops, .. } = self.resolve_reference(&parts)? {
                if hops.iter().any(|h| h.to_many) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn resolve_reference(&self, parts: &[String]) -> PlanResult<Resolved> {
        let head = parts[0].as_str();

        if let Some(definition) = self.analyzed.enum_definition(head) {
            if parts.len() == 2 {
                if let Some(value) = definition.value_of(&parts[1]) {
                    return Ok(Resolved::EnumValue(value.to_string()));
                }
            }
            return Err(self.invalid(format!("unknown enum value '{}'", parts.join("."))));
        }

        if head == self.owner && parts.len() == 2 {
            return self.resolve_reference(&parts[1..]);
        }

        let Some(column) = self.column_of(&self.owner, head) else {
            return Err(self.invalid(format!("unknown reference '{}'", parts.join("."))));
        };
        if column.kind() != ColumnKind::Relationship {
            if parts.len() == 1 {
                return Ok(Resolved::SelfColumn(head.to_string()));
            }
            return Err(self.invalid(format!(
                "'{head}' is not a relationship column; dereference requires one"
            )));
        }

        let mut hops = Vec::new();
        let mut current_object = self.owner.clone();
        let mut current_column = column;
        let mut index = 0;
        loop {
            let hop = self.hop(&current_object, &current_column)?;
            let target = hop.target.clone();
            hops.push(hop);
            index += 1;
            if index >= parts.len() {
                return Ok(Resolved::Chain {
                    hops,
                    terminal: None,
                });
            }
            let next = parts[index].as_str();
            let Some(next_column) = self.column_of(&target, next) else {
                return Err(self.invalid(format!("unknown reference '{}'", parts.join("."))));
            };
            if next_column.kind() == ColumnKind::Relationship {
                current_object = target;
                current_column = next_column;
                continue;
            }
            if index != parts.len() - 1 {
                return Err(self.invalid(format!(
                    "'{target}.{next}' is not a relationship column; dereference requires one"
                )));
            }
            return Ok(Resolved::Chain {
                hops,
                terminal: Some(next.to_string()),
            });
        }
    }

    fn hop(&self, owner: &str, column: &Arc<Column>) -> PlanResult<Hop> {
        let rel_name = column.relationship.as_deref().unwrap_or_default();
        let relationship = self.analyzed.relationship(rel_name).ok_or_else(|| {
            PlanError::internal(format!("relationship '{rel_name}' vanished after analysis"))
        })?;
        let join_type = relationship.join_type_from(owner).ok_or_else(|| {
            PlanError::internal(format!(
                "'{owner}' is not an endpoint of relationship '{rel_name}'"
            ))
        })?;
        let owner_is_left = relationship.models.first().map(|m| m == owner).unwrap_or(false);
        let pairs = self
            .analyzed
            .join_keys(rel_name)
            .map(|p| p.to_vec())
            .unwrap_or_default();
        Ok(Hop {
            rel_column: column.name.clone(),
            target: column.r#type.clone(),
            to_many: join_type.is_to_many(),
            pairs,
            owner_is_left,
        })
    }

    fn column_of(&self, object: &str, name: &str) -> Option<Arc<Column>> {
        self.analyzed
            .object(object)
            .and_then(|d| d.column(name).cloned())
    }

    fn invalid(&self, reason: String) -> PlanError {
        PlanError::Manifest(ManifestError::InvalidColumn {
            owner: self.owner.clone(),
            column: self.current_column.clone(),
            reason,
        })
    }

    // =====================================================================
    // To-one / local rewriting
    // =====================================================================

    /// Transform an expression in place: qualify owner columns, inline
    /// same-object calculated columns, turn dereference chains into
    /// join-alias references, substitute enum accesses.
    fn transform(&mut self, expr: &mut Expr) -> PlanResult<()> {
        match expr {
            Expr::Identifier(ident) => {
                let replacement = self.reference_expr(&[ident.value.clone()])?;
                *expr = replacement;
                Ok(())
            }
            Expr::CompoundIdentifier(parts) => {
                let parts: Vec<String> = parts.iter().map(|i| i.value.clone()).collect();
                let replacement = self.reference_expr(&parts)?;
                *expr = replacement;
                Ok(())
            }
            Expr::Function(function) => {
                let name = function
                    .name
                    .0
                    .last()
                    .map(|i| i.value.to_lowercase())
                    .unwrap_or_default();
                if let FunctionArguments::List(list) = &mut function.args {
                    for arg in &mut list.args {
                        let inner = match arg {
                            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(e),
                            FunctionArg::Named {
                                arg: FunctionArgExpr::Expr(e),
                                ..
                            } => Some(e),
                            _ => None,
                        };
                        let Some(inner) = inner else { continue };
                        // A bare relationship argument of an aggregate
                        // counts rows: count(orders) -> count(*).
                        if let Some(parts) = identifier_parts(inner) {
                            if let Resolved::Chain {
                                hops,
                                terminal: None,
                            } = self.resolve_reference(&parts)?
                            {
                                if !is_aggregate_function(&name) {
                                    return Err(self.invalid(format!(
                                        "bare relationship reference '{}' is only valid \
                                         inside an aggregate",
                                        parts.join(".")
                                    )));
                                }
                                self.ensure_chain_joins(&hops)?;
                                *arg = FunctionArg::Unnamed(FunctionArgExpr::Wildcard);
                                continue;
                            }
                        }
                        self.transform(inner)?;
                    }
                }
                if let Some(filter) = &mut function.filter {
                    self.transform(filter)?;
                }
                Ok(())
            }
            Expr::BinaryOp { left, right, .. } => {
                self.transform(left)?;
                self.transform(right)
            }
            Expr::UnaryOp { expr, .. } => self.transform(expr),
            Expr::Nested(inner) => self.transform(inner),
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.transform(operand)?;
                }
                for expr in conditions.iter_mut().chain(results.iter_mut()) {
                    self.transform(expr)?;
                }
                if let Some(else_result) = else_result {
                    self.transform(else_result)?;
                }
                Ok(())
            }
            Expr::Cast { expr, .. } => self.transform(expr),
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner) => self.transform(inner),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.transform(left)?;
                self.transform(right)
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.transform(expr)?;
                self.transform(low)?;
                self.transform(high)
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.transform(expr)?;
                self.transform(pattern)
            }
            Expr::InList { expr, list, .. } => {
                self.transform(expr)?;
                for item in list {
                    self.transform(item)?;
                }
                Ok(())
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.transform(item)?;
                }
                Ok(())
            }
            Expr::Extract { expr, .. } => self.transform(expr),
            Expr::Value(_) | Expr::TypedString { .. } | Expr::Interval(_) => Ok(()),
            other => Err(self.invalid(format!(
                "unsupported expression in calculated column: {other}"
            ))),
        }
    }

    /// Build the replacement expression for an identifier reference.
    fn reference_expr(&mut self, parts: &[String]) -> PlanResult<Expr> {
        match self.resolve_reference(parts)? {
            Resolved::EnumValue(value) => Ok(Expr::Value(Value::SingleQuotedString(value))),
            Resolved::SelfColumn(name) => self.self_column_expr(&name),
            Resolved::Chain { hops, terminal } => {
                let Some(terminal) = terminal else {
                    return Err(self.invalid(format!(
                        "bare relationship reference '{}' is only valid inside an aggregate",
                        parts.join(".")
                    )));
                };
                let alias = self.ensure_chain_joins(&hops)?;
                Ok(Expr::CompoundIdentifier(vec![
                    sql::ident(&alias),
                    sql::ident(&terminal),
                ]))
            }
        }
    }

    fn self_column_expr(&mut self, name: &str) -> PlanResult<Expr> {
        if self.agg_anchor.is_some() {
            return Err(self.invalid(format!(
                "to-many calculated field cannot reference owner column '{name}'"
            )));
        }
        let column = self
            .column_of(&self.owner, name)
            .ok_or_else(|| self.invalid(format!("unknown reference '{name}'")))?;
        match column.kind() {
            ColumnKind::Calculated => {
                if self.depth >= MAX_INLINE_DEPTH {
                    return Err(PlanError::internal(format!(
                        "calculated column nesting exceeds {MAX_INLINE_DEPTH} levels"
                    )));
                }
                self.depth += 1;
                let rendered = self.rewrite(&column)?;
                self.depth -= 1;
                let inner = sql::parse_expression(&rendered)?;
                Ok(Expr::Nested(Box::new(inner)))
            }
            _ => Ok(Expr::CompoundIdentifier(vec![
                sql::ident(&self.owner_alias),
                sql::ident(name),
            ])),
        }
    }

    /// Emit the joins for a to-one chain (or the inner joins of a
    /// to-many sub-select) and return the alias holding the terminal.
    fn ensure_chain_joins(&mut self, hops: &[Hop]) -> PlanResult<String> {
        let mut path = String::new();
        let mut previous_alias = match &self.agg_anchor {
            Some(anchor) => anchor.clone(),
            None => self.owner_alias.clone(),
        };
        for (index, hop) in hops.iter().enumerate() {
            if index == 0 {
                path = hop.rel_column.clone();
            } else {
                path = format!("{path}__{}", hop.rel_column);
            }
            // Inside a sub-select the anchor hop is the FROM relation.
            let anchored = self.agg_anchor.as_deref() == Some(path.as_str()) && index == 0;
            if !anchored {
                let condition = join_condition(
                    &hop.pairs,
                    hop.owner_is_left,
                    &previous_alias,
                    &path,
                );
                let join_sql = format!(
                    "LEFT JOIN {} AS {} ON {}",
                    quote_ident(&hop.target),
                    quote_ident(&path),
                    condition
                );
                let joins = if self.agg_anchor.is_some() {
                    &mut self.agg_joins
                } else {
                    &mut self.joins
                };
                joins.entry(path.clone()).or_insert(join_sql);
                self.required.insert(hop.target.clone());
            } else {
                self.required.insert(hop.target.clone());
            }
            previous_alias = path.clone();
        }
        Ok(path)
    }

    // =====================================================================
    // To-many rewriting
    // =====================================================================

    fn rewrite_to_many(&mut self, column: &Column, mut expr: Expr) -> PlanResult<String> {
        // Every chain must start from the same relationship column; its
        // join keys become the grouping keys of the sub-select.
        let mut refs = Vec::new();
        collect_parts(&expr, &mut refs);
        let mut anchor: Option<Hop> = None;
        for parts in &refs {
            if let Resolved::Chain { hops, .. } = self.resolve_reference(parts)? {
                let first = hops.into_iter().next().ok_or_else(|| {
                    PlanError::internal("relationship chain with no hops".to_string())
                })?;
                match &anchor {
                    None => anchor = Some(first),
                    Some(existing) if existing.rel_column == first.rel_column => {}
                    Some(existing) => {
                        return Err(self.invalid(format!(
                            "to-many calculated field mixes relationships '{}' and '{}'",
                            existing.rel_column, first.rel_column
                        )));
                    }
                }
            }
        }
        let anchor = anchor.ok_or_else(|| {
            PlanError::internal("to-many classification without a chain".to_string())
        })?;

        self.agg_anchor = Some(anchor.rel_column.clone());
        self.agg_joins = IndexMap::new();
        self.required.insert(anchor.target.clone());
        let result = self.transform(&mut expr);
        let agg_anchor = self.agg_anchor.take();
        result?;
        let anchor_alias = agg_anchor.unwrap_or_default();

        // Group by the target-side join keys; join back on the owner
        // side. Keys follow the relationship's declared pair order.
        let mut key_selects = Vec::new();
        let mut key_groups = Vec::new();
        let mut on_terms = Vec::new();
        let agg_alias = format!("{}_agg_", column.name);
        for pair in &anchor.pairs {
            let (owner_column, target_column) = if anchor.owner_is_left {
                (&pair.left_column, &pair.right_column)
            } else {
                (&pair.right_column, &pair.left_column)
            };
            let key_alias = if *target_column == column.name {
                format!("{target_column}_key_")
            } else {
                target_column.clone()
            };
            key_selects.push(format!(
                "{} AS {}",
                quote_qualified(&[&anchor_alias, target_column]),
                quote_ident(&key_alias)
            ));
            key_groups.push(quote_qualified(&[&anchor_alias, target_column]));
            on_terms.push(format!(
                "{} = {}",
                quote_qualified(&[&agg_alias, &key_alias]),
                quote_qualified(&[&self.owner_alias, owner_column])
            ));
        }

        let inner_joins: Vec<String> = self.agg_joins.values().cloned().collect();
        self.agg_joins = IndexMap::new();
        let mut subselect = format!(
            "SELECT {}, {} AS {} FROM {} AS {}",
            key_selects.join(", "),
            expr,
            quote_ident(&column.name),
            quote_ident(&anchor.target),
            quote_ident(&anchor_alias)
        );
        for join in inner_joins {
            subselect.push(' ');
            subselect.push_str(&join);
        }
        subselect.push_str(&format!(" GROUP BY {}", key_groups.join(", ")));

        let join_sql = format!(
            "LEFT JOIN ({subselect}) AS {} ON {}",
            quote_ident(&agg_alias),
            on_terms.join(" AND ")
        );
        self.joins.insert(agg_alias.clone(), join_sql);

        Ok(quote_qualified(&[&agg_alias, &column.name]))
    }
}

/// Identifier parts of a plain or compound identifier expression.
fn identifier_parts(expr: &Expr) -> Option<Vec<String>> {
    match expr {
        Expr::Identifier(ident) => Some(vec![ident.value.clone()]),
        Expr::CompoundIdentifier(parts) => {
            Some(parts.iter().map(|i| i.value.clone()).collect())
        }
        Expr::Nested(inner) => identifier_parts(inner),
        _ => None,
    }
}

/// Collect the identifier references of an expression, without resolving
/// them. Structural recursion only; unsupported nodes are left for the
/// transform pass to report.
fn collect_parts(expr: &Expr, out: &mut Vec<Vec<String>>) {
    match expr {
        Expr::Identifier(ident) => out.push(vec![ident.value.clone()]),
        Expr::CompoundIdentifier(parts) => {
            out.push(parts.iter().map(|i| i.value.clone()).collect())
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_parts(left, out);
            collect_parts(right, out);
        }
        Expr::UnaryOp { expr, .. } => collect_parts(expr, out),
        Expr::Nested(inner) => collect_parts(inner, out),
        Expr::Function(function) => {
            if let FunctionArguments::List(list) = &function.args {
                for arg in &list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                        | FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => collect_parts(e, out),
                        _ => {}
                    }
                }
            }
            if let Some(filter) = &function.filter {
                collect_parts(filter, out);
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                collect_parts(operand, out);
            }
            for expr in conditions.iter().chain(results.iter()) {
                collect_parts(expr, out);
            }
            if let Some(else_result) = else_result {
                collect_parts(else_result, out);
            }
        }
        Expr::Cast { expr, .. } => collect_parts(expr, out),
        Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsNotTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::IsNotFalse(inner) => collect_parts(inner, out),
        Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
            collect_parts(left, out);
            collect_parts(right, out);
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_parts(expr, out);
            collect_parts(low, out);
            collect_parts(high, out);
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            collect_parts(expr, out);
            collect_parts(pattern, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_parts(expr, out);
            for item in list {
                collect_parts(item, out);
            }
        }
        Expr::Tuple(items) => {
            for item in items {
                collect_parts(item, out);
            }
        }
        Expr::Extract { expr, .. } => collect_parts(expr, out),
        _ => {}
    }
}

/// Render a relationship condition between two aliases from its oriented
/// equality pairs.
pub(crate) fn join_condition(
    pairs: &[JoinKeyPair],
    owner_is_left: bool,
    owner_alias: &str,
    target_alias: &str,
) -> String {
    pairs
        .iter()
        .map(|pair| {
            let (owner_column, target_column) = if owner_is_left {
                (&pair.left_column, &pair.right_column)
            } else {
                (&pair.right_column, &pair.left_column)
            };
            format!(
                "{} = {}",
                quote_qualified(&[owner_alias, owner_column]),
                quote_qualified(&[target_alias, target_column])
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}
