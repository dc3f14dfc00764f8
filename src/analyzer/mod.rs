//! Statement analysis: resolve identifiers in an incoming statement
//! against the manifest.
//!
//! The analyzer walks the statement with an explicit scope stack. Each
//! SELECT opens a scope holding its visible relations (aliased tables,
//! derived tables); user CTEs shadow manifest names; inner scopes see
//! outer scopes for correlated references.
//!
//! Outputs, all in first-reference order: the referenced manifest
//! objects, the columns collected per object, and the objects consumed
//! only for their rows (`count(*)`). Unknown identifiers pass through
//! untouched — they may belong to user CTEs or remote tables. Unqualified
//! identifiers that resolve to more than one referenced object fail with
//! [`PlanError::AmbiguousIdentifier`].

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Join, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};

use crate::error::{PlanError, PlanResult};
use crate::manifest::ColumnKind;
use crate::semantic::lineage::ColumnKey;
use crate::semantic::{AnalyzedManifest, Dataset};
use crate::session::SessionContext;
use crate::sql::object_name_values;

/// Aggregate functions recognized when classifying `count(*)`-style
/// consumption and to-many calculated fields.
pub(crate) const AGGREGATE_FUNCTIONS: &[&str] = &[
    "sum", "count", "avg", "min", "max", "array_agg", "string_agg", "bool_and", "bool_or",
    "stddev", "stddev_pop", "stddev_samp", "var_pop", "var_samp", "variance",
];

pub(crate) fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.contains(&name.to_lowercase().as_str())
}

/// What the analyzer learned about one statement.
#[derive(Debug, Default)]
pub struct StatementAnalysis {
    /// Referenced manifest objects, in first-reference order.
    pub objects: IndexSet<String>,
    /// Columns mentioned per object, objects in first-reference order.
    pub collected_columns: IndexMap<String, IndexSet<String>>,
    /// Every collected column in statement order, for lineage input.
    pub collected: IndexSet<ColumnKey>,
    /// Objects whose rows are consumed without enumerating columns.
    pub source_nodes: IndexSet<String>,
}

impl StatementAnalysis {
    pub fn references_manifest(&self) -> bool {
        !self.objects.is_empty()
    }

    /// Referenced objects of one dataset kind, preserving order.
    pub fn of_kind<'a>(
        &'a self,
        analyzed: &'a AnalyzedManifest,
        want: fn(&Dataset) -> bool,
    ) -> Vec<&'a str> {
        self.objects
            .iter()
            .filter(|name| analyzed.object(name).map(|d| want(&d)).unwrap_or(false))
            .map(|name| name.as_str())
            .collect()
    }
}

/// The effective `(catalog, schema)` prefix for one request: the session's
/// when set, the manifest's otherwise.
pub(crate) fn effective_prefix<'a>(
    analyzed: &'a AnalyzedManifest,
    session: &'a SessionContext,
) -> (&'a str, &'a str) {
    let catalog = if session.catalog.is_empty() {
        analyzed.catalog()
    } else {
        &session.catalog
    };
    let schema = if session.schema.is_empty() {
        analyzed.schema()
    } else {
        &session.schema
    };
    (catalog, schema)
}

/// Resolve a table reference to a manifest object name, honoring the
/// implicit catalog/schema prefix and CTE shadowing.
pub(crate) fn resolve_table_name(
    analyzed: &AnalyzedManifest,
    session: &SessionContext,
    name: &ObjectName,
    shadowed: &HashSet<String>,
) -> Option<String> {
    let (catalog, schema) = effective_prefix(analyzed, session);
    let parts = object_name_values(name);
    let candidate = match parts.as_slice() {
        [n] => *n,
        [s, n] if *s == schema => *n,
        [c, s, n] if *c == catalog && *s == schema => *n,
        _ => return None,
    };
    if shadowed.contains(candidate) {
        return None;
    }
    analyzed.object(candidate).map(|_| candidate.to_string())
}

/// Analyze one statement against the manifest.
pub fn analyze_statement(
    statement: &Statement,
    analyzed: &AnalyzedManifest,
    session: &SessionContext,
) -> PlanResult<StatementAnalysis> {
    let mut walker = Walker {
        analyzed,
        session,
        result: StatementAnalysis::default(),
    };
    if let Statement::Query(query) = statement {
        walker.walk_query(query, None, &HashSet::new())?;
    }
    Ok(walker.result)
}

/// A relation visible in a scope.
#[derive(Debug, Clone)]
enum Relation {
    /// Resolved to a manifest object.
    Object(String),
    /// A derived table, user CTE, or remote table; columns unknown.
    Opaque,
}

/// One level of the scope stack.
struct Scope<'p> {
    parent: Option<&'p Scope<'p>>,
    relations: IndexMap<String, Relation>,
}

impl Scope<'_> {
    fn relation(&self, alias: &str) -> Option<&Relation> {
        match self.relations.get(alias) {
            Some(rel) => Some(rel),
            None => self.parent.and_then(|p| p.relation(alias)),
        }
    }
}

struct Walker<'a> {
    analyzed: &'a AnalyzedManifest,
    session: &'a SessionContext,
    result: StatementAnalysis,
}

impl Walker<'_> {
    fn walk_query(
        &mut self,
        query: &Query,
        parent: Option<&Scope<'_>>,
        shadowed: &HashSet<String>,
    ) -> PlanResult<()> {
        let mut shadowed = shadowed.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.walk_query(&cte.query, parent, &shadowed)?;
                shadowed.insert(cte.alias.name.value.clone());
            }
        }
        let mut trailing: Vec<&Expr> = Vec::new();
        if let Some(order_by) = &query.order_by {
            for item in &order_by.exprs {
                trailing.push(&item.expr);
            }
        }
        if let Some(limit) = &query.limit {
            trailing.push(limit);
        }
        self.walk_set_expr(&query.body, parent, &shadowed, &trailing)
    }

    fn walk_set_expr(
        &mut self,
        body: &SetExpr,
        parent: Option<&Scope<'_>>,
        shadowed: &HashSet<String>,
        trailing: &[&Expr],
    ) -> PlanResult<()> {
        match body {
            SetExpr::Select(select) => self.walk_select(select, parent, shadowed, trailing),
            SetExpr::Query(query) => self.walk_query(query, parent, shadowed),
            SetExpr::SetOperation { left, right, .. } => {
                self.walk_set_expr(left, parent, shadowed, trailing)?;
                self.walk_set_expr(right, parent, shadowed, &[])
            }
            SetExpr::Values(values) => {
                let scope = Scope {
                    parent,
                    relations: IndexMap::new(),
                };
                for row in &values.rows {
                    for expr in row {
                        self.walk_expr(expr, &scope, shadowed)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn walk_select(
        &mut self,
        select: &Select,
        parent: Option<&Scope<'_>>,
        shadowed: &HashSet<String>,
        trailing: &[&Expr],
    ) -> PlanResult<()> {
        let mut scope = Scope {
            parent,
            relations: IndexMap::new(),
        };
        let mut constraints: Vec<&Expr> = Vec::new();
        for table in &select.from {
            self.add_table_with_joins(table, &mut scope, parent, shadowed, &mut constraints)?;
        }

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.walk_expr(expr, &scope, shadowed)?,
                SelectItem::ExprWithAlias { expr, .. } => {
                    self.walk_expr(expr, &scope, shadowed)?
                }
                SelectItem::Wildcard(_) => self.collect_wildcard(&scope, None),
                SelectItem::QualifiedWildcard(name, _) => {
                    let parts = object_name_values(name);
                    if let Some(alias) = parts.last().copied() {
                        self.collect_wildcard(&scope, Some(alias));
                    }
                }
            }
        }
        for expr in constraints {
            self.walk_expr(expr, &scope, shadowed)?;
        }
        if let Some(selection) = &select.selection {
            self.walk_expr(selection, &scope, shadowed)?;
        }
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                self.walk_expr(expr, &scope, shadowed)?;
            }
        }
        if let Some(having) = &select.having {
            self.walk_expr(having, &scope, shadowed)?;
        }
        if let Some(qualify) = &select.qualify {
            self.walk_expr(qualify, &scope, shadowed)?;
        }
        for expr in &select.sort_by {
            self.walk_expr(expr, &scope, shadowed)?;
        }
        for expr in trailing {
            self.walk_expr(expr, &scope, shadowed)?;
        }
        Ok(())
    }

    fn add_table_with_joins<'t>(
        &mut self,
        table: &'t TableWithJoins,
        scope: &mut Scope<'_>,
        parent: Option<&Scope<'_>>,
        shadowed: &HashSet<String>,
        constraints: &mut Vec<&'t Expr>,
    ) -> PlanResult<()> {
        self.add_table_factor(&table.relation, scope, parent, shadowed)?;
        for join in &table.joins {
            self.add_table_factor(&join.relation, scope, parent, shadowed)?;
            collect_join_constraint(join, constraints);
        }
        Ok(())
    }

    fn add_table_factor(
        &mut self,
        factor: &TableFactor,
        scope: &mut Scope<'_>,
        parent: Option<&Scope<'_>>,
        shadowed: &HashSet<String>,
    ) -> PlanResult<()> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let visible = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .or_else(|| name.0.last().map(|i| i.value.clone()))
                    .unwrap_or_default();
                match resolve_table_name(self.analyzed, self.session, name, shadowed) {
                    Some(object) => {
                        self.reference_object(&object);
                        scope.relations.insert(visible, Relation::Object(object));
                    }
                    None => {
                        scope.relations.insert(visible, Relation::Opaque);
                    }
                }
                Ok(())
            }
            TableFactor::Derived { subquery, alias, .. } => {
                self.walk_query(subquery, parent, shadowed)?;
                if let Some(alias) = alias {
                    scope
                        .relations
                        .insert(alias.name.value.clone(), Relation::Opaque);
                }
                Ok(())
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                let mut constraints = Vec::new();
                self.add_table_with_joins(
                    table_with_joins,
                    scope,
                    parent,
                    shadowed,
                    &mut constraints,
                )?;
                // Nested-join constraints see the same scope.
                for expr in constraints {
                    self.walk_expr(expr, scope, shadowed)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reference_object(&mut self, object: &str) {
        self.result.objects.insert(object.to_string());
        self.result
            .collected_columns
            .entry(object.to_string())
            .or_default();
    }

    fn collect_column(&mut self, object: &str, column: &str) {
        self.result
            .collected_columns
            .entry(object.to_string())
            .or_default()
            .insert(column.to_string());
        self.result
            .collected
            .insert(ColumnKey::new(object, column));
    }

    /// Whether `column` is a materializable column of `object`.
    fn collectible(&self, object: &str, column: &str) -> bool {
        match self.analyzed.object(object) {
            Some(dataset) => match dataset.column(column) {
                Some(c) => c.kind() != ColumnKind::Relationship,
                None => dataset.has_column(column),
            },
            None => false,
        }
    }

    fn collect_wildcard(&mut self, scope: &Scope<'_>, alias: Option<&str>) {
        let relations: Vec<(String, String)> = scope
            .relations
            .iter()
            .filter(|(visible, _)| alias.map(|a| a == visible.as_str()).unwrap_or(true))
            .filter_map(|(visible, rel)| match rel {
                Relation::Object(object) => Some((visible.clone(), object.clone())),
                Relation::Opaque => None,
            })
            .collect();
        for (_, object) in relations {
            if let Some(dataset) = self.analyzed.object(&object) {
                for column in dataset.column_names() {
                    self.collect_column(&object, &column);
                }
            }
        }
    }

    fn walk_expr(
        &mut self,
        expr: &Expr,
        scope: &Scope<'_>,
        shadowed: &HashSet<String>,
    ) -> PlanResult<()> {
        match expr {
            Expr::Identifier(ident) => self.resolve_unqualified(&ident.value, scope),
            Expr::CompoundIdentifier(parts) => {
                self.resolve_qualified(parts_values(parts), scope);
                Ok(())
            }
            Expr::BinaryOp { left, right, .. } => {
                self.walk_expr(left, scope, shadowed)?;
                self.walk_expr(right, scope, shadowed)
            }
            Expr::UnaryOp { expr, .. } => self.walk_expr(expr, scope, shadowed),
            Expr::Nested(inner) => self.walk_expr(inner, scope, shadowed),
            Expr::Function(function) => {
                let name = function
                    .name
                    .0
                    .last()
                    .map(|i| i.value.as_str())
                    .unwrap_or_default();
                let mut saw_wildcard = false;
                match &function.args {
                    FunctionArguments::List(list) => {
                        for arg in &list.args {
                            match arg {
                                FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                                | FunctionArg::Named {
                                    arg: FunctionArgExpr::Expr(e),
                                    ..
                                }
                                | FunctionArg::ExprNamed {
                                    arg: FunctionArgExpr::Expr(e),
                                    ..
                                } => self.walk_expr(e, scope, shadowed)?,
                                FunctionArg::Unnamed(FunctionArgExpr::Wildcard)
                                | FunctionArg::Named {
                                    arg: FunctionArgExpr::Wildcard,
                                    ..
                                }
                                | FunctionArg::ExprNamed {
                                    arg: FunctionArgExpr::Wildcard,
                                    ..
                                } => saw_wildcard = true,
                                FunctionArg::Unnamed(FunctionArgExpr::QualifiedWildcard(_))
                                | FunctionArg::Named {
                                    arg: FunctionArgExpr::QualifiedWildcard(_),
                                    ..
                                }
                                | FunctionArg::ExprNamed {
                                    arg: FunctionArgExpr::QualifiedWildcard(_),
                                    ..
                                } => saw_wildcard = true,
                            }
                        }
                    }
                    FunctionArguments::Subquery(query) => {
                        self.walk_query(query, Some(scope), shadowed)?;
                    }
                    FunctionArguments::None => {}
                }
                if saw_wildcard && is_aggregate_function(name) {
                    // count(*): rows are consumed without naming columns.
                    for relation in scope.relations.values() {
                        if let Relation::Object(object) = relation {
                            self.result.source_nodes.insert(object.clone());
                        }
                    }
                }
                if let Some(filter) = &function.filter {
                    self.walk_expr(filter, scope, shadowed)?;
                }
                Ok(())
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand, scope, shadowed)?;
                }
                for expr in conditions.iter().chain(results.iter()) {
                    self.walk_expr(expr, scope, shadowed)?;
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result, scope, shadowed)?;
                }
                Ok(())
            }
            Expr::Cast { expr, .. } => self.walk_expr(expr, scope, shadowed),
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner) => self.walk_expr(inner, scope, shadowed),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.walk_expr(left, scope, shadowed)?;
                self.walk_expr(right, scope, shadowed)
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.walk_expr(expr, scope, shadowed)?;
                self.walk_expr(low, scope, shadowed)?;
                self.walk_expr(high, scope, shadowed)
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.walk_expr(expr, scope, shadowed)?;
                self.walk_expr(pattern, scope, shadowed)
            }
            Expr::InList { expr, list, .. } => {
                self.walk_expr(expr, scope, shadowed)?;
                for item in list {
                    self.walk_expr(item, scope, shadowed)?;
                }
                Ok(())
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.walk_expr(item, scope, shadowed)?;
                }
                Ok(())
            }
            Expr::Extract { expr, .. } => self.walk_expr(expr, scope, shadowed),
            Expr::Subquery(query) => self.walk_query(query, Some(scope), shadowed),
            Expr::InSubquery { expr, subquery, .. } => {
                self.walk_expr(expr, scope, shadowed)?;
                self.walk_query(subquery, Some(scope), shadowed)
            }
            Expr::Exists { subquery, .. } => self.walk_query(subquery, Some(scope), shadowed),
            _ => Ok(()),
        }
    }

    /// Unqualified identifier: resolve against the nearest scope level
    /// that has any manifest candidate. More than one candidate at that
    /// level is ambiguous; none anywhere passes through.
    fn resolve_unqualified(&mut self, name: &str, scope: &Scope<'_>) -> PlanResult<()> {
        let mut level = Some(scope);
        while let Some(current) = level {
            let candidates: Vec<String> = current
                .relations
                .values()
                .filter_map(|rel| match rel {
                    Relation::Object(object) if self.collectible(object, name) => {
                        Some(object.clone())
                    }
                    _ => None,
                })
                .collect();
            match candidates.len() {
                0 => level = current.parent,
                1 => {
                    self.collect_column(&candidates[0], name);
                    return Ok(());
                }
                _ => {
                    return Err(PlanError::AmbiguousIdentifier {
                        name: name.to_string(),
                        candidates,
                    });
                }
            }
        }
        Ok(())
    }

    /// Qualified identifier: `alias.column`, optionally carrying the
    /// catalog/schema prefix.
    fn resolve_qualified(&mut self, parts: Vec<&str>, scope: &Scope<'_>) {
        let (catalog, schema) = effective_prefix(self.analyzed, self.session);
        let (qualifier, column) = match parts.as_slice() {
            [q, col] => (*q, *col),
            [s, q, col] if *s == schema => (*q, *col),
            [c, s, q, col] if *c == catalog && *s == schema => (*q, *col),
            _ => return,
        };
        if let Some(Relation::Object(object)) = scope.relation(qualifier) {
            let object = object.clone();
            if self.collectible(&object, column) {
                self.collect_column(&object, column);
            }
        }
    }
}

fn parts_values(parts: &[sqlparser::ast::Ident]) -> Vec<&str> {
    parts.iter().map(|i| i.value.as_str()).collect()
}

fn collect_join_constraint<'a>(join: &'a Join, out: &mut Vec<&'a Expr>) {
    let constraint = match &join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => Some(c),
        _ => None,
    };
    if let Some(JoinConstraint::On(expr)) = constraint {
        out.push(expr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::builder::{
        ColumnBuilder, ManifestBuilder, ModelBuilder, RelationshipBuilder,
    };
    use crate::manifest::JoinType;
    use crate::sql::parse_statement;

    fn analyzed() -> AnalyzedManifest {
        let manifest = ManifestBuilder::new()
            .catalog("test")
            .schema("test")
            .model(
                ModelBuilder::new("Orders")
                    .ref_sql("SELECT * FROM tpch.orders")
                    .column(ColumnBuilder::new("orderkey", "integer").build())
                    .column(ColumnBuilder::new("custkey", "integer").build())
                    .column(ColumnBuilder::new("totalprice", "integer").build())
                    .column(
                        ColumnBuilder::new("customer", "Customer")
                            .relationship("OrdersCustomer")
                            .build(),
                    )
                    .column(
                        ColumnBuilder::new("customer_name", "varchar")
                            .calculated("customer.name")
                            .build(),
                    )
                    .primary_key("orderkey")
                    .build(),
            )
            .model(
                ModelBuilder::new("Customer")
                    .ref_sql("SELECT * FROM tpch.customer")
                    .column(ColumnBuilder::new("custkey", "integer").build())
                    .column(ColumnBuilder::new("name", "varchar").build())
                    .primary_key("custkey")
                    .build(),
            )
            .relationship(
                RelationshipBuilder::new(
                    "OrdersCustomer",
                    "Orders",
                    "Customer",
                    JoinType::ManyToOne,
                    "Orders.custkey = Customer.custkey",
                )
                .build(),
            )
            .build();
        AnalyzedManifest::analyze(manifest).unwrap()
    }

    fn analyze(sql: &str) -> StatementAnalysis {
        let analyzed = analyzed();
        let statement = parse_statement(sql).unwrap();
        analyze_statement(&statement, &analyzed, &SessionContext::default()).unwrap()
    }

    #[test]
    fn collects_simple_projection() {
        let analysis = analyze("SELECT orderkey FROM Orders LIMIT 200");
        assert_eq!(analysis.objects.len(), 1);
        assert!(analysis.collected_columns["Orders"].contains("orderkey"));
    }

    #[test]
    fn resolves_qualified_prefix_forms() {
        let analysis = analyze("SELECT test.test.Orders.orderkey FROM test.test.Orders");
        assert!(analysis.collected_columns["Orders"].contains("orderkey"));
        let analysis = analyze("SELECT o.orderkey FROM test.Orders o");
        assert!(analysis.collected_columns["Orders"].contains("orderkey"));
    }

    #[test]
    fn aliases_shadow_object_names() {
        let analysis = analyze("SELECT c.name FROM Customer c");
        assert!(analysis.collected_columns["Customer"].contains("name"));
    }

    #[test]
    fn unknown_tables_pass_through() {
        let analysis = analyze("SELECT * FROM unknown_table");
        assert!(!analysis.references_manifest());
    }

    #[test]
    fn user_ctes_shadow_manifest_objects() {
        let analysis =
            analyze("WITH Orders AS (SELECT 1 AS x) SELECT x FROM Orders");
        assert!(!analysis.references_manifest());
    }

    #[test]
    fn ambiguous_unqualified_identifier_fails() {
        let analyzed = analyzed();
        let statement = parse_statement(
            "SELECT custkey FROM Orders, Customer",
        )
        .unwrap();
        let err =
            analyze_statement(&statement, &analyzed, &SessionContext::default()).unwrap_err();
        assert!(matches!(err, PlanError::AmbiguousIdentifier { .. }));
    }

    #[test]
    fn count_star_marks_source_nodes() {
        let analysis = analyze("SELECT count(*) FROM Orders");
        assert!(analysis.source_nodes.contains("Orders"));
        assert!(analysis.collected_columns["Orders"].is_empty());
    }

    #[test]
    fn wildcard_collects_declared_columns() {
        let analysis = analyze("SELECT * FROM Customer");
        let columns = &analysis.collected_columns["Customer"];
        assert!(columns.contains("custkey"));
        assert!(columns.contains("name"));
    }

    #[test]
    fn correlated_subquery_sees_outer_scope() {
        let analysis = analyze(
            "SELECT name FROM Customer WHERE EXISTS \
             (SELECT 1 FROM Orders WHERE Orders.custkey = Customer.custkey)",
        );
        assert!(analysis.collected_columns["Customer"].contains("custkey"));
        assert!(analysis.collected_columns["Orders"].contains("custkey"));
    }

    #[test]
    fn relationship_columns_are_not_collected() {
        let analysis = analyze("SELECT customer FROM Orders");
        assert!(analysis.collected_columns["Orders"].is_empty());
    }

    #[test]
    fn quoted_reserved_names_resolve_case_sensitively() {
        let analysis = analyze(
            "SELECT name FROM Customer UNION SELECT name FROM Customer \
             WHERE custkey IN (SELECT albumId FROM \"Order\")",
        );
        // "Order" is not in the manifest: passes through.
        assert_eq!(analysis.objects.len(), 1);
        assert!(analysis.collected_columns["Customer"].contains("name"));
    }
}
