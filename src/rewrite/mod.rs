//! The rewrite engine: compose CTEs in dependency order and splice them
//! into the original statement.
//!
//! One rewrite moves through `Parsed -> Analyzed -> DescriptorsBuilt ->
//! CTEsAssembled -> Emitted`; every transition is pure and fails into a
//! single [`PlanError`] without partial emission. The emitted SQL is
//! re-parsed and printed canonically, so identical inputs produce
//! byte-identical output.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use log::debug;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};

use crate::analyzer::{self, resolve_table_name, StatementAnalysis};
use crate::error::{PlanError, PlanResult};
use crate::planner::{self, DescriptorInput, QueryDescriptor, SpineRegistry};
use crate::semantic::lineage::ColumnKey;
use crate::semantic::{AnalyzedManifest, Dataset};
use crate::session::SessionContext;
use crate::sql::{self, quote_ident};

/// Rewrite one statement against the manifest. Returns canonical SQL;
/// statements referencing no manifest object pass through (canonically
/// formatted).
pub fn rewrite_statement(
    sql_text: &str,
    session: &SessionContext,
    analyzed: &AnalyzedManifest,
) -> PlanResult<String> {
    // Parsed.
    let mut statement = sql::parse_statement(sql_text)?;

    // Analyzed.
    let analysis = analyzer::analyze_statement(&statement, analyzed, session)?;
    if !analysis.references_manifest() {
        return Ok(statement.to_string());
    }

    // Views expand inline: merge the analysis of every referenced view
    // body (transitively) so their column needs flow into lineage.
    let views = expand_views(analyzed, session, &analysis)?;

    let mut collected: IndexSet<ColumnKey> = analysis.collected.clone();
    let mut source_nodes: IndexSet<String> = analysis.source_nodes.clone();
    let mut referenced: IndexSet<String> = analysis.objects.clone();
    for view in views.values() {
        collected.extend(view.analysis.collected.iter().cloned());
        source_nodes.extend(view.analysis.source_nodes.iter().cloned());
        referenced.extend(view.analysis.objects.iter().cloned());
    }

    // A cumulative metric always materializes both of its outputs.
    for object in &referenced {
        if let Some(Dataset::CumulativeMetric(cm)) = analyzed.object(object) {
            collected.insert(ColumnKey::new(object.as_str(), cm.window.name.as_str()));
            collected.insert(ColumnKey::new(object.as_str(), cm.measure.name.as_str()));
        }
    }

    // DescriptorsBuilt: lineage first (the canonical cycle check), then
    // per-object descriptors to fixed point.
    let inputs: Vec<ColumnKey> = collected.into_iter().collect();
    let fields = analyzed.lineage().required_fields(&inputs)?;

    // Row-only consumption propagates through base-object origins.
    let mut pending: Vec<String> = source_nodes.iter().cloned().collect();
    while let Some(name) = pending.pop() {
        if let Some(model) = analyzed.model(&name) {
            if let Some(base) = &model.base_object {
                if source_nodes.insert(base.clone()) {
                    pending.push(base.clone());
                }
            }
        }
    }

    let input = DescriptorInput {
        analyzed,
        fields: &fields,
        source_nodes: &source_nodes,
        dynamic_fields: session.enable_dynamic_fields,
    };
    let mut spines = SpineRegistry::new();
    let mut descriptors: IndexMap<String, QueryDescriptor> = IndexMap::new();
    let mut queue: Vec<String> = referenced
        .iter()
        .chain(fields.keys())
        .cloned()
        .collect();
    queue.reverse();
    while let Some(name) = queue.pop() {
        if descriptors.contains_key(&name) {
            continue;
        }
        if let Some(spine) = spines.descriptors().find(|d| d.name == name) {
            let spine = spine.clone();
            descriptors.insert(name, spine);
            continue;
        }
        let descriptor = match views.get(&name) {
            Some(view) => view_descriptor(analyzed, session, name.clone(), view)?,
            None => planner::build_descriptor(&input, &mut spines, &name)?,
        };
        for required in &descriptor.required_objects {
            if !descriptors.contains_key(required) {
                queue.push(required.clone());
            }
        }
        descriptors.insert(name, descriptor);
    }
    for spine in spines.descriptors() {
        if !descriptors.contains_key(&spine.name) {
            descriptors.insert(spine.name.clone(), spine.clone());
        }
    }

    // CTEsAssembled: topological order, first-reference tie-break.
    let order = topological_order(&descriptors, &referenced)?;
    debug!("cte order: {order:?}");

    // Statement rewriting: manifest table references become CTE names,
    // the catalog/schema prefix is stripped from compound identifiers.
    let mut rewriter = Rewriter {
        analyzed,
        session,
        referenced: &referenced,
    };
    rewriter.statement(&mut statement, &HashSet::new());

    let ctes: Vec<String> = order
        .iter()
        .map(|name| format!("{} AS ({})", quote_ident(name), descriptors[name].sql))
        .collect();
    let spliced = splice_ctes(&statement.to_string(), &ctes);

    // Emitted: one final parse normalizes the output and catches any
    // malformed emission before it reaches the backend.
    let emitted = sql::parse_statement(&spliced)
        .map_err(|e| PlanError::internal(format!("emitted SQL failed to re-parse: {e}")))?;
    Ok(emitted.to_string())
}

/// A referenced view: its parsed body and that body's analysis.
struct ExpandedView {
    statement: Statement,
    analysis: StatementAnalysis,
}

/// Parse and analyze every referenced view body, transitively.
fn expand_views(
    analyzed: &AnalyzedManifest,
    session: &SessionContext,
    analysis: &StatementAnalysis,
) -> PlanResult<HashMap<String, ExpandedView>> {
    let mut views: HashMap<String, ExpandedView> = HashMap::new();
    let mut queue: Vec<String> = analysis
        .objects
        .iter()
        .filter(|name| analyzed.view(name).is_some())
        .cloned()
        .collect();
    while let Some(name) = queue.pop() {
        if views.contains_key(&name) {
            continue;
        }
        let view = analyzed
            .view(&name)
            .ok_or_else(|| PlanError::UnknownObject { name: name.clone() })?;
        let statement = sql::parse_statement(&view.statement).map_err(|e| {
            PlanError::Parse {
                message: format!("view '{name}': {e}"),
            }
        })?;
        let body_analysis = analyzer::analyze_statement(&statement, analyzed, session)?;
        for object in &body_analysis.objects {
            if analyzed.view(object).is_some() && !views.contains_key(object) {
                queue.push(object.clone());
            }
        }
        views.insert(
            name,
            ExpandedView {
                statement,
                analysis: body_analysis,
            },
        );
    }
    Ok(views)
}

/// A view's CTE is its body with manifest references rewritten; the
/// referenced objects hoist into the descriptor set.
fn view_descriptor(
    analyzed: &AnalyzedManifest,
    session: &SessionContext,
    name: String,
    view: &ExpandedView,
) -> PlanResult<QueryDescriptor> {
    let mut statement = view.statement.clone();
    let mut rewriter = Rewriter {
        analyzed,
        session,
        referenced: &view.analysis.objects,
    };
    rewriter.statement(&mut statement, &HashSet::new());
    Ok(QueryDescriptor {
        name,
        required_objects: view.analysis.objects.clone(),
        sql: statement.to_string(),
    })
}

/// Kahn's algorithm over the descriptor DAG. Dependencies emit first;
/// among ready nodes the earliest-referenced wins. The cycle branch is
/// defensive only — lineage reports cycles before descriptors are built.
fn topological_order(
    descriptors: &IndexMap<String, QueryDescriptor>,
    referenced: &IndexSet<String>,
) -> PlanResult<Vec<String>> {
    let rank = |name: &str| -> usize {
        referenced.get_index_of(name).unwrap_or_else(|| {
            referenced.len() + descriptors.get_index_of(name).unwrap_or(descriptors.len())
        })
    };
    let mut order: Vec<String> = Vec::with_capacity(descriptors.len());
    let mut emitted: HashSet<String> = HashSet::new();
    while order.len() < descriptors.len() {
        let ready = descriptors
            .values()
            .filter(|d| !emitted.contains(&d.name))
            .filter(|d| {
                d.required_objects
                    .iter()
                    .all(|r| emitted.contains(r) || r == &d.name || !descriptors.contains_key(r))
            })
            .min_by_key(|d| rank(&d.name));
        match ready {
            Some(descriptor) => {
                emitted.insert(descriptor.name.clone());
                order.push(descriptor.name.clone());
            }
            None => {
                let stuck = descriptors
                    .keys()
                    .find(|name| !emitted.contains(*name))
                    .cloned()
                    .unwrap_or_default();
                return Err(PlanError::Cycle { column: stuck });
            }
        }
    }
    Ok(order)
}

/// Prepend the generated CTEs, merging with an existing WITH clause.
fn splice_ctes(statement: &str, ctes: &[String]) -> String {
    if ctes.is_empty() {
        return statement.to_string();
    }
    let list = ctes.join(", ");
    if let Some(rest) = statement.strip_prefix("WITH RECURSIVE ") {
        format!("WITH RECURSIVE {list}, {rest}")
    } else if let Some(rest) = statement.strip_prefix("WITH ") {
        format!("WITH {list}, {rest}")
    } else {
        format!("WITH {list} {statement}")
    }
}

/// In-place rewriting of the user statement: manifest table references
/// become unqualified CTE names; compound identifiers lose the
/// catalog/schema prefix. Generated CTE bodies are never touched — they
/// are spliced in as finished text.
struct Rewriter<'a> {
    analyzed: &'a AnalyzedManifest,
    session: &'a SessionContext,
    referenced: &'a IndexSet<String>,
}

impl Rewriter<'_> {
    fn statement(&mut self, statement: &mut Statement, shadowed: &HashSet<String>) {
        if let Statement::Query(query) = statement {
            self.query(query, shadowed);
        }
    }

    fn query(&mut self, query: &mut Query, shadowed: &HashSet<String>) {
        let mut shadowed = shadowed.clone();
        if let Some(with) = &mut query.with {
            for cte in &mut with.cte_tables {
                self.query(&mut cte.query, &shadowed);
                shadowed.insert(cte.alias.name.value.clone());
            }
        }
        self.set_expr(&mut query.body, &shadowed);
        if let Some(order_by) = &mut query.order_by {
            for item in &mut order_by.exprs {
                self.expr(&mut item.expr, &shadowed);
            }
        }
        if let Some(limit) = &mut query.limit {
            self.expr(limit, &shadowed);
        }
    }

    fn set_expr(&mut self, body: &mut SetExpr, shadowed: &HashSet<String>) {
        match body {
            SetExpr::Select(select) => self.select(select, shadowed),
            SetExpr::Query(query) => self.query(query, shadowed),
            SetExpr::SetOperation { left, right, .. } => {
                self.set_expr(left, shadowed);
                self.set_expr(right, shadowed);
            }
            SetExpr::Values(values) => {
                for row in &mut values.rows {
                    for expr in row {
                        self.expr(expr, shadowed);
                    }
                }
            }
            _ => {}
        }
    }

    fn select(&mut self, select: &mut Select, shadowed: &HashSet<String>) {
        for table in &mut select.from {
            self.table_with_joins(table, shadowed);
        }
        for item in &mut select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.expr(expr, shadowed),
                SelectItem::ExprWithAlias { expr, .. } => self.expr(expr, shadowed),
                SelectItem::QualifiedWildcard(name, _) => self.object_name(name, shadowed),
                SelectItem::Wildcard(_) => {}
            }
        }
        if let Some(selection) = &mut select.selection {
            self.expr(selection, shadowed);
        }
        if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
            for expr in exprs {
                self.expr(expr, shadowed);
            }
        }
        if let Some(having) = &mut select.having {
            self.expr(having, shadowed);
        }
        if let Some(qualify) = &mut select.qualify {
            self.expr(qualify, shadowed);
        }
        for expr in &mut select.sort_by {
            self.expr(expr, shadowed);
        }
    }

    fn table_with_joins(&mut self, table: &mut TableWithJoins, shadowed: &HashSet<String>) {
        self.table_factor(&mut table.relation, shadowed);
        for join in &mut table.joins {
            self.table_factor(&mut join.relation, shadowed);
            let constraint = match &mut join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => Some(c),
                _ => None,
            };
            if let Some(JoinConstraint::On(expr)) = constraint {
                self.expr(expr, shadowed);
            }
        }
    }

    fn table_factor(&mut self, factor: &mut TableFactor, shadowed: &HashSet<String>) {
        match factor {
            TableFactor::Table { name, .. } => {
                if let Some(object) =
                    resolve_table_name(self.analyzed, self.session, name, shadowed)
                {
                    *name = ObjectName(vec![sql::ident(&object)]);
                }
            }
            TableFactor::Derived { subquery, .. } => self.query(subquery, shadowed),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins, shadowed),
            _ => {}
        }
    }

    /// Strip the catalog/schema prefix from a qualified wildcard.
    fn object_name(&mut self, name: &mut ObjectName, _shadowed: &HashSet<String>) {
        let values: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
        if let Some(stripped) = self.strip_prefix(&values, 1) {
            name.0 = stripped.iter().map(|v| sql::ident(v)).collect();
        }
    }

    /// `[catalog, schema, object, ...rest]` -> `[object, ...rest]` when
    /// the prefix matches and the object was actually resolved.
    /// `min_rest` guards two-part references like `alias.column` against
    /// a schema that happens to share the alias name.
    fn strip_prefix(&self, values: &[String], min_rest: usize) -> Option<Vec<String>> {
        let (catalog, schema) = analyzer::effective_prefix(self.analyzed, self.session);
        let rest: &[String] = match values {
            [c, s, rest @ ..] if c == catalog && s == schema && rest.len() >= min_rest => rest,
            [s, rest @ ..] if s == schema && rest.len() >= min_rest => rest,
            _ => return None,
        };
        if self.referenced.contains(&rest[0]) {
            Some(rest.to_vec())
        } else {
            None
        }
    }

    fn expr(&mut self, expr: &mut Expr, shadowed: &HashSet<String>) {
        match expr {
            Expr::CompoundIdentifier(parts) => {
                let values: Vec<String> = parts.iter().map(|i| i.value.clone()).collect();
                if let Some(stripped) = self.strip_prefix(&values, 2) {
                    *parts = stripped.iter().map(|v| sql::ident(v)).collect();
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                self.expr(left, shadowed);
                self.expr(right, shadowed);
            }
            Expr::UnaryOp { expr, .. } => self.expr(expr, shadowed),
            Expr::Nested(inner) => self.expr(inner, shadowed),
            Expr::Function(function) => {
                match &mut function.args {
                    FunctionArguments::List(list) => {
                        for arg in &mut list.args {
                            match arg {
                                FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                                | FunctionArg::Named {
                                    arg: FunctionArgExpr::Expr(e),
                                    ..
                                } => self.expr(e, shadowed),
                                _ => {}
                            }
                        }
                    }
                    FunctionArguments::Subquery(query) => self.query(query, shadowed),
                    FunctionArguments::None => {}
                }
                if let Some(filter) = &mut function.filter {
                    self.expr(filter, shadowed);
                }
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.expr(operand, shadowed);
                }
                for expr in conditions.iter_mut().chain(results.iter_mut()) {
                    self.expr(expr, shadowed);
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result, shadowed);
                }
            }
            Expr::Cast { expr, .. } => self.expr(expr, shadowed),
            Expr::IsNull(inner)
            | Expr::IsNotNull(inner)
            | Expr::IsTrue(inner)
            | Expr::IsNotTrue(inner)
            | Expr::IsFalse(inner)
            | Expr::IsNotFalse(inner) => self.expr(inner, shadowed),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.expr(left, shadowed);
                self.expr(right, shadowed);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.expr(expr, shadowed);
                self.expr(low, shadowed);
                self.expr(high, shadowed);
            }
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.expr(expr, shadowed);
                self.expr(pattern, shadowed);
            }
            Expr::InList { expr, list, .. } => {
                self.expr(expr, shadowed);
                for item in list {
                    self.expr(item, shadowed);
                }
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.expr(item, shadowed);
                }
            }
            Expr::Extract { expr, .. } => self.expr(expr, shadowed),
            Expr::Subquery(query) => self.query(query, shadowed),
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr, shadowed);
                self.query(subquery, shadowed);
            }
            Expr::Exists { subquery, .. } => self.query(subquery, shadowed),
            _ => {}
        }
    }
}
