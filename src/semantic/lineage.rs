//! Column-level lineage over calculated fields.
//!
//! The lineage graph has one vertex per `(object, column)` pair and an
//! edge from a calculated column to every column it reads: same-object
//! identifiers, dereference targets behind relationship chains, and the
//! join keys of every traversed relationship. Aggregates do not stop
//! traversal.
//!
//! The graph is allowed to contain cycles. A manifest may declare columns
//! that mutually reference each other; only the attempt to resolve them
//! together fails, with a [`CycleError`] naming the starting column.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use sqlparser::ast::{Expr, FunctionArg, FunctionArgExpr, FunctionArguments};
use thiserror::Error;

use crate::error::{ManifestError, PlanError};
use crate::manifest::{
    Column, ColumnKind, CumulativeMetric, EnumDefinition, Metric, Model, Relationship,
};
use crate::semantic::JoinKeyPair;
use crate::sql;

/// A `(object, column)` pair. An empty column names the object itself
/// (a row-only requirement, as produced by `count(*)` over a
/// relationship).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnKey {
    pub object: String,
    pub column: String,
}

impl ColumnKey {
    pub fn new(object: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnKey {
            object: object.into(),
            column: column.into(),
        }
    }
}

impl std::fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.object, self.column)
    }
}

/// A traversal touched a dependency cycle.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("cycle detected while resolving calculated column '{column}'")]
pub struct CycleError {
    pub column: String,
}

impl From<CycleError> for PlanError {
    fn from(err: CycleError) -> Self {
        PlanError::Cycle { column: err.column }
    }
}

/// Inputs the lineage builder resolves names against.
pub struct LineageInput<'a> {
    pub models: &'a HashMap<String, Arc<Model>>,
    pub metrics: &'a HashMap<String, Arc<Metric>>,
    pub cumulative_metrics: &'a HashMap<String, Arc<CumulativeMetric>>,
    pub relationships: &'a HashMap<String, Arc<Relationship>>,
    pub enum_definitions: &'a HashMap<String, Arc<EnumDefinition>>,
    pub join_keys: &'a HashMap<String, Vec<JoinKeyPair>>,
}

/// The prebuilt lineage graph.
pub struct Lineage {
    graph: DiGraph<ColumnKey, ()>,
    node_index: HashMap<ColumnKey, NodeIndex>,
    immediate: HashMap<ColumnKey, IndexMap<String, BTreeSet<String>>>,
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    InProgress,
    Done,
}

impl Lineage {
    pub fn build(input: &LineageInput<'_>) -> Result<Self, ManifestError> {
        let mut lineage = Lineage {
            graph: DiGraph::new(),
            node_index: HashMap::new(),
            immediate: HashMap::new(),
        };

        let mut model_names: Vec<&String> = input.models.keys().collect();
        model_names.sort();
        for name in model_names {
            let model = &input.models[name];
            for column in &model.columns {
                match column.kind() {
                    ColumnKind::Calculated => {
                        let origin = ColumnKey::new(&model.name, &column.name);
                        let expr = parse_column_expression(&model.name, column)?;
                        lineage.add_expression_edges(input, &origin, &model.name, &expr)?;
                    }
                    // A derived model's physical columns read the base
                    // object's output; those columns must flow through
                    // the base CTE. Physical columns of raw-SQL or table
                    // origins read remote columns and need no edges.
                    ColumnKind::Physical => {
                        if let Some(base) = &model.base_object {
                            let origin = ColumnKey::new(&model.name, &column.name);
                            let expr = parse_column_expression(&model.name, column)?;
                            lineage.add_base_physical_edges(input, &origin, base, &expr)?;
                        }
                    }
                    ColumnKind::Relationship => {}
                }
            }
        }

        let mut metric_names: Vec<&String> = input.metrics.keys().collect();
        metric_names.sort();
        for name in metric_names {
            let metric = &input.metrics[name];
            for column in metric.dimension.iter().chain(metric.measure.iter()) {
                let origin = ColumnKey::new(&metric.name, &column.name);
                let expr = parse_column_expression(&metric.name, column)?;
                lineage.add_expression_edges(input, &origin, &metric.base_object, &expr)?;
            }
        }

        let mut cm_names: Vec<&String> = input.cumulative_metrics.keys().collect();
        cm_names.sort();
        for name in cm_names {
            let metric = &input.cumulative_metrics[name];
            for (output, source) in [
                (&metric.measure.name, &metric.measure.ref_column),
                (&metric.window.name, &metric.window.ref_column),
            ] {
                if !base_has_column(input, &metric.base_object, source) {
                    return Err(ManifestError::UnknownReference {
                        owner: format!("cumulative metric '{}'", metric.name),
                        reference: format!("{}.{}", metric.base_object, source),
                    });
                }
                let origin = ColumnKey::new(&metric.name, output);
                let target = ColumnKey::new(&metric.base_object, source);
                lineage.add_edge(&origin, &target);
                lineage
                    .immediate
                    .entry(origin)
                    .or_default()
                    .entry(metric.base_object.clone())
                    .or_default()
                    .insert(source.clone());
            }
        }

        Ok(lineage)
    }

    /// The union of transitively required columns per object, for the
    /// given starting columns.
    ///
    /// The returned mapping is ordered so that a dependency object always
    /// precedes its dependents; ties resolve to first-touch order. Fails
    /// when the traversal closes a cycle, naming the starting column.
    pub fn required_fields(
        &self,
        inputs: &[ColumnKey],
    ) -> Result<IndexMap<String, BTreeSet<String>>, CycleError> {
        let mut fields: IndexMap<String, BTreeSet<String>> = IndexMap::new();
        let mut deps: BTreeSet<(String, String)> = BTreeSet::new();
        let mut state: HashMap<NodeIndex, VisitState> = HashMap::new();

        for input in inputs {
            match self.node_index.get(input) {
                Some(&node) => self.visit(node, input, &mut state, &mut fields, &mut deps)?,
                None => {
                    record(&mut fields, input);
                }
            }
        }

        // Topological order over the touched objects, dependencies first.
        let objects: Vec<String> = fields.keys().cloned().collect();
        let mut ordered: IndexMap<String, BTreeSet<String>> = IndexMap::new();
        let mut remaining: Vec<String> = objects.clone();
        while !remaining.is_empty() {
            let ready = objects.iter().find(|obj| {
                remaining.contains(obj)
                    && deps.iter().all(|(dependent, dependency)| {
                        dependent != *obj
                            || dependency == *obj
                            || !remaining.contains(dependency)
                    })
            });
            match ready {
                Some(obj) => {
                    let obj = obj.clone();
                    remaining.retain(|o| o != &obj);
                    let set = fields.get(&obj).cloned().unwrap_or_default();
                    ordered.insert(obj, set);
                }
                None => {
                    return Err(CycleError {
                        column: self.cycle_culprit(inputs, &remaining),
                    });
                }
            }
        }
        Ok(ordered)
    }

    /// Immediate (one-step) source columns of a single column, for
    /// lineage visualization.
    pub fn source_columns(&self, input: &ColumnKey) -> IndexMap<String, BTreeSet<String>> {
        if let Some(map) = self.immediate.get(input) {
            return map.clone();
        }
        let mut map = IndexMap::new();
        map.insert(
            input.object.clone(),
            BTreeSet::from([input.column.clone()]),
        );
        map
    }

    fn visit(
        &self,
        node: NodeIndex,
        start: &ColumnKey,
        state: &mut HashMap<NodeIndex, VisitState>,
        fields: &mut IndexMap<String, BTreeSet<String>>,
        deps: &mut BTreeSet<(String, String)>,
    ) -> Result<(), CycleError> {
        match state.get(&node) {
            Some(VisitState::Done) => {
                // Re-record so objects reached through several inputs keep
                // their first-touch position.
                record(fields, &self.graph[node]);
                return Ok(());
            }
            Some(VisitState::InProgress) => {
                return Err(CycleError {
                    column: start.to_string(),
                });
            }
            None => {}
        }
        state.insert(node, VisitState::InProgress);
        let key = self.graph[node].clone();
        record(fields, &key);
        let successors: Vec<NodeIndex> = self.graph.neighbors(node).collect();
        for succ in successors {
            let succ_key = &self.graph[succ];
            if succ_key.object != key.object {
                deps.insert((key.object.clone(), succ_key.object.clone()));
            }
            self.visit(succ, start, state, fields, deps)?;
        }
        state.insert(node, VisitState::Done);
        Ok(())
    }

    /// The first calculated input whose object participates in the
    /// unresolved remainder.
    fn cycle_culprit(&self, inputs: &[ColumnKey], remaining: &[String]) -> String {
        inputs
            .iter()
            .find(|input| {
                remaining.contains(&input.object)
                    && self
                        .node_index
                        .get(input)
                        .map(|&n| self.graph.neighbors(n).next().is_some())
                        .unwrap_or(false)
            })
            .or_else(|| inputs.iter().find(|i| remaining.contains(&i.object)))
            .map(|i| i.to_string())
            .unwrap_or_else(|| remaining.join(", "))
    }

    fn node(&mut self, key: &ColumnKey) -> NodeIndex {
        if let Some(&idx) = self.node_index.get(key) {
            idx
        } else {
            let idx = self.graph.add_node(key.clone());
            self.node_index.insert(key.clone(), idx);
            idx
        }
    }

    fn add_edge(&mut self, from: &ColumnKey, to: &ColumnKey) {
        let from_idx = self.node(from);
        let to_idx = self.node(to);
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
    }

    fn record_immediate(&mut self, origin: &ColumnKey, object: &str, column: &str) {
        self.immediate
            .entry(origin.clone())
            .or_default()
            .entry(object.to_string())
            .or_default()
            .insert(column.to_string());
    }

    /// Add edges for one calculated expression owned by `origin`,
    /// resolving plain identifiers against `owner` (the owning model, or
    /// a metric's base object).
    fn add_expression_edges(
        &mut self,
        input: &LineageInput<'_>,
        origin: &ColumnKey,
        owner: &str,
        expr: &Expr,
    ) -> Result<(), ManifestError> {
        let mut refs = Vec::new();
        collect_references(expr, &mut refs).map_err(|reason| ManifestError::InvalidColumn {
            owner: origin.object.clone(),
            column: origin.column.clone(),
            reason,
        })?;

        for reference in refs {
            match reference {
                Reference::Ident(name) => {
                    self.add_ident_edge(input, origin, owner, &name)?;
                }
                Reference::Chain(parts) => {
                    self.add_chain_edges(input, origin, owner, &parts)?;
                }
            }
        }
        Ok(())
    }

    /// Edges for a derived model's physical column: plain identifiers
    /// into the base object's columns; enum accesses contribute nothing;
    /// dereferences are not available here.
    fn add_base_physical_edges(
        &mut self,
        input: &LineageInput<'_>,
        origin: &ColumnKey,
        base: &str,
        expr: &Expr,
    ) -> Result<(), ManifestError> {
        let mut refs = Vec::new();
        collect_references(expr, &mut refs).map_err(|reason| ManifestError::InvalidColumn {
            owner: origin.object.clone(),
            column: origin.column.clone(),
            reason,
        })?;
        for reference in refs {
            match reference {
                Reference::Ident(name) => {
                    if !base_has_column(input, base, &name) {
                        return Err(ManifestError::UnknownReference {
                            owner: format!("column '{origin}'"),
                            reference: format!("{base}.{name}"),
                        });
                    }
                    self.add_edge(origin, &ColumnKey::new(base, &name));
                    self.record_immediate(origin, base, &name);
                }
                Reference::Chain(parts) => {
                    let head = parts[0].as_str();
                    let known_enum = input
                        .enum_definitions
                        .get(head)
                        .map(|e| parts.len() == 2 && e.value_of(&parts[1]).is_some())
                        .unwrap_or(false);
                    if !known_enum {
                        return Err(ManifestError::InvalidColumn {
                            owner: origin.object.clone(),
                            column: origin.column.clone(),
                            reason: format!(
                                "physical columns of a derived model can only reference \
                                 base columns, found '{}'",
                                parts.join(".")
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn add_ident_edge(
        &mut self,
        input: &LineageInput<'_>,
        origin: &ColumnKey,
        owner: &str,
        name: &str,
    ) -> Result<(), ManifestError> {
        let Some(column) = base_column(input, owner, name) else {
            return Err(ManifestError::UnknownReference {
                owner: format!("column '{origin}'"),
                reference: format!("{owner}.{name}"),
            });
        };
        if column.kind() == ColumnKind::Relationship {
            // Bare relationship reference (count(orders)): the target rows
            // are required, no specific column.
            return self.add_relationship_hop(input, origin, owner, &column, &[]);
        }
        self.add_edge(origin, &ColumnKey::new(owner, name));
        self.record_immediate(origin, owner, name);
        Ok(())
    }

    fn add_chain_edges(
        &mut self,
        input: &LineageInput<'_>,
        origin: &ColumnKey,
        owner: &str,
        parts: &[String],
    ) -> Result<(), ManifestError> {
        let head = parts[0].as_str();

        // Enum access resolves to a literal; it contributes no lineage.
        if let Some(definition) = input.enum_definitions.get(head) {
            if parts.len() == 2 && definition.value_of(&parts[1]).is_some() {
                return Ok(());
            }
            return Err(ManifestError::UnknownReference {
                owner: format!("column '{origin}'"),
                reference: parts.join("."),
            });
        }

        // Self-qualified reference: `Orders.custkey` inside Orders.
        if head == owner && parts.len() == 2 {
            return self.add_ident_edge(input, origin, owner, &parts[1]);
        }

        let Some(column) = base_column(input, owner, head) else {
            return Err(ManifestError::UnknownReference {
                owner: format!("column '{origin}'"),
                reference: parts.join("."),
            });
        };
        if column.kind() != ColumnKind::Relationship {
            return Err(ManifestError::InvalidColumn {
                owner: origin.object.clone(),
                column: origin.column.clone(),
                reason: format!(
                    "'{head}' is not a relationship column; dereference requires one"
                ),
            });
        }
        self.add_relationship_hop(input, origin, owner, &column, &parts[1..])
    }

    /// Walk one or more relationship hops, adding join-key edges per hop
    /// and the terminal column (or row-only requirement) at the end.
    fn add_relationship_hop(
        &mut self,
        input: &LineageInput<'_>,
        origin: &ColumnKey,
        owner: &str,
        column: &Arc<Column>,
        rest: &[String],
    ) -> Result<(), ManifestError> {
        let rel_name = column.relationship.as_deref().unwrap_or_default();
        let Some(relationship) = input.relationships.get(rel_name) else {
            return Err(ManifestError::UnknownReference {
                owner: format!("column '{origin}'"),
                reference: rel_name.to_string(),
            });
        };
        let [left, right] = &relationship.models[..] else {
            return Err(ManifestError::InvalidRelationship {
                name: relationship.name.clone(),
                reason: "expected two endpoint models".to_string(),
            });
        };
        for pair in input.join_keys.get(rel_name).into_iter().flatten() {
            self.add_edge(origin, &ColumnKey::new(left, &pair.left_column));
            self.add_edge(origin, &ColumnKey::new(right, &pair.right_column));
        }

        let target = column.r#type.clone();
        match rest {
            [] => {
                // Row-only requirement on the target.
                self.add_edge(origin, &ColumnKey::new(&target, ""));
                self.immediate
                    .entry(origin.clone())
                    .or_default()
                    .entry(target)
                    .or_default();
                Ok(())
            }
            [terminal] => {
                let Some(target_column) = base_column(input, &target, terminal) else {
                    return Err(ManifestError::UnknownReference {
                        owner: format!("column '{origin}'"),
                        reference: format!("{target}.{terminal}"),
                    });
                };
                if target_column.kind() == ColumnKind::Relationship {
                    return self.add_relationship_hop(input, origin, &target, &target_column, &[]);
                }
                self.add_edge(origin, &ColumnKey::new(&target, terminal));
                self.record_immediate(origin, &target, terminal);
                Ok(())
            }
            [next, remainder @ ..] => {
                let Some(target_column) = base_column(input, &target, next) else {
                    return Err(ManifestError::UnknownReference {
                        owner: format!("column '{origin}'"),
                        reference: format!("{target}.{next}"),
                    });
                };
                if target_column.kind() != ColumnKind::Relationship {
                    return Err(ManifestError::InvalidColumn {
                        owner: origin.object.clone(),
                        column: origin.column.clone(),
                        reason: format!(
                            "'{target}.{next}' is not a relationship column; \
                             dereference requires one"
                        ),
                    });
                }
                self.add_relationship_hop(input, origin, &target, &target_column, remainder)
            }
        }
    }
}

fn record(fields: &mut IndexMap<String, BTreeSet<String>>, key: &ColumnKey) {
    let entry = fields.entry(key.object.clone()).or_default();
    if !key.column.is_empty() {
        entry.insert(key.column.clone());
    }
}

fn parse_column_expression(owner: &str, column: &Column) -> Result<Expr, ManifestError> {
    let text = column.source_expression();
    sql::parse_expression(text).map_err(|e| ManifestError::InvalidColumn {
        owner: owner.to_string(),
        column: column.name.clone(),
        reason: e.to_string(),
    })
}

fn base_column<'a>(
    input: &'a LineageInput<'_>,
    object: &str,
    column: &str,
) -> Option<Arc<Column>> {
    if let Some(model) = input.models.get(object) {
        return model.column(column).cloned();
    }
    if let Some(metric) = input.metrics.get(object) {
        return metric.column(column).cloned();
    }
    None
}

fn base_has_column(input: &LineageInput<'_>, object: &str, column: &str) -> bool {
    if base_column(input, object, column).is_some() {
        return true;
    }
    if let Some(cm) = input.cumulative_metrics.get(object) {
        return cm.window.name == column || cm.measure.name == column;
    }
    false
}

/// A column reference found in a calculated expression.
enum Reference {
    Ident(String),
    Chain(Vec<String>),
}

/// Collect every identifier reference in an expression. Errors carry a
/// human-readable reason; the caller attributes them to the owning
/// column.
fn collect_references(expr: &Expr, out: &mut Vec<Reference>) -> Result<(), String> {
    match expr {
        Expr::Identifier(ident) => {
            out.push(Reference::Ident(ident.value.clone()));
            Ok(())
        }
        Expr::CompoundIdentifier(parts) => {
            out.push(Reference::Chain(
                parts.iter().map(|i| i.value.clone()).collect(),
            ));
            Ok(())
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_references(left, out)?;
            collect_references(right, out)
        }
        Expr::UnaryOp { expr, .. } => collect_references(expr, out),
        Expr::Nested(inner) => collect_references(inner, out),
        Expr::Function(function) => {
            if function.over.is_some() {
                return Err("window functions are not supported in calculated expressions"
                    .to_string());
            }
            match &function.args {
                FunctionArguments::List(list) => {
                    for arg in &list.args {
                        match arg {
                            FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                                collect_references(e, out)?;
                            }
                            FunctionArg::Named {
                                arg: FunctionArgExpr::Expr(e),
                                ..
                            } => {
                                collect_references(e, out)?;
                            }
                            // count(*) requires no columns.
                            _ => {}
                        }
                    }
                    Ok(())
                }
                FunctionArguments::None => Ok(()),
                FunctionArguments::Subquery(_) => {
                    Err("subqueries are not supported in calculated expressions".to_string())
                }
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                collect_references(operand, out)?;
            }
            for expr in conditions.iter().chain(results.iter()) {
                collect_references(expr, out)?;
            }
            if let Some(else_result) = else_result {
                collect_references(else_result, out)?;
            }
            Ok(())
        }
        Expr::Cast { expr, .. } => collect_references(expr, out),
        Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsNotTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::IsNotFalse(inner) => collect_references(inner, out),
        Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
            collect_references(left, out)?;
            collect_references(right, out)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_references(expr, out)?;
            collect_references(low, out)?;
            collect_references(high, out)
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            collect_references(expr, out)?;
            collect_references(pattern, out)
        }
        Expr::InList { expr, list, .. } => {
            collect_references(expr, out)?;
            for item in list {
                collect_references(item, out)?;
            }
            Ok(())
        }
        Expr::Tuple(items) => {
            for item in items {
                collect_references(item, out)?;
            }
            Ok(())
        }
        Expr::Extract { expr, .. } => collect_references(expr, out),
        Expr::Value(_) | Expr::TypedString { .. } | Expr::Interval(_) => Ok(()),
        Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => {
            Err("subqueries are not supported in calculated expressions".to_string())
        }
        other => Err(format!("unsupported expression: {other}")),
    }
}
