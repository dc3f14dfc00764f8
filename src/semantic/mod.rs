//! Manifest analysis: indexes, invariants, and the analyzed handle shared
//! across planning operations.
//!
//! [`AnalyzedManifest::analyze`] is total: it either returns a handle
//! satisfying every manifest invariant (unique names, resolvable
//! references, exactly one origin per model, valid windows) or fails with
//! a specific [`ManifestError`]. The handle is immutable and carries no
//! interior mutability; concurrent planning operations share it by
//! reference.
//!
//! Calculated-field cycles are deliberately *not* rejected here. The
//! lineage graph may contain cycles; only a traversal that touches one
//! fails (see [`lineage`]).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlparser::ast::{BinaryOperator, Expr};

use crate::error::ManifestError;
use crate::manifest::{
    Column, ColumnKind, CumulativeMetric, EnumDefinition, Macro, Manifest, Metric, Model,
    Relationship, View,
};
use crate::sql;

pub mod lineage;

use lineage::Lineage;

/// A planable manifest object.
#[derive(Debug, Clone)]
pub enum Dataset {
    Model(Arc<Model>),
    Metric(Arc<Metric>),
    CumulativeMetric(Arc<CumulativeMetric>),
    View(Arc<View>),
}

impl Dataset {
    pub fn name(&self) -> &str {
        match self {
            Dataset::Model(m) => &m.name,
            Dataset::Metric(m) => &m.name,
            Dataset::CumulativeMetric(m) => &m.name,
            Dataset::View(v) => &v.name,
        }
    }

    /// Whether the object declares a column named `name`.
    ///
    /// Views have no declared columns; a cumulative metric exposes its
    /// window bucket and its measure.
    pub fn has_column(&self, name: &str) -> bool {
        match self {
            Dataset::Model(m) => m.column(name).is_some(),
            Dataset::Metric(m) => m.column(name).is_some(),
            Dataset::CumulativeMetric(m) => {
                m.window.name == name || m.measure.name == name
            }
            Dataset::View(_) => false,
        }
    }

    /// The declared column, where the object has declared columns.
    pub fn column(&self, name: &str) -> Option<&Arc<Column>> {
        match self {
            Dataset::Model(m) => m.column(name),
            Dataset::Metric(m) => m.column(name),
            _ => None,
        }
    }

    /// Declared output column names, in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        match self {
            Dataset::Model(m) => m
                .columns
                .iter()
                .filter(|c| c.kind() != ColumnKind::Relationship)
                .map(|c| c.name.clone())
                .collect(),
            Dataset::Metric(m) => m
                .dimension
                .iter()
                .chain(m.measure.iter())
                .map(|c| c.name.clone())
                .collect(),
            Dataset::CumulativeMetric(m) => {
                vec![m.window.name.clone(), m.measure.name.clone()]
            }
            Dataset::View(_) => Vec::new(),
        }
    }
}

/// One equality conjunct of a relationship condition, oriented by the
/// relationship's declared `[left, right]` endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKeyPair {
    pub left_column: String,
    pub right_column: String,
}

/// The manifest plus its derived indexes and lineage graph.
pub struct AnalyzedManifest {
    manifest: Arc<Manifest>,
    models: HashMap<String, Arc<Model>>,
    metrics: HashMap<String, Arc<Metric>>,
    cumulative_metrics: HashMap<String, Arc<CumulativeMetric>>,
    views: HashMap<String, Arc<View>>,
    relationships: HashMap<String, Arc<Relationship>>,
    enum_definitions: HashMap<String, Arc<EnumDefinition>>,
    macros: HashMap<String, Arc<Macro>>,
    join_keys: HashMap<String, Vec<JoinKeyPair>>,
    catalog_schema_prefix: String,
    lineage: Lineage,
}

impl std::fmt::Debug for AnalyzedManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzedManifest")
            .field("catalog", &self.manifest.catalog)
            .field("schema", &self.manifest.schema)
            .field("models", &self.models.len())
            .field("metrics", &self.metrics.len())
            .field("views", &self.views.len())
            .finish()
    }
}

impl std::hash::Hash for AnalyzedManifest {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.manifest.hash(state);
    }
}

impl AnalyzedManifest {
    /// Analyze a manifest. Pure: equal manifests produce equal results.
    pub fn analyze(manifest: Manifest) -> Result<Self, ManifestError> {
        let manifest = Arc::new(manifest);

        check_unique_names(&manifest)?;

        let models: HashMap<_, _> = manifest
            .models
            .iter()
            .map(|m| (m.name.clone(), Arc::clone(m)))
            .collect();
        let metrics: HashMap<_, _> = manifest
            .metrics
            .iter()
            .map(|m| (m.name.clone(), Arc::clone(m)))
            .collect();
        let cumulative_metrics: HashMap<_, _> = manifest
            .cumulative_metrics
            .iter()
            .map(|m| (m.name.clone(), Arc::clone(m)))
            .collect();
        let views: HashMap<_, _> = manifest
            .views
            .iter()
            .map(|v| (v.name.clone(), Arc::clone(v)))
            .collect();
        let relationships: HashMap<_, _> = manifest
            .relationships
            .iter()
            .map(|r| (r.name.clone(), Arc::clone(r)))
            .collect();
        let enum_definitions: HashMap<_, _> = manifest
            .enum_definitions
            .iter()
            .map(|e| (e.name.clone(), Arc::clone(e)))
            .collect();
        let macros: HashMap<_, _> = manifest
            .macros
            .iter()
            .map(|m| (m.name.clone(), Arc::clone(m)))
            .collect();

        check_model_origins(&manifest)?;
        check_references(&manifest, &models, &metrics, &cumulative_metrics, &relationships)?;
        check_windows(&manifest)?;

        let join_keys = extract_join_keys(&manifest, &models)?;

        let lineage = Lineage::build(&lineage::LineageInput {
            models: &models,
            metrics: &metrics,
            cumulative_metrics: &cumulative_metrics,
            relationships: &relationships,
            enum_definitions: &enum_definitions,
            join_keys: &join_keys,
        })?;

        let catalog_schema_prefix =
            format!("{}.{}.", manifest.catalog, manifest.schema);

        Ok(AnalyzedManifest {
            manifest,
            models,
            metrics,
            cumulative_metrics,
            views,
            relationships,
            enum_definitions,
            macros,
            join_keys,
            catalog_schema_prefix,
            lineage,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn catalog(&self) -> &str {
        &self.manifest.catalog
    }

    pub fn schema(&self) -> &str {
        &self.manifest.schema
    }

    /// `"catalog.schema."` — references carrying this prefix are treated
    /// as unqualified.
    pub fn catalog_schema_prefix(&self) -> &str {
        &self.catalog_schema_prefix
    }

    pub fn model(&self, name: &str) -> Option<&Arc<Model>> {
        self.models.get(name)
    }

    pub fn metric(&self, name: &str) -> Option<&Arc<Metric>> {
        self.metrics.get(name)
    }

    pub fn cumulative_metric(&self, name: &str) -> Option<&Arc<CumulativeMetric>> {
        self.cumulative_metrics.get(name)
    }

    pub fn view(&self, name: &str) -> Option<&Arc<View>> {
        self.views.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Arc<Relationship>> {
        self.relationships.get(name)
    }

    pub fn enum_definition(&self, name: &str) -> Option<&Arc<EnumDefinition>> {
        self.enum_definitions.get(name)
    }

    pub fn macro_def(&self, name: &str) -> Option<&Arc<Macro>> {
        self.macros.get(name)
    }

    /// Any planable object by name.
    pub fn object(&self, name: &str) -> Option<Dataset> {
        if let Some(m) = self.models.get(name) {
            return Some(Dataset::Model(Arc::clone(m)));
        }
        if let Some(m) = self.metrics.get(name) {
            return Some(Dataset::Metric(Arc::clone(m)));
        }
        if let Some(m) = self.cumulative_metrics.get(name) {
            return Some(Dataset::CumulativeMetric(Arc::clone(m)));
        }
        if let Some(v) = self.views.get(name) {
            return Some(Dataset::View(Arc::clone(v)));
        }
        None
    }

    pub fn list_models(&self) -> &[Arc<Model>] {
        &self.manifest.models
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// The equality join keys of a relationship, oriented by its declared
    /// endpoints.
    pub fn join_keys(&self, relationship: &str) -> Option<&[JoinKeyPair]> {
        self.join_keys.get(relationship).map(|v| v.as_slice())
    }
}

/// A column together with the object declaring it.
#[derive(Debug, Clone)]
pub struct ColumnReference {
    pub dataset: Dataset,
    pub column: Arc<Column>,
}

impl ColumnReference {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.dataset.name(), self.column.name)
    }
}

/// Fully-qualified column references under one session's catalog/schema
/// prefix. Derived per `(manifest, session)` pair and memoized by
/// [`crate::cache::PlanCache`].
pub struct SessionIndex {
    prefix: String,
    qualified_references: HashMap<String, ColumnReference>,
}

impl SessionIndex {
    pub fn new(analyzed: &AnalyzedManifest, catalog: &str, schema: &str) -> Self {
        let prefix = format!("{catalog}.{schema}.");
        let mut qualified_references = HashMap::new();
        for model in &analyzed.manifest.models {
            for column in &model.columns {
                qualified_references.insert(
                    format!("{prefix}{}.{}", model.name, column.name),
                    ColumnReference {
                        dataset: Dataset::Model(Arc::clone(model)),
                        column: Arc::clone(column),
                    },
                );
            }
        }
        for metric in &analyzed.manifest.metrics {
            for column in metric.dimension.iter().chain(metric.measure.iter()) {
                qualified_references.insert(
                    format!("{prefix}{}.{}", metric.name, column.name),
                    ColumnReference {
                        dataset: Dataset::Metric(Arc::clone(metric)),
                        column: Arc::clone(column),
                    },
                );
            }
        }
        SessionIndex {
            prefix,
            qualified_references,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Look up `object.column`, with or without the session prefix.
    pub fn resolve(&self, reference: &str) -> Option<&ColumnReference> {
        if let Some(found) = self.qualified_references.get(reference) {
            return Some(found);
        }
        self.qualified_references
            .get(&format!("{}{reference}", self.prefix))
    }
}

fn check_unique_names(manifest: &Manifest) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    let objects = manifest
        .models
        .iter()
        .map(|m| ("object", m.name.as_str()))
        .chain(manifest.metrics.iter().map(|m| ("object", m.name.as_str())))
        .chain(
            manifest
                .cumulative_metrics
                .iter()
                .map(|m| ("object", m.name.as_str())),
        )
        .chain(manifest.views.iter().map(|v| ("object", v.name.as_str())));
    for (kind, name) in objects {
        if !seen.insert(name) {
            return Err(ManifestError::DuplicateName {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
    }

    let mut relationships = HashSet::new();
    for r in &manifest.relationships {
        if !relationships.insert(r.name.as_str()) {
            return Err(ManifestError::DuplicateName {
                kind: "relationship".to_string(),
                name: r.name.clone(),
            });
        }
    }
    let mut enums = HashSet::new();
    for e in &manifest.enum_definitions {
        if !enums.insert(e.name.as_str()) {
            return Err(ManifestError::DuplicateName {
                kind: "enum".to_string(),
                name: e.name.clone(),
            });
        }
    }
    let mut macros = HashSet::new();
    for m in &manifest.macros {
        if !macros.insert(m.name.as_str()) {
            return Err(ManifestError::DuplicateName {
                kind: "macro".to_string(),
                name: m.name.clone(),
            });
        }
    }

    for model in &manifest.models {
        let mut columns = HashSet::new();
        for column in &model.columns {
            if !columns.insert(column.name.as_str()) {
                return Err(ManifestError::DuplicateName {
                    kind: format!("column in model '{}'", model.name),
                    name: column.name.clone(),
                });
            }
        }
    }
    for metric in &manifest.metrics {
        let mut columns = HashSet::new();
        for column in metric.dimension.iter().chain(metric.measure.iter()) {
            if !columns.insert(column.name.as_str()) {
                return Err(ManifestError::DuplicateName {
                    kind: format!("column in metric '{}'", metric.name),
                    name: column.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_model_origins(manifest: &Manifest) -> Result<(), ManifestError> {
    for model in &manifest.models {
        if model.origin().is_none() {
            return Err(ManifestError::InvalidOrigin {
                model: model.name.clone(),
            });
        }
    }
    Ok(())
}

fn check_references(
    manifest: &Manifest,
    models: &HashMap<String, Arc<Model>>,
    metrics: &HashMap<String, Arc<Metric>>,
    cumulative_metrics: &HashMap<String, Arc<CumulativeMetric>>,
    relationships: &HashMap<String, Arc<Relationship>>,
) -> Result<(), ManifestError> {
    let base_resolves = |name: &str| {
        models.contains_key(name)
            || metrics.contains_key(name)
            || cumulative_metrics.contains_key(name)
    };

    for model in &manifest.models {
        if let Some(base) = &model.base_object {
            if !base_resolves(base) {
                return Err(ManifestError::UnknownReference {
                    owner: format!("model '{}'", model.name),
                    reference: base.clone(),
                });
            }
        }
        if let Some(key) = &model.primary_key {
            if model.column(key).is_none() {
                return Err(ManifestError::UnknownReference {
                    owner: format!("model '{}' primary key", model.name),
                    reference: key.clone(),
                });
            }
        }
        for column in &model.columns {
            match column.kind() {
                ColumnKind::Relationship => {
                    let rel_name = column.relationship.as_deref().unwrap_or_default();
                    let Some(rel) = relationships.get(rel_name) else {
                        return Err(ManifestError::UnknownReference {
                            owner: format!("column '{}.{}'", model.name, column.name),
                            reference: rel_name.to_string(),
                        });
                    };
                    // The column's type names the target model; the owning
                    // model must be the other endpoint.
                    match rel.other_side(&model.name) {
                        Some(other) if other == column.r#type => {}
                        _ => {
                            return Err(ManifestError::InvalidColumn {
                                owner: model.name.clone(),
                                column: column.name.clone(),
                                reason: format!(
                                    "relationship '{}' does not join '{}' to '{}'",
                                    rel.name, model.name, column.r#type
                                ),
                            });
                        }
                    }
                }
                ColumnKind::Calculated => {
                    if column.expression.is_none() {
                        return Err(ManifestError::InvalidColumn {
                            owner: model.name.clone(),
                            column: column.name.clone(),
                            reason: "calculated column requires an expression".to_string(),
                        });
                    }
                }
                ColumnKind::Physical => {}
            }
        }
    }

    for metric in &manifest.metrics {
        if !base_resolves(&metric.base_object) {
            return Err(ManifestError::UnknownReference {
                owner: format!("metric '{}'", metric.name),
                reference: metric.base_object.clone(),
            });
        }
    }
    for metric in &manifest.cumulative_metrics {
        if !base_resolves(&metric.base_object) {
            return Err(ManifestError::UnknownReference {
                owner: format!("cumulative metric '{}'", metric.name),
                reference: metric.base_object.clone(),
            });
        }
    }

    for relationship in &manifest.relationships {
        if relationship.models.len() != 2 {
            return Err(ManifestError::InvalidRelationship {
                name: relationship.name.clone(),
                reason: format!(
                    "expected two endpoint models, found {}",
                    relationship.models.len()
                ),
            });
        }
        for endpoint in &relationship.models {
            if !models.contains_key(endpoint) {
                return Err(ManifestError::UnknownReference {
                    owner: format!("relationship '{}'", relationship.name),
                    reference: endpoint.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_windows(manifest: &Manifest) -> Result<(), ManifestError> {
    for metric in &manifest.cumulative_metrics {
        let window = &metric.window;
        let parse = |label: &str, value: &str| {
            chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
                ManifestError::InvalidWindow {
                    metric: metric.name.clone(),
                    reason: format!("{label} '{value}' is not an ISO date"),
                }
            })
        };
        let start = parse("start", &window.start)?;
        let end = parse("end", &window.end)?;
        if start > end {
            return Err(ManifestError::InvalidWindow {
                metric: metric.name.clone(),
                reason: format!("start {} is after end {}", window.start, window.end),
            });
        }
    }
    Ok(())
}

/// Parse every relationship condition into oriented equality pairs.
///
/// Conditions must be conjunctions of `left.col = right.col` comparisons
/// between the two endpoints; that is the form the join planner can key
/// on.
fn extract_join_keys(
    manifest: &Manifest,
    models: &HashMap<String, Arc<Model>>,
) -> Result<HashMap<String, Vec<JoinKeyPair>>, ManifestError> {
    let mut join_keys = HashMap::new();
    for relationship in &manifest.relationships {
        let expr = sql::parse_expression(&relationship.condition).map_err(|e| {
            ManifestError::InvalidRelationship {
                name: relationship.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut pairs = Vec::new();
        collect_equality_pairs(relationship, models, &expr, &mut pairs)?;
        if pairs.is_empty() {
            return Err(ManifestError::InvalidRelationship {
                name: relationship.name.clone(),
                reason: "condition has no equality comparison".to_string(),
            });
        }
        join_keys.insert(relationship.name.clone(), pairs);
    }
    Ok(join_keys)
}

fn collect_equality_pairs(
    relationship: &Relationship,
    models: &HashMap<String, Arc<Model>>,
    expr: &Expr,
    pairs: &mut Vec<JoinKeyPair>,
) -> Result<(), ManifestError> {
    let invalid = |reason: String| ManifestError::InvalidRelationship {
        name: relationship.name.clone(),
        reason,
    };
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_equality_pairs(relationship, models, left, pairs)?;
            collect_equality_pairs(relationship, models, right, pairs)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let (left_model, left_column) = qualified_column(left)
                .ok_or_else(|| invalid("equality side must be model.column".to_string()))?;
            let (right_model, right_column) = qualified_column(right)
                .ok_or_else(|| invalid("equality side must be model.column".to_string()))?;
            let [first, second] = &relationship.models[..] else {
                return Err(invalid("expected two endpoint models".to_string()));
            };
            let pair = if left_model == *first && right_model == *second {
                JoinKeyPair {
                    left_column: left_column.to_string(),
                    right_column: right_column.to_string(),
                }
            } else if left_model == *second && right_model == *first {
                JoinKeyPair {
                    left_column: right_column.to_string(),
                    right_column: left_column.to_string(),
                }
            } else {
                return Err(invalid(format!(
                    "condition references '{left_model}' and '{right_model}', expected \
                     '{first}' and '{second}'"
                )));
            };
            for (model, column) in [
                (first, &pair.left_column),
                (second, &pair.right_column),
            ] {
                let declared = models
                    .get(model)
                    .map(|m| m.column(column).is_some())
                    .unwrap_or(false);
                if !declared {
                    return Err(ManifestError::UnknownReference {
                        owner: format!("relationship '{}'", relationship.name),
                        reference: format!("{model}.{column}"),
                    });
                }
            }
            pairs.push(pair);
            Ok(())
        }
        Expr::Nested(inner) => collect_equality_pairs(relationship, models, inner, pairs),
        other => Err(invalid(format!(
            "only conjunctions of equality comparisons are supported, found {other}"
        ))),
    }
}

fn qualified_column(expr: &Expr) -> Option<(&str, &str)> {
    match expr {
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
            Some((parts[0].value.as_str(), parts[1].value.as_str()))
        }
        Expr::Nested(inner) => qualified_column(inner),
        _ => None,
    }
}
