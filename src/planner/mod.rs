//! Query descriptors: the per-object CTE specifications.
//!
//! A [`QueryDescriptor`] names one CTE, the objects its body references,
//! and the body SQL. Descriptors are built on demand by the rewrite
//! engine; bodies are plain SQL text that the engine re-parses and
//! canonicalizes before splicing, so malformed emission is caught inside
//! the planner rather than by the backend.

use std::collections::BTreeSet;

use indexmap::{IndexMap, IndexSet};

use crate::error::{ManifestError, PlanError, PlanResult};
use crate::manifest::{
    Column, ColumnKind, CumulativeMetric, Metric, Model, ModelOrigin, TimeUnit, Window,
};
use crate::semantic::{AnalyzedManifest, Dataset};
use crate::sql::{self, quote_ident, quote_qualified};

pub mod calc;

/// The specification for one CTE.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub name: String,
    pub required_objects: IndexSet<String>,
    pub sql: String,
}

/// Shared inputs for descriptor building within one statement.
pub struct DescriptorInput<'a> {
    pub analyzed: &'a AnalyzedManifest,
    /// Required columns per object. In dynamic-fields mode this is the
    /// lineage output; in full-materialization mode it is ignored.
    pub fields: &'a IndexMap<String, BTreeSet<String>>,
    /// Objects consumed for their rows without any enumerated column.
    pub source_nodes: &'a IndexSet<String>,
    pub dynamic_fields: bool,
}

/// Build the descriptor for a model, metric, or cumulative metric.
///
/// Views are expanded by the rewrite engine, which owns the recursive
/// statement pipeline.
pub fn build_descriptor(
    input: &DescriptorInput<'_>,
    spines: &mut SpineRegistry,
    name: &str,
) -> PlanResult<QueryDescriptor> {
    match input.analyzed.object(name) {
        Some(Dataset::Model(model)) => model_descriptor(input, &model),
        Some(Dataset::Metric(metric)) => metric_descriptor(input, &metric),
        Some(Dataset::CumulativeMetric(metric)) => cumulative_descriptor(spines, &metric),
        Some(Dataset::View(_)) => Err(PlanError::internal(format!(
            "view '{name}' reached the descriptor builder"
        ))),
        None => Err(PlanError::UnknownObject {
            name: name.to_string(),
        }),
    }
}

// =========================================================================
// Models
// =========================================================================

fn model_descriptor(
    input: &DescriptorInput<'_>,
    model: &Model,
) -> PlanResult<QueryDescriptor> {
    let required: BTreeSet<String> = if input.dynamic_fields {
        input.fields.get(&model.name).cloned().unwrap_or_default()
    } else {
        model
            .columns
            .iter()
            .filter(|c| c.kind() != ColumnKind::Relationship)
            .map(|c| c.name.clone())
            .collect()
    };

    if required.is_empty() {
        return thin_model_descriptor(input, model);
    }

    let mut physical: Vec<&Column> = Vec::new();
    let mut calculated: Vec<&Column> = Vec::new();
    for column in &model.columns {
        if !required.contains(&column.name) {
            continue;
        }
        match column.kind() {
            ColumnKind::Physical => physical.push(column),
            ColumnKind::Calculated => calculated.push(column),
            ColumnKind::Relationship => {}
        }
    }

    let (origin, mut required_objects) = origin_sql(model)?;

    let mut inner_items: Vec<String> = Vec::new();
    for column in &physical {
        inner_items.push(format!(
            "{} AS {}",
            render_source_expression(model, column)?,
            quote_ident(&column.name)
        ));
    }
    if inner_items.is_empty() {
        inner_items.push("1 AS one_".to_string());
    }
    let inner = format!(
        "SELECT {} FROM {} AS {}",
        inner_items.join(", "),
        origin,
        quote_ident(&model.name)
    );

    if calculated.is_empty() {
        return Ok(QueryDescriptor {
            name: model.name.clone(),
            required_objects,
            sql: inner,
        });
    }

    let mut outer_items: Vec<String> = Vec::new();
    let mut join_aliases: IndexSet<String> = IndexSet::new();
    let mut joins: Vec<String> = Vec::new();
    for column in &model.columns {
        if !required.contains(&column.name) {
            continue;
        }
        match column.kind() {
            ColumnKind::Physical => outer_items.push(format!(
                "{} AS {}",
                quote_qualified(&[&model.name, &column.name]),
                quote_ident(&column.name)
            )),
            ColumnKind::Calculated => {
                let rewrite =
                    calc::rewrite_column(input.analyzed, &model.name, &model.name, column)?;
                outer_items.push(format!(
                    "{} AS {}",
                    rewrite.expression,
                    quote_ident(&column.name)
                ));
                for join in rewrite.joins {
                    if join_aliases.insert(join.alias) {
                        joins.push(join.sql);
                    }
                }
                required_objects.extend(rewrite.required_objects);
            }
            ColumnKind::Relationship => {}
        }
    }

    let mut sql = format!(
        "SELECT {} FROM ({inner}) AS {}",
        outer_items.join(", "),
        quote_ident(&model.name)
    );
    for join in joins {
        sql.push(' ');
        sql.push_str(&join);
    }

    Ok(QueryDescriptor {
        name: model.name.clone(),
        required_objects,
        sql,
    })
}

/// A model referenced without any columns: either its rows are consumed
/// (`count(*)`) and the origin materializes with a constant projection,
/// or nothing of it is consumed and a dummy keeps the name alive.
fn thin_model_descriptor(
    input: &DescriptorInput<'_>,
    model: &Model,
) -> PlanResult<QueryDescriptor> {
    if !input.source_nodes.contains(&model.name) {
        return Ok(QueryDescriptor {
            name: model.name.clone(),
            required_objects: IndexSet::new(),
            sql: "SELECT NULL AS dummy_".to_string(),
        });
    }
    let (origin, required_objects) = origin_sql(model)?;
    let projection = match (&model.primary_key, &model.base_object) {
        // Project the key when it maps straight onto a physical column;
        // otherwise a constant preserves cardinality just as well.
        (Some(key), None) => match model.column(key) {
            Some(column) if column.kind() == ColumnKind::Physical => format!(
                "{} AS {}",
                render_source_expression(model, &column)?,
                quote_ident(key)
            ),
            _ => "1 AS one_".to_string(),
        },
        _ => "1 AS one_".to_string(),
    };
    Ok(QueryDescriptor {
        name: model.name.clone(),
        required_objects,
        sql: format!(
            "SELECT {projection} FROM {origin} AS {}",
            quote_ident(&model.name)
        ),
    })
}

/// Render a model's origin as a FROM-able fragment plus the objects it
/// references.
fn origin_sql(model: &Model) -> PlanResult<(String, IndexSet<String>)> {
    let origin = model.origin().ok_or_else(|| {
        PlanError::Manifest(ManifestError::InvalidOrigin {
            model: model.name.clone(),
        })
    })?;
    match origin {
        ModelOrigin::RefSql(raw) => {
            let statement = sql::parse_statement(raw).map_err(|e| {
                PlanError::Manifest(ManifestError::InvalidColumn {
                    owner: model.name.clone(),
                    column: "refSql".to_string(),
                    reason: e.to_string(),
                })
            })?;
            Ok((format!("({statement})"), IndexSet::new()))
        }
        ModelOrigin::BaseObject(base) => {
            Ok((quote_ident(base), IndexSet::from([base.to_string()])))
        }
        ModelOrigin::TableReference(table) => {
            let mut parts: Vec<&str> = Vec::new();
            if let Some(catalog) = table.catalog.as_deref().filter(|c| !c.is_empty()) {
                parts.push(catalog);
            }
            if let Some(schema) = table.schema.as_deref().filter(|s| !s.is_empty()) {
                parts.push(schema);
            }
            parts.push(&table.table);
            Ok((quote_qualified(&parts), IndexSet::new()))
        }
    }
}

fn render_source_expression(model: &Model, column: &Column) -> PlanResult<String> {
    let expr = sql::parse_expression(column.source_expression()).map_err(|e| {
        PlanError::Manifest(ManifestError::InvalidColumn {
            owner: model.name.clone(),
            column: column.name.clone(),
            reason: e.to_string(),
        })
    })?;
    Ok(expr.to_string())
}

// =========================================================================
// Metrics
// =========================================================================

fn metric_descriptor(
    input: &DescriptorInput<'_>,
    metric: &Metric,
) -> PlanResult<QueryDescriptor> {
    let required: BTreeSet<String> = if input.dynamic_fields {
        input.fields.get(&metric.name).cloned().unwrap_or_default()
    } else {
        metric
            .dimension
            .iter()
            .chain(metric.measure.iter())
            .map(|c| c.name.clone())
            .collect()
    };
    if required.is_empty() && !input.source_nodes.contains(&metric.name) {
        return Ok(QueryDescriptor {
            name: metric.name.clone(),
            required_objects: IndexSet::new(),
            sql: "SELECT NULL AS dummy_".to_string(),
        });
    }

    let base = &metric.base_object;
    let mut required_objects = IndexSet::from([base.clone()]);
    let mut items: Vec<String> = Vec::new();
    let mut groups: Vec<String> = Vec::new();
    let mut join_aliases: IndexSet<String> = IndexSet::new();
    let mut joins: Vec<String> = Vec::new();

    // Dimensions always project in full: narrowing them would change the
    // grouping, and with it the aggregate values.
    for dimension in &metric.dimension {
        let rewrite = calc::rewrite_column(input.analyzed, base, base, dimension)?;
        items.push(format!(
            "{} AS {}",
            rewrite.expression,
            quote_ident(&dimension.name)
        ));
        groups.push(rewrite.expression.clone());
        for join in rewrite.joins {
            if join_aliases.insert(join.alias) {
                joins.push(join.sql);
            }
        }
        required_objects.extend(rewrite.required_objects);
    }

    // Measures narrow in dynamic mode; a metric consumed only for its
    // rows keeps them all.
    let narrow = input.dynamic_fields && !input.source_nodes.contains(&metric.name);
    for measure in &metric.measure {
        if narrow && !required.contains(&measure.name) {
            continue;
        }
        let rewrite = calc::rewrite_column(input.analyzed, base, base, measure)?;
        items.push(format!(
            "{} AS {}",
            rewrite.expression,
            quote_ident(&measure.name)
        ));
        for join in rewrite.joins {
            if join_aliases.insert(join.alias) {
                joins.push(join.sql);
            }
        }
        required_objects.extend(rewrite.required_objects);
    }

    let mut sql = format!("SELECT {} FROM {}", items.join(", "), quote_ident(base));
    for join in joins {
        sql.push(' ');
        sql.push_str(&join);
    }
    if !groups.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
    }

    Ok(QueryDescriptor {
        name: metric.name.clone(),
        required_objects,
        sql,
    })
}

// =========================================================================
// Cumulative metrics and the date spine
// =========================================================================

/// The date-spine CTEs of one statement, deduplicated by window. The
/// first window gets the plain `date_spine_` name.
#[derive(Default)]
pub struct SpineRegistry {
    spines: IndexMap<(TimeUnit, String, String), QueryDescriptor>,
}

impl SpineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The spine CTE name for `window`, creating the descriptor on first
    /// use.
    pub fn ensure(&mut self, window: &Window) -> String {
        let key = (
            window.time_unit,
            window.start.clone(),
            window.end.clone(),
        );
        if let Some(descriptor) = self.spines.get(&key) {
            return descriptor.name.clone();
        }
        let name = if self.spines.is_empty() {
            "date_spine_".to_string()
        } else {
            format!("date_spine_{}_", self.spines.len() + 1)
        };
        self.spines.insert(
            key,
            QueryDescriptor {
                name: name.clone(),
                required_objects: IndexSet::new(),
                sql: spine_sql(window),
            },
        );
        name
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &QueryDescriptor> {
        self.spines.values()
    }
}

fn spine_sql(window: &Window) -> String {
    // QUARTER is not a portable interval unit; three months is.
    let (step, unit) = match window.time_unit {
        TimeUnit::Day => ("1", "DAY"),
        TimeUnit::Week => ("1", "WEEK"),
        TimeUnit::Month => ("1", "MONTH"),
        TimeUnit::Quarter => ("3", "MONTH"),
        TimeUnit::Year => ("1", "YEAR"),
    };
    format!(
        "SELECT t.d AS date_ FROM generate_series(DATE '{}', DATE '{}', \
         INTERVAL '{step}' {unit}) AS t(d)",
        window.start, window.end
    )
}

fn cumulative_descriptor(
    spines: &mut SpineRegistry,
    metric: &CumulativeMetric,
) -> PlanResult<QueryDescriptor> {
    let spine = spines.ensure(&metric.window);
    let base = &metric.base_object;
    let unit = metric.window.time_unit.sql_name();

    // Each spine bucket aggregates every base row up to and including
    // that bucket: a densified cumulative series.
    let sql = format!(
        "SELECT {spine}.date_ AS {window_name}, {op}({measure_ref}) AS {measure_name} \
         FROM {spine} LEFT JOIN {base_q} ON date_trunc('{unit}', {window_ref}) <= \
         {spine}.date_ GROUP BY {spine}.date_",
        window_name = quote_ident(&metric.window.name),
        op = metric.measure.operator.sql_name(),
        measure_ref = quote_qualified(&[base, &metric.measure.ref_column]),
        measure_name = quote_ident(&metric.measure.name),
        base_q = quote_ident(base),
        window_ref = quote_qualified(&[base, &metric.window.ref_column]),
    );

    Ok(QueryDescriptor {
        name: metric.name.clone(),
        required_objects: IndexSet::from([base.clone(), spine]),
        sql,
    })
}
