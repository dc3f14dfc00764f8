//! Fluent builders for manifest objects.
//!
//! Primarily used by tests and embedding code that assembles a manifest
//! programmatically instead of deserializing JSON.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    AggregateOperator, Column, CumulativeMetric, EnumDefinition, EnumValue, JoinType, Macro,
    Manifest, Measure, Metric, Model, Relationship, TableReference, TimeUnit, View, Window,
};

#[derive(Default)]
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.manifest.catalog = catalog.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.manifest.schema = schema.into();
        self
    }

    pub fn model(mut self, model: Model) -> Self {
        self.manifest.models.push(Arc::new(model));
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.manifest.relationships.push(Arc::new(relationship));
        self
    }

    pub fn metric(mut self, metric: Metric) -> Self {
        self.manifest.metrics.push(Arc::new(metric));
        self
    }

    pub fn cumulative_metric(mut self, metric: CumulativeMetric) -> Self {
        self.manifest.cumulative_metrics.push(Arc::new(metric));
        self
    }

    pub fn view(mut self, view: View) -> Self {
        self.manifest.views.push(Arc::new(view));
        self
    }

    pub fn enum_definition(mut self, def: EnumDefinition) -> Self {
        self.manifest.enum_definitions.push(Arc::new(def));
        self
    }

    pub fn macro_def(mut self, def: Macro) -> Self {
        self.manifest.macros.push(Arc::new(def));
        self
    }

    pub fn build(self) -> Manifest {
        self.manifest
    }
}

pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ModelBuilder {
            model: Model {
                name: name.into(),
                ref_sql: None,
                base_object: None,
                table_reference: None,
                columns: Vec::new(),
                primary_key: None,
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn ref_sql(mut self, sql: impl Into<String>) -> Self {
        self.model.ref_sql = Some(sql.into());
        self
    }

    pub fn base_object(mut self, base: impl Into<String>) -> Self {
        self.model.base_object = Some(base.into());
        self
    }

    pub fn table_reference(mut self, table: impl Into<String>) -> Self {
        // Accepts "table", "schema.table" or "catalog.schema.table".
        let raw = table.into();
        let parts: Vec<&str> = raw.split('.').filter(|p| !p.is_empty()).collect();
        let reference = match parts.as_slice() {
            [table] => TableReference {
                catalog: None,
                schema: None,
                table: (*table).to_string(),
            },
            [schema, table] => TableReference {
                catalog: None,
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            },
            [catalog, schema, table] => TableReference {
                catalog: Some((*catalog).to_string()),
                schema: Some((*schema).to_string()),
                table: (*table).to_string(),
            },
            _ => TableReference {
                catalog: None,
                schema: None,
                table: raw,
            },
        };
        self.model.table_reference = Some(reference);
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.model.columns.push(Arc::new(column));
        self
    }

    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.model.primary_key = Some(key.into());
        self
    }

    pub fn build(self) -> Model {
        self.model
    }
}

pub struct ColumnBuilder {
    column: Column,
}

impl ColumnBuilder {
    pub fn new(name: impl Into<String>, r#type: impl Into<String>) -> Self {
        ColumnBuilder {
            column: Column {
                name: name.into(),
                r#type: r#type.into(),
                relationship: None,
                is_calculated: false,
                not_null: false,
                expression: None,
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.column.expression = Some(expression.into());
        self
    }

    pub fn calculated(mut self, expression: impl Into<String>) -> Self {
        self.column.is_calculated = true;
        self.column.expression = Some(expression.into());
        self
    }

    pub fn relationship(mut self, relationship: impl Into<String>) -> Self {
        self.column.relationship = Some(relationship.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.column.not_null = true;
        self
    }

    pub fn build(self) -> Column {
        self.column
    }
}

pub struct RelationshipBuilder {
    relationship: Relationship,
}

impl RelationshipBuilder {
    pub fn new(
        name: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
        join_type: JoinType,
        condition: impl Into<String>,
    ) -> Self {
        RelationshipBuilder {
            relationship: Relationship {
                name: name.into(),
                models: vec![left.into(), right.into()],
                join_type,
                condition: condition.into(),
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn build(self) -> Relationship {
        self.relationship
    }
}

pub struct MetricBuilder {
    metric: Metric,
}

impl MetricBuilder {
    pub fn new(name: impl Into<String>, base_object: impl Into<String>) -> Self {
        MetricBuilder {
            metric: Metric {
                name: name.into(),
                base_object: base_object.into(),
                dimension: Vec::new(),
                measure: Vec::new(),
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn dimension(mut self, column: Column) -> Self {
        self.metric.dimension.push(Arc::new(column));
        self
    }

    pub fn measure(mut self, column: Column) -> Self {
        self.metric.measure.push(Arc::new(column));
        self
    }

    pub fn build(self) -> Metric {
        self.metric
    }
}

pub struct CumulativeMetricBuilder {
    metric: CumulativeMetric,
}

impl CumulativeMetricBuilder {
    pub fn new(name: impl Into<String>, base_object: impl Into<String>) -> Self {
        CumulativeMetricBuilder {
            metric: CumulativeMetric {
                name: name.into(),
                base_object: base_object.into(),
                measure: Measure {
                    name: "value".into(),
                    r#type: "integer".into(),
                    operator: AggregateOperator::Sum,
                    ref_column: "value".into(),
                },
                window: Window {
                    name: "date".into(),
                    ref_column: "date".into(),
                    time_unit: TimeUnit::Day,
                    start: "1970-01-01".into(),
                    end: "1970-01-01".into(),
                },
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn measure(
        mut self,
        name: impl Into<String>,
        r#type: impl Into<String>,
        operator: AggregateOperator,
        ref_column: impl Into<String>,
    ) -> Self {
        self.metric.measure = Measure {
            name: name.into(),
            r#type: r#type.into(),
            operator,
            ref_column: ref_column.into(),
        };
        self
    }

    pub fn window(
        mut self,
        name: impl Into<String>,
        ref_column: impl Into<String>,
        time_unit: TimeUnit,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        self.metric.window = Window {
            name: name.into(),
            ref_column: ref_column.into(),
            time_unit,
            start: start.into(),
            end: end.into(),
        };
        self
    }

    pub fn build(self) -> CumulativeMetric {
        self.metric
    }
}

pub struct ViewBuilder {
    view: View,
}

impl ViewBuilder {
    pub fn new(name: impl Into<String>, statement: impl Into<String>) -> Self {
        ViewBuilder {
            view: View {
                name: name.into(),
                statement: statement.into(),
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn build(self) -> View {
        self.view
    }
}

pub struct EnumDefinitionBuilder {
    def: EnumDefinition,
}

impl EnumDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        EnumDefinitionBuilder {
            def: EnumDefinition {
                name: name.into(),
                values: Vec::new(),
            },
        }
    }

    pub fn value(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.def.values.push(EnumValue {
            name: name.into(),
            value: value.map(|v| v.to_string()),
        });
        self
    }

    pub fn build(self) -> EnumDefinition {
        self.def
    }
}
