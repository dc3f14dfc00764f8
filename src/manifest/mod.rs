//! Wire representation of the logical data model.
//!
//! The manifest is a JSON document declaring the business-level catalog:
//! models, metrics, cumulative metrics, views, relationships, enum
//! definitions and macros. Field names are lowerCamelCase on the wire and
//! unknown fields are rejected. Enumerations accept case-insensitive input
//! and serialize in their canonical form.
//!
//! Everything in this module is plain data. Semantic checks (unique names,
//! resolvable references, origin rules) live in [`crate::semantic`].

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use serde_with::NoneAsEmptyString;

pub mod builder;

/// Root of the logical catalog.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manifest {
    pub catalog: String,
    pub schema: String,
    #[serde(default)]
    pub models: Vec<Arc<Model>>,
    #[serde(default)]
    pub relationships: Vec<Arc<Relationship>>,
    #[serde(default)]
    pub metrics: Vec<Arc<Metric>>,
    #[serde(default)]
    pub cumulative_metrics: Vec<Arc<CumulativeMetric>>,
    #[serde(default)]
    pub views: Vec<Arc<View>>,
    #[serde(default)]
    pub enum_definitions: Vec<Arc<EnumDefinition>>,
    #[serde(default)]
    pub macros: Vec<Arc<Macro>>,
}

/// A logical relation with a source and a typed column list.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Model {
    pub name: String,
    #[serde(default)]
    pub ref_sql: Option<String>,
    #[serde(default)]
    pub base_object: Option<String>,
    #[serde(default)]
    pub table_reference: Option<TableReference>,
    pub columns: Vec<Arc<Column>>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared source of the model's base rows.
    pub fn origin(&self) -> Option<ModelOrigin<'_>> {
        match (&self.ref_sql, &self.base_object, &self.table_reference) {
            (Some(sql), None, None) => Some(ModelOrigin::RefSql(sql)),
            (None, Some(base), None) => Some(ModelOrigin::BaseObject(base)),
            (None, None, Some(table)) => Some(ModelOrigin::TableReference(table)),
            _ => None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Arc<Column>> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Exactly one origin must be declared per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOrigin<'a> {
    /// Raw SQL producing the base rows.
    RefSql(&'a str),
    /// Derives from another model or metric.
    BaseObject(&'a str),
    /// A physical table.
    TableReference(&'a TableReference),
}

/// A physical `(catalog, schema, table)` triple. Catalog and schema are
/// optional; `table` is not.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableReference {
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
}

impl Display for TableReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(catalog) = self.catalog.as_deref().filter(|c| !c.is_empty()) {
            write!(f, "{catalog}.")?;
        }
        if let Some(schema) = self.schema.as_deref().filter(|s| !s.is_empty()) {
            write!(f, "{schema}.")?;
        }
        f.write_str(&self.table)
    }
}

/// A column of a model or metric.
///
/// The three kinds are mutually exclusive:
/// - physical: optional `expression` mapping to a source column;
/// - relationship: `relationship` names the join edge, `type` the target
///   model;
/// - calculated: `is_calculated` with a required `expression`.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Column {
    pub name: String,
    pub r#type: String,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default, with = "bool_from_int")]
    pub is_calculated: bool,
    #[serde(default, with = "bool_from_int")]
    pub not_null: bool,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ColumnKind {
        if self.relationship.is_some() {
            ColumnKind::Relationship
        } else if self.is_calculated {
            ColumnKind::Calculated
        } else {
            ColumnKind::Physical
        }
    }

    /// Source expression of a physical column; defaults to the column name.
    pub fn source_expression(&self) -> &str {
        self.expression.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Physical,
    Relationship,
    Calculated,
}

mod bool_from_int {
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

    // Legacy manifests encode booleans as 0/1.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
        match value {
            serde_json::Value::Bool(b) => Ok(b),
            serde_json::Value::Number(n) if n.is_u64() => Ok(n.as_u64() != Some(0)),
            _ => Err(serde::de::Error::custom("invalid type for boolean")),
        }
    }

    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Serialize::serialize(value, serializer)
    }
}

/// A named join edge between two models.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Relationship {
    pub name: String,
    pub models: Vec<String>,
    pub join_type: JoinType,
    pub condition: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Relationship {
    /// The opposite endpoint, seen from `model`. `None` when `model` is not
    /// an endpoint.
    pub fn other_side(&self, model: &str) -> Option<&str> {
        match self.models.as_slice() {
            [left, right] if left == model => Some(right),
            [left, right] if right == model => Some(left),
            _ => None,
        }
    }

    /// Cardinality of the edge as traversed from `model` towards the other
    /// endpoint.
    pub fn join_type_from(&self, model: &str) -> Option<JoinType> {
        match self.models.as_slice() {
            [left, _] if left == model => Some(self.join_type),
            [_, right] if right == model => Some(self.join_type.reverse()),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinType {
    #[serde(alias = "one_to_one")]
    OneToOne,
    #[serde(alias = "one_to_many")]
    OneToMany,
    #[serde(alias = "many_to_one")]
    ManyToOne,
    #[serde(alias = "many_to_many")]
    ManyToMany,
}

impl JoinType {
    pub fn is_to_one(&self) -> bool {
        matches!(self, JoinType::OneToOne | JoinType::ManyToOne)
    }

    pub fn is_to_many(&self) -> bool {
        !self.is_to_one()
    }

    /// Swap the two sides of the edge.
    pub fn reverse(self) -> Self {
        match self {
            JoinType::OneToMany => JoinType::ManyToOne,
            JoinType::ManyToOne => JoinType::OneToMany,
            other => other,
        }
    }
}

impl Display for JoinType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinType::OneToOne => write!(f, "ONE_TO_ONE"),
            JoinType::OneToMany => write!(f, "ONE_TO_MANY"),
            JoinType::ManyToOne => write!(f, "MANY_TO_ONE"),
            JoinType::ManyToMany => write!(f, "MANY_TO_MANY"),
        }
    }
}

/// An aggregated logical relation over a base object.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Metric {
    pub name: String,
    pub base_object: String,
    #[serde(default)]
    pub dimension: Vec<Arc<Column>>,
    #[serde(default)]
    pub measure: Vec<Arc<Column>>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Metric {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self, name: &str) -> Option<&Arc<Column>> {
        self.dimension
            .iter()
            .chain(self.measure.iter())
            .find(|c| c.name == name)
    }
}

/// A metric densified over a date spine for a declared window.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CumulativeMetric {
    pub name: String,
    pub base_object: String,
    pub measure: Measure,
    pub window: Window,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CumulativeMetric {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The single aggregated output of a cumulative metric.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Measure {
    pub name: String,
    pub r#type: String,
    pub operator: AggregateOperator,
    pub ref_column: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOperator {
    #[serde(alias = "SUM")]
    Sum,
    #[serde(alias = "COUNT")]
    Count,
    #[serde(alias = "AVG")]
    Avg,
    #[serde(alias = "MIN")]
    Min,
    #[serde(alias = "MAX")]
    Max,
}

impl AggregateOperator {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateOperator::Sum => "sum",
            AggregateOperator::Count => "count",
            AggregateOperator::Avg => "avg",
            AggregateOperator::Min => "min",
            AggregateOperator::Max => "max",
        }
    }
}

/// Half-open time window `[start, end]` bucketed to `time_unit`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Window {
    pub name: String,
    pub ref_column: String,
    pub time_unit: TimeUnit,
    pub start: String,
    pub end: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    #[serde(alias = "day")]
    Day,
    #[serde(alias = "week")]
    Week,
    #[serde(alias = "month")]
    Month,
    #[serde(alias = "quarter")]
    Quarter,
    #[serde(alias = "year")]
    Year,
}

impl TimeUnit {
    /// Lowercase unit name as used by `date_trunc` and interval literals.
    pub fn sql_name(&self) -> &'static str {
        match self {
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Year => "year",
        }
    }
}

/// A named SQL fragment expanded inline at rewrite time.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct View {
    pub name: String,
    pub statement: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl View {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A string enum. Expressions may dereference `EnumName.FIELD`, which
/// resolves to the field's value (or its name when no value is declared).
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnumDefinition {
    pub name: String,
    pub values: Vec<EnumValue>,
}

impl EnumDefinition {
    pub fn value_of(&self, field: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.name == field)
            .map(|v| v.value.as_deref().unwrap_or(&v.name))
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnumValue {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// A parametric expression template. Stored and name-indexed here; text
/// expansion happens outside the planner.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Macro {
    pub name: String,
    pub definition: String,
    #[serde(default)]
    pub parameters: Vec<MacroParameter>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MacroParameter {
    pub name: String,
    pub r#type: MacroParameterType,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MacroParameterType {
    #[serde(alias = "expression")]
    Expression,
    #[serde(alias = "macro")]
    Macro,
}
