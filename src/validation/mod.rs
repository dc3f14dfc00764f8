//! Rule-based validation over an analyzed manifest.
//!
//! Unlike analysis, validation never fails fast: each rule invocation
//! returns a list of results with PASS/FAIL/ERROR status, suitable for
//! surfacing to modeling tools.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::semantic::lineage::ColumnKey;
use crate::semantic::AnalyzedManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub name: String,
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationResult {
    fn pass(name: impl Into<String>) -> Self {
        ValidationResult {
            name: name.into(),
            status: ValidationStatus::Pass,
            message: None,
        }
    }

    fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationResult {
            name: name.into(),
            status: ValidationStatus::Fail,
            message: Some(message.into()),
        }
    }

    fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationResult {
            name: name.into(),
            status: ValidationStatus::Error,
            message: Some(message.into()),
        }
    }
}

/// Run one built-in rule. Unknown rules and missing parameters produce a
/// single ERROR result rather than an `Err`.
pub fn validate(
    rule: &str,
    params: &BTreeMap<String, String>,
    analyzed: &AnalyzedManifest,
) -> Vec<ValidationResult> {
    match rule {
        "column_is_valid" => {
            let (Some(model), Some(column)) = (params.get("model"), params.get("column"))
            else {
                return vec![ValidationResult::error(
                    rule,
                    "parameters 'model' and 'column' are required",
                )];
            };
            vec![column_is_valid(analyzed, model, column)]
        }
        "model_is_valid" => {
            let Some(model) = params.get("model") else {
                return vec![ValidationResult::error(rule, "parameter 'model' is required")];
            };
            model_is_valid(analyzed, model)
        }
        "relationship_is_valid" => {
            let Some(name) = params.get("relationship") else {
                return vec![ValidationResult::error(
                    rule,
                    "parameter 'relationship' is required",
                )];
            };
            vec![relationship_is_valid(analyzed, name)]
        }
        other => vec![ValidationResult::error(
            other,
            format!("unknown validation rule '{other}'"),
        )],
    }
}

/// The column exists and, when calculated, its lineage resolves without
/// cycles or dangling references.
fn column_is_valid(analyzed: &AnalyzedManifest, model: &str, column: &str) -> ValidationResult {
    let name = format!("column_is_valid:{model}.{column}");
    let Some(dataset) = analyzed.object(model) else {
        return ValidationResult::fail(name, format!("unknown object '{model}'"));
    };
    if !dataset.has_column(column) {
        return ValidationResult::fail(name, format!("'{model}' has no column '{column}'"));
    }
    let key = ColumnKey::new(model, column);
    match analyzed.lineage().required_fields(&[key]) {
        Ok(_) => ValidationResult::pass(name),
        Err(err) => ValidationResult::fail(name, err.to_string()),
    }
}

fn model_is_valid(analyzed: &AnalyzedManifest, model: &str) -> Vec<ValidationResult> {
    let Some(found) = analyzed.model(model) else {
        return vec![ValidationResult::fail(
            format!("model_is_valid:{model}"),
            format!("unknown model '{model}'"),
        )];
    };
    found
        .columns
        .iter()
        .filter(|c| c.relationship.is_none())
        .map(|c| column_is_valid(analyzed, model, &c.name))
        .collect()
}

/// The relationship exists and its condition yielded usable join keys.
fn relationship_is_valid(analyzed: &AnalyzedManifest, name: &str) -> ValidationResult {
    let result_name = format!("relationship_is_valid:{name}");
    if analyzed.relationship(name).is_none() {
        return ValidationResult::fail(result_name, format!("unknown relationship '{name}'"));
    }
    match analyzed.join_keys(name) {
        Some(pairs) if !pairs.is_empty() => ValidationResult::pass(result_name),
        _ => ValidationResult::fail(
            result_name,
            "relationship condition has no equality join keys".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::builder::{
        ColumnBuilder, ManifestBuilder, ModelBuilder, RelationshipBuilder,
    };
    use crate::manifest::JoinType;

    fn analyzed() -> AnalyzedManifest {
        let manifest = ManifestBuilder::new()
            .catalog("test")
            .schema("test")
            .model(
                ModelBuilder::new("Orders")
                    .ref_sql("SELECT * FROM tpch.orders")
                    .column(ColumnBuilder::new("custkey", "integer").build())
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
                    .build(),
            )
            .model(
                ModelBuilder::new("Customer")
                    .ref_sql("SELECT * FROM tpch.customer")
                    .column(ColumnBuilder::new("custkey", "integer").build())
                    .column(ColumnBuilder::new("name", "varchar").build())
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

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn column_is_valid_passes_and_fails() {
        let analyzed = analyzed();
        let results = validate(
            "column_is_valid",
            &params(&[("model", "Orders"), ("column", "customer_name")]),
            &analyzed,
        );
        assert_eq!(results[0].status, ValidationStatus::Pass);

        let results = validate(
            "column_is_valid",
            &params(&[("model", "Orders"), ("column", "nope")]),
            &analyzed,
        );
        assert_eq!(results[0].status, ValidationStatus::Fail);
    }

    #[test]
    fn model_is_valid_reports_per_column() {
        let analyzed = analyzed();
        let results = validate("model_is_valid", &params(&[("model", "Orders")]), &analyzed);
        // Relationship columns are skipped.
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == ValidationStatus::Pass));
    }

    #[test]
    fn unknown_rule_is_an_error() {
        let analyzed = analyzed();
        let results = validate("no_such_rule", &BTreeMap::new(), &analyzed);
        assert_eq!(results[0].status, ValidationStatus::Error);
    }

    #[test]
    fn relationship_rule() {
        let analyzed = analyzed();
        let results = validate(
            "relationship_is_valid",
            &params(&[("relationship", "OrdersCustomer")]),
            &analyzed,
        );
        assert_eq!(results[0].status, ValidationStatus::Pass);
    }
}
