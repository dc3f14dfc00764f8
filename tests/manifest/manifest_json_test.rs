//! Wire-format tests: the manifest JSON schema, enumeration handling,
//! and the error shape exposed to callers.

use mantle::cache::parse_manifest;
use mantle::manifest::{ColumnKind, JoinType, TimeUnit};
use mantle::{AnalyzedManifest, ManifestError, PlanError};

const MANIFEST: &str = r#"{
  "catalog": "test",
  "schema": "test",
  "models": [
    {
      "name": "Orders",
      "refSql": "SELECT * FROM tpch.orders",
      "columns": [
        {"name": "orderkey", "type": "integer", "notNull": true},
        {"name": "custkey", "type": "integer"},
        {"name": "totalprice", "type": "integer"},
        {"name": "orderdate", "type": "date", "expression": "o_orderdate"},
        {"name": "customer", "type": "Customer", "relationship": "OrdersCustomer"},
        {"name": "customer_name", "type": "varchar", "isCalculated": true,
         "expression": "customer.name"}
      ],
      "primaryKey": "orderkey"
    },
    {
      "name": "Customer",
      "tableReference": {"catalog": "tpch", "schema": "public", "table": "customer"},
      "columns": [
        {"name": "custkey", "type": "integer"},
        {"name": "name", "type": "varchar"}
      ],
      "primaryKey": "custkey"
    }
  ],
  "relationships": [
    {
      "name": "OrdersCustomer",
      "models": ["Orders", "Customer"],
      "joinType": "many_to_one",
      "condition": "Orders.custkey = Customer.custkey"
    }
  ],
  "metrics": [
    {
      "name": "Revenue",
      "baseObject": "Orders",
      "dimension": [{"name": "custkey", "type": "integer"}],
      "measure": [{"name": "total", "type": "integer", "isCalculated": true,
                   "expression": "sum(totalprice)"}]
    }
  ],
  "cumulativeMetrics": [
    {
      "name": "RunningRevenue",
      "baseObject": "Orders",
      "measure": {"name": "total", "type": "integer", "operator": "SUM",
                  "refColumn": "totalprice"},
      "window": {"name": "day", "refColumn": "orderdate", "timeUnit": "DAY",
                 "start": "2024-01-01", "end": "2024-03-31"}
    }
  ],
  "views": [
    {"name": "customer_orders", "statement": "SELECT orderkey FROM Orders"}
  ],
  "enumDefinitions": [
    {"name": "OrderStatus", "values": [{"name": "ACTIVE", "value": "A"}, {"name": "CLOSED"}]}
  ],
  "macros": [
    {"name": "discounted", "definition": "price * 0.9",
     "parameters": [{"name": "price", "type": "EXPRESSION"}]}
  ]
}"#;

#[test]
fn parses_the_full_wire_form() {
    let manifest = parse_manifest(MANIFEST).unwrap();
    assert_eq!(manifest.catalog, "test");
    assert_eq!(manifest.models.len(), 2);
    assert_eq!(manifest.relationships[0].join_type, JoinType::ManyToOne);
    assert_eq!(
        manifest.cumulative_metrics[0].window.time_unit,
        TimeUnit::Day
    );
    assert_eq!(manifest.enum_definitions[0].value_of("ACTIVE"), Some("A"));
    assert_eq!(manifest.enum_definitions[0].value_of("CLOSED"), Some("CLOSED"));
    assert_eq!(manifest.macros[0].parameters.len(), 1);

    let orders = &manifest.models[0];
    assert_eq!(orders.column("customer").unwrap().kind(), ColumnKind::Relationship);
    assert_eq!(
        orders.column("customer_name").unwrap().kind(),
        ColumnKind::Calculated
    );
    assert_eq!(
        manifest.models[1].table_reference.as_ref().unwrap().to_string(),
        "tpch.public.customer"
    );

    let analyzed = AnalyzedManifest::analyze(manifest).unwrap();
    assert_eq!(analyzed.catalog_schema_prefix(), "test.test.");
    assert!(analyzed.metric("Revenue").is_some());
    assert!(analyzed.cumulative_metric("RunningRevenue").is_some());
    assert!(analyzed.view("customer_orders").is_some());
    assert!(analyzed.enum_definition("OrderStatus").is_some());
    assert!(analyzed.macro_def("discounted").is_some());
}

#[test]
fn unknown_fields_are_rejected() {
    let json = r#"{"catalog": "c", "schema": "s", "modelz": []}"#;
    let err = parse_manifest(json).unwrap_err();
    assert_eq!(err.to_json()["code"], "MANIFEST_INVALID");
}

#[test]
fn enumerations_are_case_insensitive_on_input_canonical_on_output() {
    let manifest = parse_manifest(MANIFEST).unwrap();
    let out = serde_json::to_value(&manifest).unwrap();
    assert_eq!(out["relationships"][0]["joinType"], "MANY_TO_ONE");
    assert_eq!(out["cumulativeMetrics"][0]["window"]["timeUnit"], "DAY");
    assert_eq!(out["cumulativeMetrics"][0]["measure"]["operator"], "sum");
}

#[test]
fn duplicate_names_are_a_manifest_error() {
    let mut manifest = parse_manifest(MANIFEST).unwrap();
    let clone: mantle::manifest::Model =
        serde_json::from_value(serde_json::json!({
            "name": "Orders",
            "refSql": "SELECT 1 AS x",
            "columns": [{"name": "x", "type": "integer"}]
        }))
        .unwrap();
    manifest.models.push(std::sync::Arc::new(clone));
    let err = AnalyzedManifest::analyze(manifest).unwrap_err();
    assert!(matches!(err, ManifestError::DuplicateName { .. }));
    assert_eq!(err.to_json()["code"], "MANIFEST_INVALID");
}

#[test]
fn invalid_window_bounds_are_rejected() {
    let json = MANIFEST.replace("\"start\": \"2024-01-01\"", "\"start\": \"2024-12-31\"");
    let manifest = parse_manifest(&json).unwrap();
    let err = AnalyzedManifest::analyze(manifest).unwrap_err();
    assert!(matches!(err, ManifestError::InvalidWindow { .. }));
}

#[test]
fn unknown_references_carry_the_unknown_object_code() {
    let json = MANIFEST.replace("\"baseObject\": \"Orders\"", "\"baseObject\": \"Ordrs\"");
    let manifest = parse_manifest(&json).unwrap();
    let err = PlanError::from(AnalyzedManifest::analyze(manifest).unwrap_err());
    assert_eq!(err.to_json()["code"], "UNKNOWN_OBJECT");
}

#[test]
fn model_origin_must_be_exactly_one() {
    let json = MANIFEST.replace(
        "\"refSql\": \"SELECT * FROM tpch.orders\",",
        "\"refSql\": \"SELECT * FROM tpch.orders\", \"baseObject\": \"Customer\",",
    );
    let manifest = parse_manifest(&json).unwrap();
    assert!(matches!(
        AnalyzedManifest::analyze(manifest),
        Err(ManifestError::InvalidOrigin { .. })
    ));
}
