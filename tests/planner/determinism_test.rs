//! Determinism: identical inputs plan to byte-identical SQL, across
//! repeated runs and across threads sharing one analyzed manifest.

use std::collections::BTreeMap;
use std::sync::Arc;

use mantle::prelude::*;
use mantle::validation::{validate, ValidationStatus};

fn catalog() -> AnalyzedManifest {
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

const STATEMENTS: &[&str] = &[
    "SELECT orderkey FROM Orders LIMIT 200",
    "SELECT customer_name, orderkey FROM Orders WHERE custkey > 10",
    "SELECT name FROM Customer ORDER BY name",
    "SELECT count(*) FROM Orders",
];

#[test]
fn repeated_plans_are_byte_identical() {
    let analyzed = catalog();
    let session = SessionContext::default();
    for sql in STATEMENTS {
        let first = plan(sql, &session, &analyzed).unwrap();
        for _ in 0..5 {
            assert_eq!(plan(sql, &session, &analyzed).unwrap(), first);
        }
    }
}

#[test]
fn concurrent_plans_share_the_manifest_and_agree() {
    let analyzed = Arc::new(catalog());
    let session = SessionContext::default();
    let expected: Vec<String> = STATEMENTS
        .iter()
        .map(|sql| plan(sql, &session, &analyzed).unwrap())
        .collect();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let analyzed = Arc::clone(&analyzed);
            let session = session.clone();
            std::thread::spawn(move || {
                STATEMENTS
                    .iter()
                    .map(|sql| plan(sql, &session, &analyzed).unwrap())
                    .collect::<Vec<String>>()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn the_plan_cache_is_shared_across_threads() {
    let cache = Arc::new(PlanCache::new());
    let json = serde_json::to_string(catalog().manifest()).unwrap();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let json = json.clone();
            std::thread::spawn(move || cache.analyzed_from_json(&json).unwrap())
        })
        .collect();
    let analyzed: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // After the first fill, everyone sees one shared analysis.
    let last = analyzed.last().unwrap();
    assert!(analyzed
        .iter()
        .filter(|a| Arc::ptr_eq(a, last))
        .count() >= 1);
    let again = cache.analyzed_from_json(&json).unwrap();
    assert!(Arc::ptr_eq(&again, last) || analyzed.iter().any(|a| Arc::ptr_eq(&again, a)));
}

#[test]
fn validation_is_deterministic_too() {
    let analyzed = catalog();
    let params: BTreeMap<String, String> = [("model", "Orders")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let first = validate("model_is_valid", &params, &analyzed);
    let second = validate("model_is_valid", &params, &analyzed);
    assert_eq!(first.len(), second.len());
    assert!(first.iter().all(|r| r.status == ValidationStatus::Pass));
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.name, b.name);
    }
}
