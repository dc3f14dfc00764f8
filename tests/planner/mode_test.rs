//! Dynamic-fields mode against full materialization.
//!
//! The two modes are independent behaviors: dynamic narrows every CTE to
//! the columns a statement needs, full materialization projects every
//! declared column of every referenced object.

use mantle::prelude::*;

/// One-directional calculated fields only, so both modes plan cleanly.
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
                .column(ColumnBuilder::new("nation", "varchar").build())
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

#[test]
fn dynamic_mode_projects_only_required_columns() {
    let out = dry_plan(
        "SELECT orderkey FROM Orders",
        &SessionContext::default(),
        &catalog(),
        true,
    )
    .unwrap();
    assert!(out.contains("orderkey AS orderkey"));
    assert!(!out.contains("totalprice"));
    assert!(!out.contains("customer_name"));
    assert!(!out.contains("\"Customer\" AS ("));
}

#[test]
fn full_materialization_projects_every_column() {
    let session = SessionContext::default().with_full_materialization();
    let out = dry_plan("SELECT orderkey FROM Orders", &session, &catalog(), true).unwrap();
    for column in ["orderkey", "custkey", "totalprice", "customer_name"] {
        assert!(out.contains(column), "missing {column}: {out}");
    }
    // The calculated column pulls the whole Customer model along.
    assert!(out.contains("\"Customer\" AS ("));
    assert!(out.contains("nation AS nation"));
}

#[test]
fn both_modes_keep_the_statement_body_identical() {
    let analyzed = catalog();
    let narrow = dry_plan(
        "SELECT customer_name FROM Orders",
        &SessionContext::default(),
        &analyzed,
        true,
    )
    .unwrap();
    let session = SessionContext::default().with_full_materialization();
    let full = dry_plan("SELECT customer_name FROM Orders", &session, &analyzed, true).unwrap();
    assert!(narrow.ends_with("SELECT customer_name FROM \"Orders\""));
    assert!(full.ends_with("SELECT customer_name FROM \"Orders\""));
    assert!(narrow.len() < full.len(), "narrow CTEs must be narrower");
}

#[test]
fn the_flag_is_read_per_request() {
    let analyzed = catalog();
    let narrow = dry_plan(
        "SELECT orderkey FROM Orders",
        &SessionContext::default(),
        &analyzed,
        true,
    )
    .unwrap();
    let full = dry_plan(
        "SELECT orderkey FROM Orders",
        &SessionContext::default().with_full_materialization(),
        &analyzed,
        true,
    )
    .unwrap();
    let narrow_again = dry_plan(
        "SELECT orderkey FROM Orders",
        &SessionContext::default(),
        &analyzed,
        true,
    )
    .unwrap();
    assert_ne!(narrow, full);
    assert_eq!(narrow, narrow_again);
}
