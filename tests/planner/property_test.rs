//! Property tests for the quantified planner invariants.

use std::collections::BTreeSet;

use proptest::prelude::*;

use mantle::dialect::{apply, Dialect};
use mantle::prelude::*;
use mantle::semantic::lineage::ColumnKey;

/// A model with five physical columns and one calculated column reading
/// an arbitrary subset of them.
fn catalog_reading(subset: &BTreeSet<usize>) -> AnalyzedManifest {
    let expression = subset
        .iter()
        .map(|i| format!("c{i}"))
        .collect::<Vec<_>>()
        .join(" + ");
    let mut model = ModelBuilder::new("Facts").ref_sql("SELECT * FROM raw.facts");
    for i in 0..5 {
        model = model.column(ColumnBuilder::new(format!("c{i}"), "integer").build());
    }
    let manifest = ManifestBuilder::new()
        .catalog("test")
        .schema("test")
        .model(
            model
                .column(
                    ColumnBuilder::new("mix", "integer")
                        .calculated(expression)
                        .build(),
                )
                .build(),
        )
        .build();
    AnalyzedManifest::analyze(manifest).unwrap()
}

proptest! {
    /// `required_fields` returns exactly the base columns the expression
    /// transitively reads, plus the calculated column itself.
    #[test]
    fn required_fields_match_expression_reads(
        subset in proptest::collection::btree_set(0usize..5, 1..5)
    ) {
        let analyzed = catalog_reading(&subset);
        let fields = analyzed
            .lineage()
            .required_fields(&[ColumnKey::new("Facts", "mix")])
            .unwrap();
        let mut expected: BTreeSet<String> =
            subset.iter().map(|i| format!("c{i}")).collect();
        expected.insert("mix".to_string());
        prop_assert_eq!(fields.len(), 1);
        prop_assert_eq!(&fields["Facts"], &expected);
    }

    /// Applying a dialect twice equals applying it once.
    #[test]
    fn dialect_adapter_is_idempotent(
        // The leading letter keeps generated names out of the keyword set.
        table in "x[a-z0-9_]{0,8}",
        column in "x[a-z0-9_]{0,8}",
        mixed in "X[a-zA-Z0-9]{0,8}",
        rewrite in proptest::bool::ANY,
    ) {
        let function = if rewrite { "generate_array" } else { "some_fn" };
        let sql = format!("SELECT {function}({column}, 10), {mixed} FROM {table}");
        for dialect in [Dialect::Generic, Dialect::DuckDb] {
            let once = apply(dialect, &sql).unwrap();
            let twice = apply(dialect, &once).unwrap();
            prop_assert_eq!(&once, &twice);
        }
    }

    /// Statements referencing no manifest object only change by
    /// canonical formatting.
    #[test]
    fn no_op_statements_are_preserved(
        table in "x[a-z0-9_]{0,8}",
        column in "x[a-z0-9_]{0,8}",
        limit in 1u32..1000,
    ) {
        let analyzed = catalog_reading(&BTreeSet::from([0]));
        let sql = format!("SELECT {column} FROM remote.{table} LIMIT {limit}");
        let planned = plan_with_dialect(
            &sql,
            &SessionContext::default(),
            &analyzed,
            Dialect::Generic,
        ).unwrap();
        // Already canonical: the planner must not touch it.
        prop_assert_eq!(&planned, &sql);
    }

    /// Byte-identical plans for identical inputs, whatever the
    /// projection.
    #[test]
    fn plans_are_deterministic(
        subset in proptest::collection::btree_set(0usize..5, 1..5)
    ) {
        let analyzed = catalog_reading(&BTreeSet::from([0, 1]));
        let projection = subset
            .iter()
            .map(|i| format!("c{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {projection} FROM Facts");
        let session = SessionContext::default();
        let first = plan(&sql, &session, &analyzed).unwrap();
        let second = plan(&sql, &session, &analyzed).unwrap();
        prop_assert_eq!(first, second);
    }
}

/// Multi-hop dereferences require the join keys of every traversed
/// relationship, at any depth.
#[test]
fn chain_lineage_requires_every_hop() {
    for depth in 1..4usize {
        let mut builder = ManifestBuilder::new().catalog("test").schema("test");
        for i in 0..=depth {
            let mut model = ModelBuilder::new(format!("M{i}"))
                .ref_sql(format!("SELECT * FROM raw.m{i}"))
                .column(ColumnBuilder::new("id", "integer").build())
                .column(ColumnBuilder::new("payload", "integer").build())
                .primary_key("id");
            if i < depth {
                model = model.column(
                    ColumnBuilder::new("next", format!("M{}", i + 1))
                        .relationship(format!("R{i}"))
                        .build(),
                );
            }
            if i == 0 {
                let chain = std::iter::repeat("next")
                    .take(depth)
                    .collect::<Vec<_>>()
                    .join(".");
                model = model.column(
                    ColumnBuilder::new("deep", "integer")
                        .calculated(format!("{chain}.payload"))
                        .build(),
                );
            }
            builder = builder.model(model.build());
        }
        for i in 0..depth {
            builder = builder.relationship(
                RelationshipBuilder::new(
                    format!("R{i}"),
                    format!("M{i}"),
                    format!("M{}", i + 1),
                    JoinType::ManyToOne,
                    format!("M{i}.id = M{}.id", i + 1),
                )
                .build(),
            );
        }
        let analyzed = AnalyzedManifest::analyze(builder.build()).unwrap();
        let fields = analyzed
            .lineage()
            .required_fields(&[ColumnKey::new("M0", "deep")])
            .unwrap();
        // Every hop contributes its join key; the terminal contributes
        // its payload; the objects come dependency-first.
        let objects: Vec<&String> = fields.keys().collect();
        assert_eq!(objects.last().unwrap().as_str(), "M0");
        for i in 0..=depth {
            let name = format!("M{i}");
            assert!(fields[&name].contains("id"), "missing join key on {name}");
        }
        assert!(fields[&format!("M{depth}")].contains("payload"));

        // And the whole chain plans.
        let out = dry_plan(
            "SELECT deep FROM M0",
            &SessionContext::default(),
            &analyzed,
            true,
        )
        .unwrap();
        assert!(out.contains("LEFT JOIN"), "unexpected plan: {out}");
    }
}
