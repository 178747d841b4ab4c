//! TOC unit tests.
//!
//! Tests for the table of contents covering:
//! - Filter lookups and their idempotence
//! - Re-validation of filtered subsets
//! - Metadata ranges addressing `metadata.sql`

use std::collections::{BTreeSet, HashSet};

use segbackup_core::catalog::{ObjectKey, ObjectKind};
use segbackup_core::resolver::{resolve, validate_subset, ResolveOptions};
use segbackup_core::toc::metadata_statement;
use segbackup_core::{ObjectSelection, Phase, TocBuilder};

use super::helpers::generate_catalog;

fn builder() -> TocBuilder {
    let objects = generate_catalog(3, 4);
    let analyzed: BTreeSet<_> = objects
        .iter()
        .filter(|o| o.kind == ObjectKind::Table)
        .map(|o| o.oid)
        .collect();
    let resolution = resolve(&objects, &analyzed, ResolveOptions::default()).expect("resolve failed");
    TocBuilder::build(&resolution.steps)
}

#[test]
fn toc_lookup_is_idempotent() {
    let toc = builder().finish();
    let filters = [
        ObjectSelection {
            include_schemas: vec!["s0*".to_string()],
            exclude_relations: vec!["~.*t00[0-1]$".to_string()],
            ..Default::default()
        },
        ObjectSelection {
            include_relations: vec!["s01.t002".to_string()],
            ..Default::default()
        },
        ObjectSelection {
            exclude_schemas: vec!["s02".to_string()],
            ..Default::default()
        },
    ];

    for filter in &filters {
        let once = toc.lookup(filter);
        assert_eq!(once.lookup(filter), once);
        once.validate().expect("filtered TOC must keep ordering invariants");
    }
}

#[test]
fn toc_lookup_keeps_attached_objects_with_their_table() {
    let toc = builder().finish();
    let filter = ObjectSelection {
        include_relations: vec!["s00.t001".to_string()],
        ..Default::default()
    };
    let selected = toc.lookup(&filter);

    let labels: Vec<(Phase, ObjectKind, String)> = selected
        .iter()
        .map(|e| (e.phase, e.kind, e.name.clone()))
        .collect();
    assert!(labels.contains(&(Phase::PreData, ObjectKind::Schema, "s00".to_string())));
    assert!(labels.contains(&(Phase::PostData, ObjectKind::Index, "t001_idx".to_string())));
    assert!(labels.contains(&(Phase::PostData, ObjectKind::Constraint, "t001_fk".to_string())));
    assert!(!labels.iter().any(|(_, _, name)| name == "t000"));
}

#[test]
fn toc_subset_skips_entries_with_missing_dependencies() {
    let toc = builder().finish();
    let filter = ObjectSelection {
        include_relations: vec!["s00.t001".to_string()],
        ..Default::default()
    };
    let selected = toc.lookup(&filter);

    // t001_fk references t000, which is neither selected nor present.
    let validation = validate_subset(&selected, &toc, &HashSet::new());
    assert_eq!(validation.skipped.len(), 1);
    assert_eq!(validation.skipped[0].0.name, "t001_fk");
    assert_eq!(validation.kept.len(), selected.len() - 1);

    // Once t000 exists in the target the constraint can be applied.
    let existing = HashSet::from([ObjectKey {
        kind: ObjectKind::Table,
        schema: "s00".to_string(),
        name: "t000".to_string(),
    }]);
    let validation = validate_subset(&selected, &toc, &existing);
    assert!(validation.skipped.is_empty());
    assert_eq!(validation.kept, selected);
}

#[test]
fn toc_metadata_ranges_address_statements() {
    let builder = builder();
    let metadata = builder.metadata_artifact();
    let toc = builder.finish();

    for entry in toc.iter() {
        match entry.phase {
            Phase::PreData | Phase::PostData => {
                let stmt = metadata_statement(&metadata, entry).expect("statement out of range");
                assert!(stmt.ends_with(';'), "{}", stmt);
                assert!(stmt.contains(&entry.name), "{} does not name {}", stmt, entry.name);
            }
            Phase::Data | Phase::Statistics => {
                assert!(entry.metadata.is_none());
                assert!(metadata_statement(&metadata, entry).is_err());
            }
        }
    }
}
