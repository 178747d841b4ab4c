//! Dependency resolver unit tests.
//!
//! Tests for phase ordering over generated catalogs covering:
//! - Topological validity of every dependency edge
//! - Deterministic output regardless of catalog order
//! - Foreign keys landing after both tables' data
//! - Constraint cycles

use std::collections::{BTreeSet, HashMap};

use segbackup_core::catalog::{CatalogEntity, ObjectKind};
use segbackup_core::resolver::{resolve, ResolveOptions};
use segbackup_core::{Error, Phase, Toc, TocBuilder};

use super::helpers::{foreign_key, generate_catalog, schema, table};

fn build_toc(objects: &[segbackup_core::CatalogObject]) -> Toc {
    let analyzed: BTreeSet<_> = objects
        .iter()
        .filter(|o| o.kind == ObjectKind::Table)
        .map(|o| o.oid)
        .collect();
    let resolution = resolve(objects, &analyzed, ResolveOptions::default()).expect("resolve failed");
    TocBuilder::build(&resolution.steps).finish()
}

#[test]
fn resolver_every_dependency_precedes_its_dependent() {
    let objects = generate_catalog(3, 12);
    let toc = build_toc(&objects);
    toc.validate().expect("TOC invariants violated");

    // Map each object to the ordinal of its first (creating) entry.
    let mut created: HashMap<u32, u32> = HashMap::new();
    for entry in toc.iter() {
        created.entry(entry.oid).or_insert(entry.ordinal);
    }

    for object in &objects {
        let own = created[&object.oid];
        for dep in object.dependencies() {
            let dep_ordinal = created[&dep];
            assert!(
                dep_ordinal < own,
                "{} (entry {}) depends on oid {} created at entry {}",
                object.object_ref(),
                own,
                dep,
                dep_ordinal
            );
        }
    }
}

#[test]
fn resolver_phases_never_interleave() {
    let toc = build_toc(&generate_catalog(2, 5));
    let phases: Vec<Phase> = toc.iter().map(|e| e.phase).collect();
    let mut sorted = phases.clone();
    sorted.sort();
    assert_eq!(phases, sorted);

    assert_eq!(toc.count(Phase::PreData), 2 + 2 * 5 + 2);
    assert_eq!(toc.count(Phase::Data), 10);
    assert_eq!(toc.count(Phase::PostData), 10 + 8);
    assert_eq!(toc.count(Phase::Statistics), 10);
}

#[test]
fn resolver_output_ignores_catalog_order() {
    let objects = generate_catalog(2, 8);
    let mut reversed = objects.clone();
    reversed.reverse();

    assert_eq!(build_toc(&objects), build_toc(&reversed));
}

#[test]
fn resolver_foreign_key_waits_for_both_tables_data() {
    let public = schema(1, "public");
    let a = table(10, 1, "public", "a");
    let b = table(11, 1, "public", "b");
    let fk = foreign_key(20, &b, &a, "b_a_fk");
    let toc = build_toc(&[fk, b, a, public]);

    let data_ordinal = |name: &str| {
        toc.phase(Phase::Data)
            .find(|e| e.name == name)
            .map(|e| e.ordinal)
            .expect("missing data entry")
    };
    let fk_entry = toc
        .iter()
        .find(|e| e.kind == ObjectKind::Constraint)
        .expect("missing constraint entry");

    assert_eq!(fk_entry.phase, Phase::PostData);
    assert!(fk_entry.ordinal > data_ordinal("a"));
    assert!(fk_entry.ordinal > data_ordinal("b"));
    assert!(fk_entry.depends_on.contains(&data_ordinal("a")));
    assert!(fk_entry.depends_on.contains(&data_ordinal("b")));
}

#[test]
fn resolver_mutual_foreign_keys_defer_one_constraint() {
    let public = schema(1, "public");
    let a = table(10, 1, "public", "a");
    let b = table(11, 1, "public", "b");
    // Each constraint also depends on the other, forming a cycle.
    let a_fk = foreign_key(20, &a, &b, "a_b_fk").with_dependency(21);
    let b_fk = foreign_key(21, &b, &a, "b_a_fk").with_dependency(20);

    let resolution = resolve(
        &[public, a, b, a_fk, b_fk],
        &BTreeSet::new(),
        ResolveOptions::default(),
    )
    .expect("cycle between constraints should be broken");

    assert_eq!(resolution.deferred.len(), 1);
    let last = resolution.steps.last().expect("empty plan");
    assert_eq!(last.phase, Phase::PostData);
    assert_eq!(last.object.oid, resolution.deferred[0]);
}

#[test]
fn resolver_table_cycle_is_fatal() {
    let public = schema(1, "public");
    let a = table(10, 1, "public", "a").with_dependency(11);
    let b = table(11, 1, "public", "b").with_dependency(10);

    let err = resolve(&[public, a, b], &BTreeSet::new(), ResolveOptions::default()).unwrap_err();
    match err {
        Error::DependencyCycle(members) => {
            assert_eq!(members.len(), 2);
        }
        other => panic!("Expected DependencyCycle, got {:?}", other),
    }
}

#[test]
fn resolver_metadata_only_plans_no_data() {
    let objects = generate_catalog(1, 3);
    let resolution = resolve(
        &objects,
        &BTreeSet::new(),
        ResolveOptions {
            metadata: true,
            data: false,
            statistics: false,
        },
    )
    .expect("resolve failed");

    assert_eq!(resolution.count(Phase::Data), 0);
    assert_eq!(resolution.count(Phase::Statistics), 0);
    assert_eq!(resolution.count(Phase::PreData), 1 + 3 + 1);
}
