//! Statistics codec unit tests.
//!
//! Tests for capturing and installing planner statistics across engine
//! versions covering:
//! - Slot truncation when the target stores fewer slots
//! - Sign preservation of the distinct estimate
//! - Value lists carried verbatim

use segbackup_core::catalog::AttributeStatisticRow;
use segbackup_core::statistics::{
    capture_attribute, install_attribute, DistinctEstimate, DropReason, StatisticKind,
};
use segbackup_core::{EngineVersion, Error, StatisticsFeatures};

fn features(version: &str) -> StatisticsFeatures {
    version
        .parse::<EngineVersion>()
        .expect("bad version")
        .statistics_features()
}

fn three_slot_row(distinct: f32) -> AttributeStatisticRow {
    AttributeStatisticRow {
        relation: 16400,
        schema: "public".to_string(),
        table: "events".to_string(),
        attname: "flag".to_string(),
        type_name: "bool".to_string(),
        attnum: 2,
        inherit: false,
        null_fraction: 0.0,
        width: 1,
        distinct,
        kinds: vec![1, 3, 8],
        operators: vec![91, 58, 58],
        collations: vec![0, 0, 0],
        values: vec![
            Some(vec!["t".to_string(), "f".to_string()]),
            None,
            Some(vec!["6".to_string()]),
        ],
        numbers: vec![
            Some(vec!["0.6".to_string(), "0.4".to_string()]),
            Some(vec!["0.52".to_string()]),
            None,
        ],
    }
}

#[test]
fn statistics_three_slots_truncate_to_two() {
    let captured = capture_attribute(&three_slot_row(2.0), &features("cbdb-2.1"));
    assert_eq!(captured.populated_slots(), 3);

    let plan = install_attribute(&captured, &features("gpdb-6.25.3"));
    assert_eq!(plan.record.populated_slots(), 2);
    assert_eq!(plan.record.slot(0).map(|s| s.kind), Some(StatisticKind::MCV));
    assert_eq!(plan.record.slot(1).map(|s| s.kind), Some(StatisticKind::CORRELATION));
    assert!(plan.record.slot(2).is_none());

    assert_eq!(plan.dropped.len(), 1);
    assert_eq!(plan.dropped[0].slot, 2);
    assert_eq!(plan.dropped[0].reason, DropReason::SlotUnavailable);

    let warnings = plan.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(matches!(
        &warnings[0],
        Error::UnsupportedStatisticKind { slot: 3, kind: 8, .. }
    ));
}

#[test]
fn statistics_distinct_sign_survives_install() {
    for raw in [-1.0_f32, -0.25, 0.0, 2.0, 1500.0] {
        let captured = capture_attribute(&three_slot_row(raw), &features("cbdb-2.1"));
        let plan = install_attribute(&captured, &features("gpdb-6.25.3"));
        assert_eq!(plan.record.distinct, raw);
        assert_eq!(plan.record.distinct_estimate(), DistinctEstimate::from_raw(raw));
    }
}

#[test]
fn statistics_distinct_estimate_resolves_against_rows() {
    assert_eq!(DistinctEstimate::from_raw(-0.5).resolve(1000.0), Some(500.0));
    assert_eq!(DistinctEstimate::from_raw(42.0).resolve(1000.0), Some(42.0));
    assert_eq!(DistinctEstimate::from_raw(0.0).resolve(1000.0), None);
}

#[test]
fn statistics_values_are_carried_verbatim() {
    let captured = capture_attribute(&three_slot_row(2.0), &features("cbdb-2.1"));
    let plan = install_attribute(&captured, &features("gpdb-7.1.0"));

    // Unsorted order from the source catalog is kept as is.
    assert_eq!(
        plan.record.values1(),
        Some(["t".to_string(), "f".to_string()].as_slice())
    );
}

#[test]
fn statistics_same_layout_installs_everything() {
    let source = features("cbdb-2.1");
    let captured = capture_attribute(&three_slot_row(2.0), &source);
    let plan = install_attribute(&captured, &source);

    assert!(plan.dropped.is_empty());
    assert!(plan.warnings().is_empty());
    assert_eq!(plan.record, captured);
}

#[test]
fn statistics_ndv_kind_unknown_to_older_engines() {
    let gp7 = features("gpdb-7.1.0");
    assert!(!StatisticKind::NDV_BY_SEGMENTS.is_supported_by(&gp7));
    assert!(StatisticKind::NDV_BY_SEGMENTS.is_supported_by(&features("cbdb-2.1")));
    assert!(StatisticKind::HISTOGRAM.is_supported_by(&gp7));
}
