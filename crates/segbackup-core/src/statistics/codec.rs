//! Capture and reinstall of planner statistics across engine versions.

use std::fmt::Write as _;

use super::{
    AttributeStatistic, StatisticKind, StatisticSlot, TupleStatistic, MAX_STATISTIC_SLOTS,
};
use crate::catalog::{AttributeStatisticRow, TupleStatisticRow};
use crate::version::StatisticsFeatures;
use crate::Error;

/// Build a record from a raw catalog row.
///
/// Slots beyond `source.slot_count` are ignored, and collations are dropped
/// when the source does not store them per slot.
pub fn capture_attribute(row: &AttributeStatisticRow, source: &StatisticsFeatures) -> AttributeStatistic {
    let mut slots: [Option<StatisticSlot>; MAX_STATISTIC_SLOTS] = Default::default();
    let limit = source.slot_count.min(MAX_STATISTIC_SLOTS);

    for (index, slot) in slots.iter_mut().enumerate().take(limit) {
        let kind = StatisticKind(row.kinds.get(index).copied().unwrap_or(0));
        if kind == StatisticKind::NONE {
            continue;
        }
        let nonzero = |oid: Option<&u32>| oid.copied().filter(|o| *o != 0);
        *slot = Some(StatisticSlot {
            kind,
            operator: nonzero(row.operators.get(index)),
            collation: if source.per_slot_collation {
                nonzero(row.collations.get(index))
            } else {
                None
            },
            values: row.values.get(index).cloned().flatten(),
            numbers: row.numbers.get(index).cloned().flatten(),
        });
    }

    AttributeStatistic {
        relation: row.relation,
        schema: row.schema.clone(),
        table: row.table.clone(),
        attname: row.attname.clone(),
        type_name: row.type_name.clone(),
        attnum: row.attnum,
        inherit: row.inherit,
        null_fraction: row.null_fraction,
        width: row.width,
        distinct: row.distinct,
        slots,
    }
}

pub fn capture_tuple(row: &TupleStatisticRow) -> TupleStatistic {
    TupleStatistic {
        relation: row.relation,
        schema: row.schema.clone(),
        table: row.table.clone(),
        rel_tuples: row.rel_tuples,
        rel_pages: row.rel_pages,
    }
}

/// Why a slot was left out of an install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The target stores fewer slots than the source
    SlotUnavailable,
    /// The target does not know this kind
    UnsupportedKind,
}

/// A slot that could not be installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedSlot {
    /// Zero-based slot index
    pub slot: usize,
    pub kind: StatisticKind,
    pub reason: DropReason,
}

/// Record adapted to a target engine, plus what had to be left out
#[derive(Debug, Clone, PartialEq)]
pub struct InstallPlan {
    pub record: AttributeStatistic,
    pub dropped: Vec<DroppedSlot>,
}

impl InstallPlan {
    /// One non-fatal `UnsupportedStatisticKind` per dropped slot.
    pub fn warnings(&self) -> Vec<Error> {
        self.dropped
            .iter()
            .map(|d| Error::UnsupportedStatisticKind {
                relation: self.record.qualified_table(),
                column: self.record.attname.clone(),
                slot: d.slot + 1,
                kind: d.kind.0,
            })
            .collect()
    }
}

/// Adapt a captured record to the target's statistics layout.
///
/// Slots keep their index; a slot the target cannot hold is emptied, never
/// moved into a free lower index. The distinct estimate is passed through
/// unchanged.
pub fn install_attribute(stat: &AttributeStatistic, target: &StatisticsFeatures) -> InstallPlan {
    let mut record = stat.clone();
    let mut dropped = Vec::new();
    let limit = target.slot_count.min(MAX_STATISTIC_SLOTS);

    for (index, slot) in record.slots.iter_mut().enumerate() {
        let Some(kind) = slot.as_ref().map(|s| s.kind) else {
            continue;
        };

        let reason = if index >= limit {
            Some(DropReason::SlotUnavailable)
        } else if !kind.is_supported_by(target) {
            Some(DropReason::UnsupportedKind)
        } else {
            None
        };

        if let Some(reason) = reason {
            dropped.push(DroppedSlot {
                slot: index,
                kind,
                reason,
            });
            *slot = None;
        } else if !target.per_slot_collation {
            if let Some(current) = slot.as_mut() {
                current.collation = None;
            }
        }
    }

    InstallPlan { record, dropped }
}

fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Array literal body (`{"a","b"}`) with every element quoted.
fn array_literal(items: &[String]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        for c in item.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
    }
    out.push('}');
    out
}

fn regclass(qualified: &str) -> String {
    format!("{}::regclass::oid", sql_literal(qualified))
}

/// `UPDATE pg_class` statement restoring tuple statistics.
pub fn render_tuple_sql(stat: &TupleStatistic) -> String {
    format!(
        "UPDATE pg_class SET relpages = {}::int, reltuples = {}::real WHERE oid = {};",
        stat.rel_pages,
        stat.rel_tuples,
        regclass(&stat.qualified_table())
    )
}

/// Slot columns every `pg_statistic` row has, whatever the engine fills
pub const CATALOG_STATISTIC_SLOTS: usize = 5;

/// `DELETE` + `INSERT INTO pg_statistic` statements restoring one column.
///
/// The attribute number is looked up by name on the target so the
/// statement stays valid when column numbering differs.
pub fn render_attribute_sql(stat: &AttributeStatistic, features: &StatisticsFeatures) -> String {
    let rel = regclass(&stat.qualified_table());
    let attnum = format!(
        "(SELECT attnum FROM pg_attribute WHERE attrelid = {} AND attname = {})",
        rel,
        sql_literal(&stat.attname)
    );
    // Slots past the engine's layout are written empty so every catalog
    // column gets a value
    let slots = features.slot_count.min(MAX_STATISTIC_SLOTS);
    let slot = |i: usize| {
        if i < slots {
            stat.slots.get(i).and_then(Option::as_ref)
        } else {
            None
        }
    };

    let mut columns = vec![
        "starelid".to_string(),
        "staattnum".to_string(),
        "stainherit".to_string(),
        "stanullfrac".to_string(),
        "stawidth".to_string(),
        "stadistinct".to_string(),
    ];
    let mut values = vec![
        rel.clone(),
        attnum.clone(),
        format!("{}::boolean", stat.inherit),
        format!("{}::real", stat.null_fraction),
        format!("{}::integer", stat.width),
        format!("{}::real", stat.distinct),
    ];

    for i in 0..CATALOG_STATISTIC_SLOTS {
        columns.push(format!("stakind{}", i + 1));
        values.push(format!("{}::smallint", slot(i).map_or(0, |s| s.kind.0)));
    }
    for i in 0..CATALOG_STATISTIC_SLOTS {
        columns.push(format!("staop{}", i + 1));
        values.push(format!("{}::oid", slot(i).and_then(|s| s.operator).unwrap_or(0)));
    }
    if features.per_slot_collation {
        for i in 0..CATALOG_STATISTIC_SLOTS {
            columns.push(format!("stacoll{}", i + 1));
            values.push(format!("{}::oid", slot(i).and_then(|s| s.collation).unwrap_or(0)));
        }
    }
    for i in 0..CATALOG_STATISTIC_SLOTS {
        columns.push(format!("stanumbers{}", i + 1));
        values.push(match slot(i).and_then(|s| s.numbers.as_ref()) {
            Some(numbers) => format!("{}::real[]", sql_literal(&array_literal(numbers))),
            None => "NULL".to_string(),
        });
    }
    for i in 0..CATALOG_STATISTIC_SLOTS {
        columns.push(format!("stavalues{}", i + 1));
        values.push(match slot(i) {
            Some(s) => match &s.values {
                Some(items) => {
                    let elem_type = if s.kind.values_use_column_type() {
                        stat.type_name.as_str()
                    } else {
                        "float8"
                    };
                    format!(
                        "array_in({}, {}::regtype::oid, -1)",
                        sql_literal(&array_literal(items)),
                        sql_literal(elem_type)
                    )
                }
                None => "NULL".to_string(),
            },
            None => "NULL".to_string(),
        });
    }

    let mut sql = String::new();
    let _ = writeln!(
        sql,
        "DELETE FROM pg_statistic WHERE starelid = {} AND staattnum = {};",
        rel, attnum
    );
    let _ = write!(
        sql,
        "INSERT INTO pg_statistic ({}) VALUES ({});",
        columns.join(", "),
        values.join(", ")
    );
    sql
}
