//! Planner statistics records.
//!
//! Per-column statistics carry up to [`MAX_STATISTIC_SLOTS`] typed slots.
//! How many of them an engine stores, and which kinds it understands, is
//! described by [`StatisticsFeatures`]; the [`codec`] adapts records
//! between engines without ever moving a slot to a different index.
//!
//! Value and number lists are captured verbatim. Their order is whatever
//! the source catalog returned and is not guaranteed to be sorted.

pub mod codec;

pub use codec::{
    capture_attribute, capture_tuple, install_attribute, render_attribute_sql,
    render_tuple_sql, DropReason, DroppedSlot, InstallPlan,
};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::{qualify, Oid};
use crate::version::{EngineVersion, StatisticsFeatures};

/// Upper bound on statistic slots per column across all supported engines.
pub const MAX_STATISTIC_SLOTS: usize = 3;

/// Current `statistics.json` format version
pub const STATISTICS_FORMAT_VERSION: u32 = 1;

/// Statistic slot kind tag (`stakindN`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatisticKind(pub i16);

impl StatisticKind {
    pub const NONE: Self = Self(0);
    pub const MCV: Self = Self(1);
    pub const HISTOGRAM: Self = Self(2);
    pub const CORRELATION: Self = Self(3);
    pub const MCELEM: Self = Self(4);
    pub const DECHIST: Self = Self(5);
    pub const RANGE_LENGTH_HISTOGRAM: Self = Self(6);
    pub const BOUNDS_HISTOGRAM: Self = Self(7);
    /// Sum of per-segment distinct counts, used for two-stage aggregation
    pub const NDV_BY_SEGMENTS: Self = Self(8);

    /// Whether an engine with `features` can store this kind.
    pub fn is_supported_by(&self, features: &StatisticsFeatures) -> bool {
        match *self {
            Self::NDV_BY_SEGMENTS => features.ndv_by_segments,
            Self(kind) => (1..=7).contains(&kind),
        }
    }

    /// Whether `values` holds elements of the column's own type.
    pub fn values_use_column_type(&self) -> bool {
        *self != Self::NDV_BY_SEGMENTS
    }
}

impl fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NONE => "none",
            Self::MCV => "mcv",
            Self::HISTOGRAM => "histogram",
            Self::CORRELATION => "correlation",
            Self::MCELEM => "mcelem",
            Self::DECHIST => "dechist",
            Self::RANGE_LENGTH_HISTOGRAM => "range_length_histogram",
            Self::BOUNDS_HISTOGRAM => "bounds_histogram",
            Self::NDV_BY_SEGMENTS => "ndv_by_segments",
            Self(other) => return write!(f, "kind {}", other),
        };
        f.write_str(name)
    }
}

/// One typed statistic slot of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticSlot {
    pub kind: StatisticKind,

    /// Operator the statistic was computed with
    #[serde(default)]
    pub operator: Option<Oid>,

    /// Collation, when the engine stores one per slot
    #[serde(default)]
    pub collation: Option<Oid>,

    /// Most-common values or histogram bounds, as text
    #[serde(default)]
    pub values: Option<Vec<String>>,

    /// Frequencies or correlation, as text
    #[serde(default)]
    pub numbers: Option<Vec<String>>,
}

impl StatisticSlot {
    pub fn new(kind: StatisticKind) -> Self {
        Self {
            kind,
            operator: None,
            collation: None,
            values: None,
            numbers: None,
        }
    }
}

/// Per-column planner statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeStatistic {
    /// Relation OID in the source database
    pub relation: Oid,
    pub schema: String,
    pub table: String,
    pub attname: String,
    pub type_name: String,
    pub attnum: i16,
    pub inherit: bool,
    pub null_fraction: f32,
    pub width: i32,

    /// Signed distinct estimate, see [`DistinctEstimate`]
    pub distinct: f32,

    pub slots: [Option<StatisticSlot>; MAX_STATISTIC_SLOTS],
}

impl AttributeStatistic {
    /// Number of slots holding a statistic.
    pub fn populated_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn slot(&self, index: usize) -> Option<&StatisticSlot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Values of the first slot, if any.
    pub fn values1(&self) -> Option<&[String]> {
        self.slot(0).and_then(|s| s.values.as_deref())
    }

    pub fn distinct_estimate(&self) -> DistinctEstimate {
        DistinctEstimate::from_raw(self.distinct)
    }

    pub fn qualified_table(&self) -> String {
        qualify(&self.schema, &self.table)
    }
}

/// Per-relation tuple statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleStatistic {
    pub relation: Oid,
    pub schema: String,
    pub table: String,

    /// Estimated live tuples
    pub rel_tuples: f64,

    /// Pages on disk (hardware dependent)
    pub rel_pages: i32,
}

impl TupleStatistic {
    pub fn qualified_table(&self) -> String {
        qualify(&self.schema, &self.table)
    }
}

/// Distinct-count encoding.
///
/// Positive values are absolute counts, negative values are the negated
/// ratio of distinct values to rows, zero means unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistinctEstimate {
    Unknown,
    Absolute(f64),
    Fraction(f64),
}

impl DistinctEstimate {
    pub fn from_raw(raw: f32) -> Self {
        if raw > 0.0 {
            Self::Absolute(raw as f64)
        } else if raw < 0.0 {
            Self::Fraction(-(raw as f64))
        } else {
            Self::Unknown
        }
    }

    pub fn to_raw(self) -> f32 {
        match self {
            Self::Unknown => 0.0,
            Self::Absolute(n) => n as f32,
            Self::Fraction(f) => -(f as f32),
        }
    }

    /// Encode an exact count the way ANALYZE does: all-unique columns and
    /// columns whose distinct count exceeds a tenth of the rows scale with
    /// the table and are stored as a fraction, everything else as an
    /// absolute count.
    pub fn from_counts(distinct: u64, rows: u64) -> Self {
        if rows == 0 || distinct == 0 {
            Self::Unknown
        } else if distinct >= rows {
            Self::Fraction(1.0)
        } else if distinct as f64 > 0.1 * rows as f64 {
            Self::Fraction(distinct as f64 / rows as f64)
        } else {
            Self::Absolute(distinct as f64)
        }
    }

    /// Expected distinct values for a relation of `rows` rows.
    pub fn resolve(self, rows: f64) -> Option<f64> {
        match self {
            Self::Unknown => None,
            Self::Absolute(n) => Some(n),
            Self::Fraction(f) => Some(f * rows),
        }
    }
}

/// Contents of `statistics.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsFile {
    pub format_version: u32,

    /// Engine the statistics were captured from
    pub source_version: EngineVersion,

    /// Layout the records were captured with
    pub features: StatisticsFeatures,

    #[serde(default)]
    pub tuples: Vec<TupleStatistic>,

    #[serde(default)]
    pub attributes: Vec<AttributeStatistic>,
}

impl StatisticsFile {
    pub fn new(source_version: EngineVersion, features: StatisticsFeatures) -> Self {
        Self {
            format_version: STATISTICS_FORMAT_VERSION,
            source_version,
            features,
            tuples: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Attribute records of one relation, in attnum order.
    pub fn attributes_for(&self, relation: Oid) -> Vec<&AttributeStatistic> {
        let mut attrs: Vec<&AttributeStatistic> = self
            .attributes
            .iter()
            .filter(|a| a.relation == relation)
            .collect();
        attrs.sort_by_key(|a| a.attnum);
        attrs
    }

    pub fn tuple_for(&self, relation: Oid) -> Option<&TupleStatistic> {
        self.tuples.iter().find(|t| t.relation == relation)
    }

    /// Relations that have any statistics recorded.
    pub fn relations(&self) -> Vec<Oid> {
        let mut oids: Vec<Oid> = self
            .tuples
            .iter()
            .map(|t| t.relation)
            .chain(self.attributes.iter().map(|a| a.relation))
            .collect();
        oids.sort_unstable();
        oids.dedup();
        oids
    }

    /// Human-readable SQL rendering of every record.
    pub fn render_sql(&self) -> String {
        let mut out = String::new();
        for oid in self.relations() {
            if let Some(tuple) = self.tuple_for(oid) {
                out.push_str(&render_tuple_sql(tuple));
                out.push('\n');
            }
            for attr in self.attributes_for(oid) {
                out.push_str(&render_attribute_sql(attr, &self.features));
                out.push('\n');
            }
        }
        out
    }
}
