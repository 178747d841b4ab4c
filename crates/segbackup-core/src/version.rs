//! Engine version parsing and the statistics feature set derived from it.
//!
//! The physical layout of planner statistics depends on the engine flavor and
//! major version. Rather than branching on version strings throughout the
//! codec, every version is reduced to a [`StatisticsFeatures`] value that is
//! threaded through capture and install.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::DatabaseError;
use crate::statistics::MAX_STATISTIC_SLOTS;

/// Database engine flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFlavor {
    Greenplum,
    Cloudberry,
}

/// Parsed engine version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineVersion {
    pub flavor: EngineFlavor,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(flavor: EngineFlavor, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            flavor,
            major,
            minor,
            patch,
        }
    }

    /// True if this version is at least `major.minor` of the same flavor.
    pub fn at_least(&self, flavor: EngineFlavor, major: u32, minor: u32) -> bool {
        self.flavor == flavor && (self.major, self.minor) >= (major, minor)
    }

    /// Statistics feature set exposed by this version.
    pub fn statistics_features(&self) -> StatisticsFeatures {
        let ndv_by_segments = self.at_least(EngineFlavor::Cloudberry, 2, 1);
        let per_slot_collation = match self.flavor {
            EngineFlavor::Greenplum => self.major >= 7,
            EngineFlavor::Cloudberry => true,
        };
        StatisticsFeatures {
            slot_count: if ndv_by_segments { 3 } else { 2 },
            per_slot_collation,
            ndv_by_segments,
        }
    }

    /// Extract a version from a `version()` banner such as
    /// `PostgreSQL 12.12 (Greenplum Database 7.1.0 build ...)`.
    pub fn from_banner(banner: &str) -> Result<Self, DatabaseError> {
        let (flavor, marker) = if let Some(idx) = banner.find("Cloudberry Database ") {
            (EngineFlavor::Cloudberry, idx + "Cloudberry Database ".len())
        } else if let Some(idx) = banner.find("Greenplum Database ") {
            (EngineFlavor::Greenplum, idx + "Greenplum Database ".len())
        } else {
            return Err(DatabaseError::Version(banner.to_string()));
        };

        let number: String = banner[marker..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let (major, minor, patch) = parse_numbers(&number)
            .ok_or_else(|| DatabaseError::Version(banner.to_string()))?;
        Ok(Self::new(flavor, major, minor, patch))
    }
}

impl PartialOrd for EngineVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.flavor != other.flavor {
            return None;
        }
        Some((self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch)))
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.flavor {
            EngineFlavor::Greenplum => "gpdb",
            EngineFlavor::Cloudberry => "cbdb",
        };
        write!(f, "{}-{}.{}.{}", prefix, self.major, self.minor, self.patch)
    }
}

impl FromStr for EngineVersion {
    type Err = DatabaseError;

    /// Accepts `gpdb-7.1.0`, `cbdb-2.1`, or a bare `6.25.3` (Greenplum).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (flavor, number) = match s.split_once('-') {
            Some(("gpdb", rest)) => (EngineFlavor::Greenplum, rest),
            Some(("cbdb", rest)) => (EngineFlavor::Cloudberry, rest),
            Some(_) => return Err(DatabaseError::Version(s.to_string())),
            None => (EngineFlavor::Greenplum, s),
        };
        let (major, minor, patch) =
            parse_numbers(number).ok_or_else(|| DatabaseError::Version(s.to_string()))?;
        Ok(Self::new(flavor, major, minor, patch))
    }
}

fn parse_numbers(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(str::parse::<u32>).transpose().ok()?.unwrap_or(0);
    let patch = parts.next().map(str::parse::<u32>).transpose().ok()?.unwrap_or(0);
    Some((major, minor, patch))
}

/// Statistics layout supported by one engine version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsFeatures {
    /// Number of statistic slots per column (at most `MAX_STATISTIC_SLOTS`)
    pub slot_count: usize,

    /// Whether each slot carries its own collation
    pub per_slot_collation: bool,

    /// Whether the segment-level distinct-value aggregate kind exists
    pub ndv_by_segments: bool,
}

impl StatisticsFeatures {
    /// Replace the slot count, clamped to what the record format can hold.
    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.slot_count = slot_count.min(MAX_STATISTIC_SLOTS);
        self
    }
}

impl Default for StatisticsFeatures {
    fn default() -> Self {
        EngineVersion::new(EngineFlavor::Greenplum, 7, 0, 0).statistics_features()
    }
}
