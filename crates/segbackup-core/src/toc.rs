//! Table of contents.
//!
//! The TOC is the ordered list of everything a backup contains. Each entry
//! has an immutable ordinal; dependencies are expressed as ordinals of
//! earlier entries, and entries are grouped into phases that are replayed
//! strictly in order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::catalog::{CatalogEntity, ModificationState, ObjectKind, ObjectRef, Oid};
use crate::config::ObjectSelection;
use crate::resolver::PlanStep;
use crate::{Error, Result};

/// Replay phase of a TOC entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Schemas, types, functions, sequences, tables and views
    PreData,
    /// Table rows
    Data,
    /// Indexes, constraints, triggers and rules
    PostData,
    /// Planner statistics
    Statistics,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::PreData, Phase::Data, Phase::PostData, Phase::Statistics];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PreData => "predata",
            Phase::Data => "data",
            Phase::PostData => "postdata",
            Phase::Statistics => "statistics",
        };
        f.write_str(name)
    }
}

/// Byte range into the metadata artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Location of one relation's data chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    /// Storage key of the artifact holding the chunk
    pub artifact: String,

    /// Offset of the compressed chunk within the artifact
    pub offset: u64,

    /// Compressed length
    pub length: u64,

    /// Rows in the chunk
    pub rows: u64,

    /// Change tracking of the relation when the chunk was written; only
    /// chunks that carry it can be reused by an incremental backup
    #[serde(default)]
    pub modification: Option<ModificationState>,
}

/// One entry of the table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub ordinal: u32,
    pub phase: Phase,
    pub oid: Oid,
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,

    #[serde(default)]
    pub owner: Option<String>,

    /// Owning relation of indexes, constraints, triggers and rules
    #[serde(default)]
    pub parent: Option<ObjectRef>,

    /// Ordinals that must be applied first, ascending
    #[serde(default)]
    pub depends_on: Vec<u32>,

    /// DDL statement location in `metadata.sql`
    #[serde(default)]
    pub metadata: Option<ByteRange>,

    /// Data chunk location
    #[serde(default)]
    pub data: Option<DataRange>,
}

impl TocEntry {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            oid: self.oid,
            kind: self.kind,
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    /// Short description for logs and reports, e.g. `data TABLE public.foo`
    pub fn label(&self) -> String {
        format!("{} {}", self.phase, self.object_ref())
    }

    /// Whether the entry survives `filter`.
    pub fn matches(&self, filter: &ObjectSelection) -> bool {
        match (self.kind, &self.parent) {
            (ObjectKind::Schema, _) => filter.matches_schema(&self.name),
            (ObjectKind::Type | ObjectKind::Function, _) => filter.matches_schema(&self.schema),
            (kind, _) if kind.is_relation() => filter.matches_relation(&self.schema, &self.name),
            (_, Some(parent)) => filter.matches_relation(&parent.schema, &parent.name),
            (_, None) => filter.matches_schema(&self.schema),
        }
    }
}

/// Ordered table of contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    pub entries: Vec<TocEntry>,
}

impl Toc {
    pub fn new(entries: Vec<TocEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TocEntry> {
        self.entries.iter()
    }

    /// Entry with the given ordinal.
    pub fn get(&self, ordinal: u32) -> Option<&TocEntry> {
        self.entries
            .binary_search_by_key(&ordinal, |e| e.ordinal)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = &TocEntry> {
        self.entries.iter().filter(move |e| e.phase == phase)
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.phase(phase).count()
    }

    /// Sub-sequence of entries selected by `filter`. Ordinals and
    /// dependency lists are preserved, so applying the same filter again
    /// returns the same TOC.
    pub fn lookup(&self, filter: &ObjectSelection) -> Toc {
        Toc::new(
            self.entries
                .iter()
                .filter(|e| e.matches(filter))
                .cloned()
                .collect(),
        )
    }

    /// Sub-sequence restricted to `phases`.
    pub fn retain_phases(&self, phases: &[Phase]) -> Toc {
        Toc::new(
            self.entries
                .iter()
                .filter(|e| phases.contains(&e.phase))
                .cloned()
                .collect(),
        )
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn deserialize(json: &str) -> Result<Toc> {
        let toc: Toc = serde_json::from_str(json)?;
        toc.validate()?;
        Ok(toc)
    }

    /// Check ordering invariants: ordinals strictly increase, every
    /// dependency points at a smaller ordinal, phases never go backwards.
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<&TocEntry> = None;
        for entry in &self.entries {
            if let Some(prev) = previous {
                if entry.ordinal <= prev.ordinal {
                    return Err(Error::Manifest(format!(
                        "TOC ordinal {} follows {}",
                        entry.ordinal, prev.ordinal
                    )));
                }
                if entry.phase < prev.phase {
                    return Err(Error::Manifest(format!(
                        "TOC entry {} ({}) is in phase {} after phase {}",
                        entry.ordinal,
                        entry.object_ref(),
                        entry.phase,
                        prev.phase
                    )));
                }
            }
            if let Some(dep) = entry.depends_on.iter().find(|d| **d >= entry.ordinal) {
                return Err(Error::Manifest(format!(
                    "TOC entry {} depends on later entry {}",
                    entry.ordinal, dep
                )));
            }
            previous = Some(entry);
        }
        Ok(())
    }
}

/// Incrementally builds a TOC and its metadata artifact during a backup.
///
/// Ordinals and metadata ranges are fixed by [`TocBuilder::build`]; data
/// ranges are filled in by the data phase through
/// [`TocBuilder::record_data_offset`]. Callers share the builder behind a
/// mutex so there is a single writer.
#[derive(Debug, Default)]
pub struct TocBuilder {
    entries: Vec<TocEntry>,
    metadata: String,
    pre_existing: BTreeSet<Oid>,
}

impl TocBuilder {
    /// Assign ordinals to resolved plan steps, in order.
    ///
    /// A dependency on an object resolves to the most recent earlier entry
    /// for it, so a postdata index depends on its table's data entry and a
    /// data entry depends on the table's predata entry. Dependencies on
    /// objects with no earlier entry are treated as pre-existing.
    pub fn build(steps: &[PlanStep]) -> Self {
        let mut builder = TocBuilder::default();
        let mut latest: HashMap<Oid, u32> = HashMap::new();

        for (index, step) in steps.iter().enumerate() {
            let ordinal = index as u32;
            let object = &step.object;

            let deps = match step.phase {
                Phase::PreData | Phase::PostData => object.dependencies(),
                Phase::Data | Phase::Statistics => Vec::new(),
            };
            let mut depends_on: Vec<u32> = Vec::with_capacity(deps.len() + 1);
            for oid in &deps {
                match latest.get(oid) {
                    Some(ordinal) => depends_on.push(*ordinal),
                    None => {
                        debug!(
                            "Dependency {} of {} {} has no earlier entry, assuming it exists in the target",
                            oid,
                            step.phase,
                            object.object_ref()
                        );
                        builder.pre_existing.insert(*oid);
                    }
                }
            }
            if let Some(ordinal) = latest.get(&object.oid) {
                depends_on.push(*ordinal);
            }
            depends_on.sort_unstable();
            depends_on.dedup();

            let metadata = match step.phase {
                Phase::PreData | Phase::PostData => {
                    let stmt = object.create_statement();
                    let offset = builder.metadata.len() as u64;
                    builder.metadata.push_str(&stmt);
                    builder.metadata.push('\n');
                    Some(ByteRange {
                        offset,
                        length: stmt.len() as u64,
                    })
                }
                Phase::Data | Phase::Statistics => None,
            };

            builder.entries.push(TocEntry {
                ordinal,
                phase: step.phase,
                oid: object.oid,
                kind: object.kind,
                schema: object.schema.clone(),
                name: object.name.clone(),
                owner: object.owner.clone(),
                parent: object.parent.clone(),
                depends_on,
                metadata,
                data: None,
            });
            latest.insert(object.oid, ordinal);
        }

        builder
    }

    /// Dependencies that resolved to no entry and must already exist in
    /// the target, such as built-in schemas.
    pub fn pre_existing(&self) -> &BTreeSet<Oid> {
        &self.pre_existing
    }

    /// Snapshot of the data-phase entries.
    pub fn data_entries(&self) -> Vec<TocEntry> {
        self.entries
            .iter()
            .filter(|e| e.phase == Phase::Data)
            .cloned()
            .collect()
    }

    /// Attach the location of a relation's data chunk.
    pub fn record_data_offset(&mut self, ordinal: u32, range: DataRange) -> Result<()> {
        let entry = self
            .entries
            .get_mut(ordinal as usize)
            .filter(|e| e.phase == Phase::Data)
            .ok_or_else(|| Error::Manifest(format!("No data entry with ordinal {}", ordinal)))?;
        entry.data = Some(range);
        Ok(())
    }

    /// Contents of `metadata.sql`.
    pub fn metadata_artifact(&self) -> Bytes {
        Bytes::from(self.metadata.clone())
    }

    pub fn finish(self) -> Toc {
        Toc::new(self.entries)
    }
}

/// Read the DDL statement of `entry` out of the metadata artifact.
pub fn metadata_statement(metadata: &[u8], entry: &TocEntry) -> Result<String> {
    let range = entry
        .metadata
        .ok_or_else(|| Error::Manifest(format!("Entry {} has no metadata", entry.ordinal)))?;
    let bytes = metadata
        .get(range.offset as usize..range.end() as usize)
        .ok_or_else(|| {
            Error::Manifest(format!(
                "Metadata range {}..{} of entry {} is out of bounds",
                range.offset,
                range.end(),
                entry.ordinal
            ))
        })?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Manifest(format!("Entry {} metadata is not UTF-8: {}", entry.ordinal, e)))
}
