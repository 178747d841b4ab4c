//! Dependency resolution.
//!
//! Objects are partitioned into phases and each phase is ordered with a
//! stable topological sort. Ties are broken by `(schema, name, kind, oid)`
//! so the same catalog always produces the same TOC.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use tracing::{debug, warn};

use crate::catalog::{CatalogEntity, CatalogObject, ObjectKey, ObjectKind, Oid};
use crate::toc::{Phase, Toc, TocEntry};
use crate::{Error, Result};

/// One object scheduled in one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub phase: Phase,
    pub object: CatalogObject,
}

impl PlanStep {
    pub fn new(phase: Phase, object: CatalogObject) -> Self {
        Self { phase, object }
    }
}

/// Which phases to plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub metadata: bool,
    pub data: bool,
    pub statistics: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            metadata: true,
            data: true,
            statistics: true,
        }
    }
}

/// Ordered plan for a whole run
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub steps: Vec<PlanStep>,

    /// Constraints moved to the end of postdata to break a cycle
    pub deferred: Vec<Oid>,
}

impl Resolution {
    pub fn count(&self, phase: Phase) -> usize {
        self.steps.iter().filter(|s| s.phase == phase).count()
    }
}

type SortKey = (String, String, ObjectKind, Oid);

fn sort_key(obj: &CatalogObject) -> SortKey {
    (obj.schema.clone(), obj.name.clone(), obj.kind, obj.oid)
}

/// Order `objects` into phases.
///
/// `with_statistics` lists relations that get a statistics entry.
pub fn resolve(
    objects: &[CatalogObject],
    with_statistics: &BTreeSet<Oid>,
    options: ResolveOptions,
) -> Result<Resolution> {
    let mut resolution = Resolution::default();

    if options.metadata {
        let predata: Vec<&CatalogObject> = objects
            .iter()
            .filter(|o| o.kind.metadata_phase() == Phase::PreData)
            .collect();
        let (ordered, _) = sort_phase(Phase::PreData, &predata)?;
        push_steps(&mut resolution, Phase::PreData, ordered);
    }

    if options.data {
        let tables: Vec<&CatalogObject> = objects
            .iter()
            .filter(|o| o.kind == ObjectKind::Table)
            .collect();
        let (ordered, _) = sort_phase(Phase::Data, &tables)?;
        push_steps(&mut resolution, Phase::Data, ordered);
    }

    if options.metadata {
        let postdata: Vec<&CatalogObject> = objects
            .iter()
            .filter(|o| o.kind.metadata_phase() == Phase::PostData)
            .collect();
        let (ordered, deferred) = sort_phase(Phase::PostData, &postdata)?;
        resolution.deferred = deferred;
        push_steps(&mut resolution, Phase::PostData, ordered);
    }

    if options.statistics {
        let analyzed: Vec<&CatalogObject> = objects
            .iter()
            .filter(|o| o.kind.is_relation() && with_statistics.contains(&o.oid))
            .collect();
        let (ordered, _) = sort_phase(Phase::Statistics, &analyzed)?;
        push_steps(&mut resolution, Phase::Statistics, ordered);
    }

    debug!(
        "Resolved {} predata, {} data, {} postdata, {} statistics steps",
        resolution.count(Phase::PreData),
        resolution.count(Phase::Data),
        resolution.count(Phase::PostData),
        resolution.count(Phase::Statistics)
    );
    Ok(resolution)
}

fn push_steps(resolution: &mut Resolution, phase: Phase, ordered: Vec<&CatalogObject>) {
    resolution
        .steps
        .extend(ordered.into_iter().map(|o| PlanStep::new(phase, o.clone())));
}

/// Kahn's algorithm over the objects of one phase. Returns the order and
/// the OIDs deferred to break constraint cycles.
fn sort_phase<'a>(
    phase: Phase,
    objects: &[&'a CatalogObject],
) -> Result<(Vec<&'a CatalogObject>, Vec<Oid>)> {
    let index: HashMap<Oid, usize> = objects.iter().enumerate().map(|(i, o)| (o.oid, i)).collect();

    // Only edges inside the phase matter; anything else is either an
    // earlier phase or already present in the target.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); objects.len()];
    let mut in_degree: Vec<usize> = vec![0; objects.len()];
    if phase != Phase::Data && phase != Phase::Statistics {
        for (i, obj) in objects.iter().enumerate() {
            for dep in obj.dependencies() {
                if let Some(&j) = index.get(&dep) {
                    dependents[j].push(i);
                    in_degree[i] += 1;
                }
            }
        }
    }

    let mut heap: BinaryHeap<Reverse<(SortKey, usize)>> = BinaryHeap::new();
    for (i, obj) in objects.iter().enumerate() {
        if in_degree[i] == 0 {
            heap.push(Reverse((sort_key(obj), i)));
        }
    }

    let mut ordered = Vec::with_capacity(objects.len());
    let mut done = vec![false; objects.len()];
    let mut deferred: Vec<usize> = Vec::new();

    while ordered.len() + deferred.len() < objects.len() {
        if let Some(Reverse((_, i))) = heap.pop() {
            done[i] = true;
            ordered.push(objects[i]);
            for &d in &dependents[i] {
                if done[d] {
                    continue;
                }
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    heap.push(Reverse((sort_key(objects[d]), d)));
                }
            }
            continue;
        }

        // Nothing is ready: every remaining object waits on a cycle.
        let members = cycle_members(&done, &dependents);
        let breakable = members
            .iter()
            .copied()
            .filter(|&i| objects[i].kind == ObjectKind::Constraint)
            .max_by_key(|&i| sort_key(objects[i]));

        match breakable {
            Some(victim) if phase == Phase::PostData => {
                warn!(
                    "Breaking constraint cycle by deferring {} to the end of postdata",
                    objects[victim].object_ref()
                );
                done[victim] = true;
                deferred.push(victim);
                for &d in &dependents[victim] {
                    if done[d] {
                        continue;
                    }
                    in_degree[d] -= 1;
                    if in_degree[d] == 0 {
                        heap.push(Reverse((sort_key(objects[d]), d)));
                    }
                }
            }
            _ => {
                let mut names: Vec<String> = members
                    .iter()
                    .map(|&i| objects[i].object_ref().to_string())
                    .collect();
                names.sort();
                return Err(Error::DependencyCycle(names));
            }
        }
    }

    let deferred_oids = deferred.iter().map(|&i| objects[i].oid).collect();
    ordered.extend(deferred.iter().map(|&i| objects[i]));
    Ok((ordered, deferred_oids))
}

/// Remaining nodes that can reach themselves.
fn cycle_members(done: &[bool], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut members = Vec::new();
    for start in (0..done.len()).filter(|&i| !done[i]) {
        let mut stack: Vec<usize> = dependents[start].iter().copied().filter(|&d| !done[d]).collect();
        let mut seen: HashSet<usize> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == start {
                members.push(start);
                break;
            }
            if seen.insert(node) {
                stack.extend(dependents[node].iter().copied().filter(|&d| !done[d]));
            }
        }
    }
    members
}

/// Outcome of re-validating a filtered TOC against the target
#[derive(Debug, Clone, Default)]
pub struct SubsetValidation {
    /// Entries whose dependencies are satisfied, in ordinal order
    pub kept: Toc,

    /// Entries left out, with the reason
    pub skipped: Vec<(TocEntry, String)>,
}

/// Re-validate a filtered TOC.
///
/// A dependency of a selected entry is satisfied when the dependency is
/// itself kept, when another kept entry provides the same object (a data
/// entry not being selected does not make its table disappear), or when
/// the object already exists in the target. Entries that fail the check,
/// and everything depending on them, are reported as skipped.
pub fn validate_subset(selected: &Toc, toc: &Toc, existing: &HashSet<ObjectKey>) -> SubsetValidation {
    let selected_ordinals: HashSet<u32> = selected.iter().map(|e| e.ordinal).collect();
    let mut kept_ordinals: HashSet<u32> = HashSet::new();
    let mut kept_oids: HashSet<Oid> = HashSet::new();
    let mut result = SubsetValidation::default();

    for entry in selected.iter() {
        let mut reason = None;
        for &dep in &entry.depends_on {
            if kept_ordinals.contains(&dep) {
                continue;
            }
            let Some(dep_entry) = toc.get(dep) else {
                reason = Some(format!("depends on unknown entry {}", dep));
                break;
            };
            if selected_ordinals.contains(&dep) {
                reason = Some(format!(
                    "depends on skipped entry {} ({})",
                    dep,
                    dep_entry.label()
                ));
                break;
            }
            if kept_oids.contains(&dep_entry.oid) || existing.contains(&dep_entry.object_ref().key()) {
                continue;
            }
            reason = Some(format!(
                "depends on {} which is neither selected nor present in the target",
                dep_entry.object_ref()
            ));
            break;
        }

        match reason {
            Some(reason) => {
                debug!("Skipping entry {} ({}): {}", entry.ordinal, entry.label(), reason);
                result.skipped.push((entry.clone(), reason));
            }
            None => {
                kept_ordinals.insert(entry.ordinal);
                kept_oids.insert(entry.oid);
                result.kept.entries.push(entry.clone());
            }
        }
    }

    result
}
