//! Parallel execution of TOC entries.
//!
//! Phases run strictly in order; every worker of a phase is joined before
//! the next phase starts. Inside a phase an entry is dispatched as soon as
//! all of its in-phase dependencies have completed, up to the phase's
//! concurrency limit. Entries whose dependencies failed or were skipped
//! are skipped themselves, so one failure only takes down its dependents.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::database::{Database, Session};
use crate::manifest::{EntryOutcome, EntryReport, RunReport};
use crate::toc::{Phase, TocEntry};
use crate::{Error, Result};

/// What applying one entry produced
#[derive(Debug, Clone, Default)]
pub struct EntryOutput {
    /// Rows moved, for data entries
    pub rows: u64,

    /// Non-fatal problems worth reporting
    pub warnings: Vec<String>,
}

impl EntryOutput {
    pub fn rows(rows: u64) -> Self {
        Self {
            rows,
            warnings: Vec::new(),
        }
    }
}

/// Applies one entry on a worker session
#[async_trait]
pub trait EntryHandler: Send + Sync {
    async fn apply(&self, entry: &TocEntry, session: &mut dyn Session) -> Result<EntryOutput>;

    /// Called after an entry succeeded, before its dependents are released.
    async fn completed(&self, _entry: &TocEntry) -> Result<()> {
        Ok(())
    }
}

/// Worker limits per phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseConcurrency {
    /// Predata workers
    pub metadata_jobs: usize,
    /// Data, postdata and statistics workers
    pub jobs: usize,
}

impl PhaseConcurrency {
    pub fn for_phase(&self, phase: Phase) -> usize {
        match phase {
            Phase::PreData => self.metadata_jobs,
            _ => self.jobs,
        }
        .max(1)
    }

    /// Sessions needed to run every phase at full width
    pub fn max(&self) -> usize {
        self.metadata_jobs.max(self.jobs).max(1)
    }
}

impl Default for PhaseConcurrency {
    fn default() -> Self {
        Self {
            metadata_jobs: 1,
            jobs: 4,
        }
    }
}

/// Fixed set of worker sessions
pub struct SessionPool {
    idle: Vec<Box<dyn Session>>,
}

impl SessionPool {
    pub fn new(sessions: Vec<Box<dyn Session>>) -> Self {
        Self { idle: sessions }
    }

    /// Open `size` sessions against `database`.
    pub async fn connect(database: &dyn Database, size: usize) -> Result<Self> {
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size.max(1) {
            idle.push(database.connect().await?);
        }
        Ok(Self { idle })
    }

    pub fn size(&self) -> usize {
        self.idle.len()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Session>> {
        self.idle.iter_mut()
    }

    pub fn into_sessions(self) -> Vec<Box<dyn Session>> {
        self.idle
    }
}

type Completion = (u32, Box<dyn Session>, Result<EntryOutput>, Duration);

/// Dispatches TOC entries over a session pool
pub struct ParallelExecutor {
    pool: SessionPool,
    concurrency: PhaseConcurrency,
    strict: bool,
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl ParallelExecutor {
    pub fn new(pool: SessionPool, concurrency: PhaseConcurrency) -> Self {
        Self {
            pool,
            concurrency,
            strict: false,
            shutdown_rx: None,
        }
    }

    /// Abort on the first data-phase failure instead of continuing.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Stop dispatching when a shutdown signal arrives.
    pub fn with_shutdown(mut self, shutdown_rx: broadcast::Receiver<()>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn into_pool(self) -> SessionPool {
        self.pool
    }

    fn shutdown_requested(&mut self) -> bool {
        match &mut self.shutdown_rx {
            Some(rx) => matches!(
                rx.try_recv(),
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_))
            ),
            None => false,
        }
    }

    /// Run `entries` (in ordinal order) phase by phase.
    ///
    /// Ordinals in `already_applied` are not run again and count as
    /// satisfied for their dependents. Returns the per-entry report; in
    /// strict mode a data-phase failure aborts with
    /// [`Error::EntryExecution`] once in-flight entries have drained.
    pub async fn run(
        &mut self,
        backup_id: &str,
        entries: &[TocEntry],
        already_applied: &HashSet<u32>,
        handler: Arc<dyn EntryHandler>,
    ) -> Result<RunReport> {
        let mut report = RunReport::new(backup_id);
        let mut outcomes: HashMap<u32, EntryOutcome> = HashMap::new();
        let mut cancelled = false;

        for phase in Phase::ALL {
            let phase_entries: Vec<&TocEntry> = entries.iter().filter(|e| e.phase == phase).collect();
            if phase_entries.is_empty() {
                continue;
            }

            if cancelled {
                for entry in phase_entries {
                    let outcome = EntryOutcome::Skipped {
                        reason: "run cancelled".to_string(),
                    };
                    outcomes.insert(entry.ordinal, outcome.clone());
                    report.entries.push(EntryReport::new(entry, outcome));
                }
                continue;
            }

            let started = Instant::now();
            let result = self
                .run_phase(phase, &phase_entries, already_applied, &handler, &mut outcomes, &mut report)
                .await;
            match result {
                Ok(phase_cancelled) => cancelled = phase_cancelled,
                Err(e) => {
                    report.finish();
                    return Err(e);
                }
            }
            info!(
                "Phase {} finished: {} entries in {:?}",
                phase,
                phase_entries.len(),
                started.elapsed()
            );
        }

        report.cancelled = cancelled;
        report.finish();
        Ok(report)
    }

    /// Returns whether a shutdown signal stopped dispatch.
    async fn run_phase(
        &mut self,
        phase: Phase,
        entries: &[&TocEntry],
        already_applied: &HashSet<u32>,
        handler: &Arc<dyn EntryHandler>,
        outcomes: &mut HashMap<u32, EntryOutcome>,
        report: &mut RunReport,
    ) -> Result<bool> {
        let limit = self.concurrency.for_phase(phase).min(self.pool.size());
        if limit == 0 {
            return Err(Error::Config("Executor needs at least one session".to_string()));
        }
        let semaphore = Arc::new(Semaphore::new(limit));
        debug!("Phase {}: {} entries, {} workers", phase, entries.len(), limit);

        let by_ordinal: HashMap<u32, &TocEntry> = entries.iter().map(|e| (e.ordinal, *e)).collect();
        let mut pending: Vec<&TocEntry> = entries.to_vec();
        let mut running: JoinSet<Completion> = JoinSet::new();
        let mut stop_reason: Option<String> = None;
        let mut abort: Option<Error> = None;
        let mut cancelled = false;

        loop {
            if stop_reason.is_none() && self.shutdown_requested() {
                warn!("Shutdown signal received, draining {} in-flight entries", running.len());
                stop_reason = Some("run cancelled".to_string());
                cancelled = true;
            }

            // Resolve and dispatch in ordinal order.
            let mut still_pending = Vec::with_capacity(pending.len());
            for entry in pending {
                if let Some(reason) = &stop_reason {
                    let outcome = EntryOutcome::Skipped { reason: reason.clone() };
                    outcomes.insert(entry.ordinal, outcome.clone());
                    report.entries.push(EntryReport::new(entry, outcome));
                    continue;
                }

                if already_applied.contains(&entry.ordinal) {
                    outcomes.insert(entry.ordinal, EntryOutcome::AlreadyApplied);
                    report.entries.push(EntryReport::new(entry, EntryOutcome::AlreadyApplied));
                    continue;
                }

                match dependency_state(entry, &by_ordinal, outcomes) {
                    DependencyState::Waiting => still_pending.push(entry),
                    DependencyState::Blocked(reason) => {
                        debug!("Skipping {}: {}", entry.label(), reason);
                        let outcome = EntryOutcome::Skipped { reason };
                        outcomes.insert(entry.ordinal, outcome.clone());
                        report.entries.push(EntryReport::new(entry, outcome));
                    }
                    DependencyState::Ready => {
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            still_pending.push(entry);
                            continue;
                        };
                        let Some(mut session) = self.pool.idle.pop() else {
                            still_pending.push(entry);
                            continue;
                        };
                        let entry = entry.clone();
                        let handler = Arc::clone(handler);
                        running.spawn(async move {
                            let started = Instant::now();
                            let result = handler.apply(&entry, session.as_mut()).await;
                            drop(permit);
                            (entry.ordinal, session, result, started.elapsed())
                        });
                    }
                }
            }
            pending = still_pending;

            let Some(joined) = running.join_next().await else {
                // Nothing in flight and nothing dispatchable.
                for entry in pending.drain(..) {
                    let outcome = EntryOutcome::Skipped {
                        reason: "dependencies never completed".to_string(),
                    };
                    outcomes.insert(entry.ordinal, outcome.clone());
                    report.entries.push(EntryReport::new(entry, outcome));
                }
                break;
            };

            let (ordinal, session, result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // The session went down with the task.
                    error!("Worker task failed: {}", e);
                    return Err(Error::Worker(e.to_string()));
                }
            };
            self.pool.idle.push(session);
            let Some(entry) = by_ordinal.get(&ordinal).copied() else {
                continue;
            };

            let result = match result {
                Ok(output) => handler.completed(entry).await.map(|_| output),
                Err(e) => Err(e),
            };

            let mut line = match result {
                Ok(output) => {
                    debug!("Applied {} in {:?}", entry.label(), elapsed);
                    let mut line = EntryReport::new(entry, EntryOutcome::Succeeded);
                    line.rows = output.rows;
                    line.warnings = output.warnings;
                    line
                }
                Err(e) => {
                    error!("Failed to apply {}: {}", entry.label(), e);
                    let reason = e.to_string();
                    if matches!(e, Error::Cancelled) && stop_reason.is_none() {
                        stop_reason = Some("run cancelled".to_string());
                        cancelled = true;
                    } else if self.strict && phase == Phase::Data && abort.is_none() {
                        stop_reason = Some(format!("aborted after entry {} failed", ordinal));
                        abort = Some(Error::EntryExecution {
                            ordinal,
                            object_kind: entry.kind,
                            name: entry.object_ref().qualified_name(),
                            reason: reason.clone(),
                        });
                    }
                    EntryReport::new(entry, EntryOutcome::Failed { reason })
                }
            };
            line.duration_ms = elapsed.as_millis() as u64;
            outcomes.insert(ordinal, line.outcome.clone());
            report.entries.push(line);
        }

        match abort {
            Some(e) => Err(e),
            None => Ok(cancelled),
        }
    }
}

enum DependencyState {
    Ready,
    Waiting,
    Blocked(String),
}

/// Dependencies in this phase must have finished; dependencies from
/// earlier phases must have succeeded. Ordinals never seen in this run were
/// filtered out and are treated as present.
fn dependency_state(
    entry: &TocEntry,
    in_phase: &HashMap<u32, &TocEntry>,
    outcomes: &HashMap<u32, EntryOutcome>,
) -> DependencyState {
    for dep in &entry.depends_on {
        match outcomes.get(dep) {
            Some(outcome) if outcome.satisfies_dependents() => {}
            Some(EntryOutcome::Failed { .. }) => {
                return DependencyState::Blocked(format!("dependency {} failed", dep))
            }
            Some(_) => return DependencyState::Blocked(format!("dependency {} was skipped", dep)),
            None if in_phase.contains_key(dep) => return DependencyState::Waiting,
            None => {}
        }
    }
    DependencyState::Ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ObjectKind;
    use crate::database::MemoryDatabase;
    use parking_lot::Mutex;

    fn entry(ordinal: u32, phase: Phase, deps: &[u32]) -> TocEntry {
        TocEntry {
            ordinal,
            phase,
            oid: 1000 + ordinal,
            kind: ObjectKind::Table,
            schema: "public".into(),
            name: format!("t{}", ordinal),
            owner: None,
            parent: None,
            depends_on: deps.to_vec(),
            metadata: None,
            data: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<u32>>,
        fail: HashSet<u32>,
        panic_on: Option<u32>,
    }

    #[async_trait]
    impl EntryHandler for Recorder {
        async fn apply(&self, entry: &TocEntry, _session: &mut dyn Session) -> Result<EntryOutput> {
            tokio::task::yield_now().await;
            if self.panic_on == Some(entry.ordinal) {
                panic!("handler crashed on entry {}", entry.ordinal);
            }
            if self.fail.contains(&entry.ordinal) {
                return Err(Error::Config(format!("entry {} refused", entry.ordinal)));
            }
            self.applied.lock().push(entry.ordinal);
            Ok(EntryOutput::rows(1))
        }
    }

    async fn executor(jobs: usize) -> ParallelExecutor {
        let db = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        let pool = SessionPool::connect(&db, jobs).await.unwrap();
        ParallelExecutor::new(pool, PhaseConcurrency { metadata_jobs: 1, jobs })
    }

    #[tokio::test]
    async fn test_dependencies_complete_first() {
        let entries = vec![
            entry(0, Phase::PreData, &[]),
            entry(1, Phase::PreData, &[0]),
            entry(2, Phase::Data, &[1]),
            entry(3, Phase::Data, &[1]),
            entry(4, Phase::PostData, &[2]),
        ];
        let handler = Arc::new(Recorder::default());
        let report = executor(3)
            .await
            .run("b", &entries, &HashSet::new(), handler.clone())
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 5);
        let applied = handler.applied.lock().clone();
        let pos = |o: u32| applied.iter().position(|x| *x == o).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(1) < pos(2) && pos(1) < pos(3));
        assert!(pos(2) < pos(4) && pos(3) < pos(4));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let entries = vec![
            entry(0, Phase::PreData, &[]),
            entry(1, Phase::PreData, &[]),
            entry(2, Phase::Data, &[0]),
            entry(3, Phase::Data, &[1]),
            entry(4, Phase::PostData, &[2]),
        ];
        let handler = Arc::new(Recorder {
            fail: HashSet::from([0]),
            ..Default::default()
        });
        let report = executor(2)
            .await
            .run("b", &entries, &HashSet::new(), handler)
            .await
            .unwrap();

        assert!(matches!(report.entry(0).unwrap().outcome, EntryOutcome::Failed { .. }));
        assert!(matches!(report.entry(2).unwrap().outcome, EntryOutcome::Skipped { .. }));
        assert!(matches!(report.entry(4).unwrap().outcome, EntryOutcome::Skipped { .. }));
        assert_eq!(report.entry(3).unwrap().outcome, EntryOutcome::Succeeded);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_a_worker_error() {
        let entries = vec![entry(0, Phase::PreData, &[]), entry(1, Phase::Data, &[0])];
        let handler = Arc::new(Recorder {
            panic_on: Some(0),
            ..Default::default()
        });
        let err = executor(1)
            .await
            .run("b", &entries, &HashSet::new(), handler.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Worker(_)));
        assert!(handler.applied.lock().is_empty());
    }

    #[tokio::test]
    async fn test_strict_mode_aborts_on_data_failure() {
        let entries = vec![
            entry(0, Phase::Data, &[]),
            entry(1, Phase::Data, &[]),
            entry(2, Phase::PostData, &[]),
        ];
        let handler = Arc::new(Recorder {
            fail: HashSet::from([0]),
            ..Default::default()
        });
        let err = executor(1)
            .await
            .strict(true)
            .run("b", &entries, &HashSet::new(), handler.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::EntryExecution { ordinal: 0, .. }));
        assert!(!handler.applied.lock().contains(&2));
    }

    #[tokio::test]
    async fn test_already_applied_entries_are_not_rerun() {
        let entries = vec![entry(0, Phase::PreData, &[]), entry(1, Phase::Data, &[0])];
        let handler = Arc::new(Recorder::default());
        let report = executor(1)
            .await
            .run("b", &entries, &HashSet::from([0]), handler.clone())
            .await
            .unwrap();

        assert_eq!(*handler.applied.lock(), vec![1]);
        assert_eq!(report.already_applied(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_skips_undispatched_entries() {
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        let entries = vec![entry(0, Phase::PreData, &[]), entry(1, Phase::Data, &[])];
        let handler = Arc::new(Recorder::default());
        let report = executor(1)
            .await
            .with_shutdown(rx)
            .run("b", &entries, &HashSet::new(), handler.clone())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
        assert!(handler.applied.lock().is_empty());
    }
}
