//! Consistent-view acquisition across many sessions.
//!
//! A backup takes share locks on every captured relation inside one
//! control transaction and exports its snapshot. Workers import that
//! snapshot before reading anything, so every session sees the same
//! point in time and no relation can be dropped or rewritten underneath
//! the run.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{ObjectRef, Relation};
use crate::database::Session;
use crate::Result;

/// Table lock strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Blocks concurrent DDL, allows reads and writes
    AccessShare,
    /// Blocks everything
    AccessExclusive,
}

impl LockMode {
    pub fn sql(&self) -> &'static str {
        match self {
            LockMode::AccessShare => "ACCESS SHARE",
            LockMode::AccessExclusive => "ACCESS EXCLUSIVE",
        }
    }

    /// Whether two holders of these modes can coexist.
    pub fn compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::AccessShare, LockMode::AccessShare))
    }
}

/// Exported snapshot plus the relations locked under it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub snapshot_id: String,
    pub relations: Vec<ObjectRef>,
}

/// Takes and hands out the run's consistent view
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    lock_timeout: Duration,
}

impl SnapshotManager {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Lock every relation in `AccessShare` mode on the control session and
    /// export the snapshot. The control transaction stays open until
    /// [`SnapshotManager::release`]; on error it is rolled back.
    pub async fn acquire_consistent_view(
        &self,
        session: &mut dyn Session,
        relations: &[Relation],
    ) -> Result<SnapshotHandle> {
        session.begin().await?;
        match self.lock_and_export(session, relations).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    debug!("Rollback after failed snapshot acquisition: {}", rollback);
                }
                Err(e)
            }
        }
    }

    async fn lock_and_export(
        &self,
        session: &mut dyn Session,
        relations: &[Relation],
    ) -> Result<SnapshotHandle> {
        let started = Instant::now();
        let mut locked = Vec::with_capacity(relations.len());

        for relation in relations {
            let target = relation.object_ref();
            self.lock(session, &target, LockMode::AccessShare).await?;
            locked.push(target);
        }

        let snapshot_id = session.export_snapshot().await?;
        info!(
            "Locked {} relations in {:?}, exported snapshot {}",
            locked.len(),
            started.elapsed(),
            snapshot_id
        );

        Ok(SnapshotHandle {
            snapshot_id,
            relations: locked,
        })
    }

    /// Begin a worker transaction that sees the run's snapshot.
    pub async fn attach_worker(&self, session: &mut dyn Session, handle: &SnapshotHandle) -> Result<()> {
        session.begin().await?;
        if let Err(e) = session.import_snapshot(&handle.snapshot_id).await {
            let _ = session.rollback().await;
            return Err(e);
        }
        Ok(())
    }

    /// Commit the control transaction, releasing every share lock.
    pub async fn release(&self, session: &mut dyn Session) -> Result<()> {
        session.commit().await?;
        debug!("Released consistent view");
        Ok(())
    }

    /// Take `AccessExclusive` on a relation inside the caller's open
    /// transaction, before it is created, altered or loaded.
    pub async fn lock_for_restore(&self, session: &mut dyn Session, relation: &ObjectRef) -> Result<()> {
        self.lock(session, relation, LockMode::AccessExclusive).await
    }

    /// The wait is bounded by the server, so a timed out request never
    /// leaves a lock queued behind the session.
    async fn lock(&self, session: &mut dyn Session, relation: &ObjectRef, mode: LockMode) -> Result<()> {
        session.lock_relation(relation, mode, self.lock_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ObjectKind;
    use crate::database::{Database, LockHold, MemoryDatabase};
    use crate::Error;

    #[test]
    fn test_lock_compatibility() {
        assert!(LockMode::AccessShare.compatible_with(LockMode::AccessShare));
        assert!(!LockMode::AccessShare.compatible_with(LockMode::AccessExclusive));
        assert!(!LockMode::AccessExclusive.compatible_with(LockMode::AccessShare));
        assert_eq!(LockMode::AccessExclusive.sql(), "ACCESS EXCLUSIVE");
    }

    #[tokio::test]
    async fn test_lock_timeout_leaves_session_usable() {
        let db = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        db.run("CREATE TABLE public.orders (id int)").unwrap();
        db.hold_lock("public.orders", LockHold::Blocking).unwrap();
        let relations = vec![Relation::new(0, "public", "orders", ObjectKind::Table)];

        let manager = SnapshotManager::new(Duration::from_millis(20));
        let mut session = db.connect().await.unwrap();
        let err = manager
            .acquire_consistent_view(session.as_mut(), &relations)
            .await
            .unwrap_err();
        match err {
            Error::LockTimeout { relation, waited_ms } => {
                assert_eq!(relation, "public.orders");
                assert_eq!(waited_ms, 20);
            }
            other => panic!("expected a lock timeout, got {other}"),
        }
        assert_eq!(db.held_locks(), 0);

        // the same session can take the view once the holder is gone
        db.release_hold("public.orders");
        let handle = manager
            .acquire_consistent_view(session.as_mut(), &relations)
            .await
            .unwrap();
        assert_eq!(handle.relations.len(), 1);
        manager.release(session.as_mut()).await.unwrap();
    }
}
