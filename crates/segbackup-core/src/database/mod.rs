//! Database connection collaborators.
//!
//! The engines talk to the database only through [`Database`] and
//! [`Session`]. [`MemoryDatabase`] is an in-process engine used by the test
//! suites; [`PostgresDatabase`] speaks the PostgreSQL wire protocol through
//! sqlx.

mod memory;
mod postgres;

pub use memory::{LockHold, MemoryDatabase};
pub use postgres::PostgresDatabase;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::time::Duration;

use crate::catalog::{CatalogEntity, CatalogQuery, ObjectKey, ObjectRef};
use crate::snapshot::LockMode;
use crate::statistics::{AttributeStatistic, TupleStatistic};
use crate::version::{EngineVersion, StatisticsFeatures};
use crate::Result;

/// Pieces of a relation's rows in COPY text format, one `\n`-terminated
/// line per row. Pieces may split rows.
pub type CopyStream<'a> = BoxStream<'a, Result<Bytes>>;

/// Factory for independent sessions against one database
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a new session.
    async fn connect(&self) -> Result<Box<dyn Session>>;

    /// Connection target for logs, without credentials.
    fn target(&self) -> String;
}

/// One connection with at most one open transaction
#[async_trait]
pub trait Session: CatalogQuery + Send {
    async fn server_version(&mut self) -> Result<EngineVersion>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Lock a relation for the rest of the transaction. Waits at most
    /// `timeout` for conflicting holders, then fails with
    /// [`crate::Error::LockTimeout`] and leaves the session usable.
    async fn lock_relation(
        &mut self,
        relation: &ObjectRef,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()>;

    /// Export the transaction's snapshot for other sessions.
    async fn export_snapshot(&mut self) -> Result<String>;

    /// Make the current transaction see an exported snapshot.
    async fn import_snapshot(&mut self, snapshot_id: &str) -> Result<()>;

    /// Execute a DDL or utility statement.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Stream every row of a table. The session is busy until the stream
    /// is dropped.
    async fn copy_out<'a>(&'a mut self, relation: &ObjectRef) -> Result<CopyStream<'a>>;

    /// Load rows into a table, returning the number of rows loaded.
    async fn copy_in(&mut self, relation: &ObjectRef, data: Bytes) -> Result<u64>;

    async fn write_tuple_statistic(&mut self, stat: &TupleStatistic) -> Result<()>;

    async fn write_attribute_statistic(
        &mut self,
        stat: &AttributeStatistic,
        features: &StatisticsFeatures,
    ) -> Result<()>;
}

/// Portable identities of every user object in the session's database.
pub async fn existing_objects(session: &mut dyn Session) -> Result<HashSet<ObjectKey>> {
    Ok(session
        .list_objects()
        .await?
        .iter()
        .map(|o| o.object_ref().key())
        .collect())
}
