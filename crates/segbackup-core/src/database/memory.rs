//! In-process database engine for tests.
//!
//! `MemoryDatabase` parses DDL with `sqlparser`, stores rows as text,
//! computes ANALYZE-style statistics laid out the way the configured engine
//! version stores them, and tracks table locks and exported snapshots
//! across sessions.
//!
//! There is no MVCC: reads always see the latest state, and rollback only
//! releases locks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sqlparser::ast::{
    visit_relations, AlterTableOperation, CreateIndex, CreateTable, DataType, Ident, ObjectName,
    ObjectNamePart, Query, SchemaName, Statement, TableConstraint,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{CopyStream, Database, Session};
use crate::catalog::{
    qualify, AttributeStatisticRow, CatalogEntity, CatalogObject, CatalogQuery, ModificationState,
    ObjectKind, ObjectRef, Oid, Relation, TupleStatisticRow,
};
use crate::error::DatabaseError;
use crate::snapshot::LockMode;
use crate::statistics::{AttributeStatistic, DistinctEstimate, StatisticKind, TupleStatistic};
use crate::version::{EngineVersion, StatisticsFeatures};
use crate::{Error, Result};

const FIRST_USER_OID: Oid = 16384;
const PUBLIC_NAMESPACE_OID: Oid = 2200;
const DEFAULT_COLLATION: Oid = 100;
const PAGE_SIZE: usize = 8192;
const LOCK_POLL: Duration = Duration::from_millis(2);

/// A lock held on a relation by something outside the test's sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockHold {
    /// An exclusive holder that is detected immediately
    Conflict,
    /// An exclusive holder that makes lockers wait
    Blocking,
}

#[derive(Debug, Clone)]
struct Column {
    name: String,
    type_name: String,
}

#[derive(Debug, Clone, Default)]
struct TableData {
    columns: Vec<Column>,
    rows: Vec<Vec<Option<String>>>,
    append_optimized: bool,
    mod_count: u64,
    ddl_generation: u64,
}

/// Columns covered by a primary key, unique constraint or unique index
#[derive(Debug, Clone)]
struct UniqueKey {
    table: Oid,
    columns: Vec<String>,
    primary: bool,
}

#[derive(Debug, Default)]
struct State {
    version: Option<EngineVersion>,
    features: StatisticsFeatures,
    segment_count: usize,
    next_oid: Oid,
    objects: BTreeMap<Oid, CatalogObject>,
    tables: HashMap<Oid, TableData>,
    keys: BTreeMap<Oid, UniqueKey>,
    attribute_stats: HashMap<Oid, BTreeMap<i16, AttributeStatisticRow>>,
    tuple_stats: HashMap<Oid, (f64, i32)>,
    locks: HashMap<Oid, Vec<(u64, LockMode)>>,
    holds: HashMap<Oid, LockHold>,
    snapshots: HashMap<String, u64>,
    next_session: u64,
    failing_copy_in: HashSet<Oid>,
    failing_statistics: HashSet<Oid>,
}

/// In-memory database shared by every session it hands out
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    /// Database reporting `version`, with three segments and the `public`
    /// schema every new database starts with.
    pub fn new(version: EngineVersion) -> Self {
        let mut state = State {
            version: Some(version),
            features: version.statistics_features(),
            segment_count: 3,
            next_oid: FIRST_USER_OID,
            ..Default::default()
        };
        state.add_object(
            CatalogObject::new(PUBLIC_NAMESPACE_OID, ObjectKind::Schema, "", "public", "CREATE SCHEMA public")
                .with_owner("pg_database_owner"),
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Execute a script of `;`-separated statements.
    pub fn run(&self, script: &str) -> Result<()> {
        let statements = parse(script)?;
        let mut state = self.state.lock();
        for statement in statements {
            state.apply(statement)?;
        }
        Ok(())
    }

    /// Append rows to `schema.table`.
    pub fn insert<R, S>(&self, relation: &str, rows: impl IntoIterator<Item = R>) -> Result<()>
    where
        R: IntoIterator<Item = S>,
        S: ToString,
    {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| Some(v.to_string())).collect())
            .collect();
        let mut state = self.state.lock();
        let oid = state.relation_oid(relation)?;
        state.append_rows(oid, rows)
    }

    /// TRUNCATE a table. Append-optimized tables get fresh segment files,
    /// so their modcount starts over and the operation is logged as DDL.
    pub fn truncate(&self, relation: &str) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.relation_oid(relation)?;
        let table = state
            .tables
            .get_mut(&oid)
            .ok_or_else(|| DatabaseError::ObjectNotFound(relation.to_string()))?;
        table.rows.clear();
        table.mod_count = 0;
        table.ddl_generation += 1;
        Ok(())
    }

    /// Compute statistics for a table.
    pub fn analyze(&self, relation: &str) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.relation_oid(relation)?;
        state.analyze(oid)
    }

    pub fn row_count(&self, relation: &str) -> Option<usize> {
        let state = self.state.lock();
        let oid = state.relation_oid(relation).ok()?;
        state.tables.get(&oid).map(|t| t.rows.len())
    }

    pub fn rows(&self, relation: &str) -> Option<Vec<Vec<Option<String>>>> {
        let state = self.state.lock();
        let oid = state.relation_oid(relation).ok()?;
        state.tables.get(&oid).map(|t| t.rows.clone())
    }

    pub fn has_object(&self, kind: ObjectKind, schema: &str, name: &str) -> bool {
        self.state
            .lock()
            .objects
            .values()
            .any(|o| o.kind == kind && o.schema == schema && o.name == name)
    }

    /// Catalog entry of an object, if it exists.
    pub fn object(&self, kind: ObjectKind, schema: &str, name: &str) -> Option<CatalogObject> {
        self.state
            .lock()
            .objects
            .values()
            .find(|o| o.kind == kind && o.schema == schema && o.name == name)
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Stored `pg_statistic` rows of a table, in attnum order.
    pub fn attribute_statistics(&self, relation: &str) -> Vec<AttributeStatisticRow> {
        let state = self.state.lock();
        state
            .relation_oid(relation)
            .ok()
            .and_then(|oid| state.attribute_stats.get(&oid))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `(reltuples, relpages)` of a table, if it has been analyzed.
    pub fn tuple_statistic(&self, relation: &str) -> Option<(f64, i32)> {
        let state = self.state.lock();
        let oid = state.relation_oid(relation).ok()?;
        state.tuple_stats.get(&oid).copied()
    }

    /// Simulate a lock held by a session outside the run.
    pub fn hold_lock(&self, relation: &str, hold: LockHold) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.relation_oid(relation)?;
        state.holds.insert(oid, hold);
        Ok(())
    }

    pub fn release_hold(&self, relation: &str) {
        let mut state = self.state.lock();
        if let Ok(oid) = state.relation_oid(relation) {
            state.holds.remove(&oid);
        }
    }

    pub fn fail_copy_in(&self, relation: &str) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.relation_oid(relation)?;
        state.failing_copy_in.insert(oid);
        Ok(())
    }

    pub fn fail_statistics(&self, relation: &str) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.relation_oid(relation)?;
        state.failing_statistics.insert(oid);
        Ok(())
    }

    /// Number of relation locks currently held by sessions.
    pub fn held_locks(&self) -> usize {
        self.state.lock().locks.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn connect(&self) -> Result<Box<dyn Session>> {
        let id = {
            let mut state = self.state.lock();
            state.next_session += 1;
            state.next_session
        };
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            id,
            in_transaction: false,
        }))
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    id: u64,
    in_transaction: bool,
}

impl MemorySession {
    fn require_transaction(&self) -> Result<()> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(DatabaseError::NoTransaction.into())
        }
    }

    fn end_transaction(&mut self) -> Result<()> {
        self.require_transaction()?;
        let mut state = self.state.lock();
        for holders in state.locks.values_mut() {
            holders.retain(|(session, _)| *session != self.id);
        }
        state.locks.retain(|_, holders| !holders.is_empty());
        let id = self.id;
        state.snapshots.retain(|_, owner| *owner != id);
        self.in_transaction = false;
        Ok(())
    }

    /// Try to take a lock; `Ok(false)` means a conflicting holder exists.
    fn try_lock(&self, relation: &ObjectRef, mode: LockMode) -> Result<bool> {
        let mut state = self.state.lock();
        let oid = state.find_relation(&relation.schema, &relation.name)?;

        match state.holds.get(&oid) {
            Some(LockHold::Conflict) => {
                return Err(Error::LockConflict {
                    relation: relation.qualified_name(),
                    holder: "an exclusive lock held by another session".to_string(),
                })
            }
            Some(LockHold::Blocking) => return Ok(false),
            None => {}
        }

        let holders = state.locks.entry(oid).or_default();
        let blocked = holders
            .iter()
            .any(|(session, held)| *session != self.id && !held.compatible_with(mode));
        if blocked {
            return Ok(false);
        }
        holders.push((self.id, mode));
        Ok(true)
    }
}

#[async_trait]
impl CatalogQuery for MemorySession {
    async fn list_relations(&mut self) -> Result<Vec<Relation>> {
        let state = self.state.lock();
        Ok(state
            .objects
            .values()
            .filter(|o| o.kind.is_relation())
            .map(|o| {
                let mut relation = Relation::new(o.oid, &o.schema, &o.name, o.kind);
                relation.modification = state
                    .tables
                    .get(&o.oid)
                    .filter(|t| t.append_optimized)
                    .map(|t| ModificationState {
                        mod_count: t.mod_count,
                        last_ddl: Some(format!("ddl-{}", t.ddl_generation)),
                    });
                relation
            })
            .collect())
    }

    async fn list_objects(&mut self) -> Result<Vec<CatalogObject>> {
        Ok(self.state.lock().objects.values().cloned().collect())
    }

    async fn attribute_statistics(&mut self, relations: &[Oid]) -> Result<Vec<AttributeStatisticRow>> {
        let state = self.state.lock();
        Ok(relations
            .iter()
            .filter_map(|oid| state.attribute_stats.get(oid))
            .flat_map(|rows| rows.values().cloned())
            .collect())
    }

    async fn tuple_statistics(&mut self, relations: &[Oid]) -> Result<Vec<TupleStatisticRow>> {
        let state = self.state.lock();
        Ok(relations
            .iter()
            .filter_map(|oid| {
                let (rel_tuples, rel_pages) = *state.tuple_stats.get(oid)?;
                let obj = state.objects.get(oid)?;
                Some(TupleStatisticRow {
                    relation: *oid,
                    schema: obj.schema.clone(),
                    table: obj.name.clone(),
                    rel_tuples,
                    rel_pages,
                })
            })
            .collect())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn server_version(&mut self) -> Result<EngineVersion> {
        self.state
            .lock()
            .version
            .ok_or_else(|| DatabaseError::Version("unset".to_string()).into())
    }

    async fn begin(&mut self) -> Result<()> {
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.end_transaction()
    }

    async fn rollback(&mut self) -> Result<()> {
        self.end_transaction()
    }

    async fn lock_relation(
        &mut self,
        relation: &ObjectRef,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        self.require_transaction()?;
        let deadline = Instant::now() + timeout;
        while !self.try_lock(relation, mode)? {
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    relation: relation.qualified_name(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
        Ok(())
    }

    async fn export_snapshot(&mut self) -> Result<String> {
        self.require_transaction()?;
        let mut state = self.state.lock();
        let id = format!("{:08X}-{:08X}-1", self.id, state.snapshots.len() + 1);
        state.snapshots.insert(id.clone(), self.id);
        Ok(id)
    }

    async fn import_snapshot(&mut self, snapshot_id: &str) -> Result<()> {
        self.require_transaction()?;
        if self.state.lock().snapshots.contains_key(snapshot_id) {
            Ok(())
        } else {
            Err(DatabaseError::SnapshotNotFound(snapshot_id.to_string()).into())
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let statements = parse(sql)?;
        let mut state = self.state.lock();
        for statement in statements {
            state.apply(statement)?;
        }
        Ok(())
    }

    async fn copy_out<'a>(&'a mut self, relation: &ObjectRef) -> Result<CopyStream<'a>> {
        let lines: Vec<Result<Bytes>> = {
            let state = self.state.lock();
            let oid = state.find_relation(&relation.schema, &relation.name)?;
            state
                .table(oid)?
                .rows
                .iter()
                .map(|row| {
                    let fields: Vec<String> = row.iter().map(|v| encode_copy_value(v.as_deref())).collect();
                    Ok(Bytes::from(format!("{}\n", fields.join("\t"))))
                })
                .collect()
        };
        Ok(stream::iter(lines).boxed())
    }

    async fn copy_in(&mut self, relation: &ObjectRef, data: Bytes) -> Result<u64> {
        self.require_transaction()?;
        let mut state = self.state.lock();
        let oid = state.find_relation(&relation.schema, &relation.name)?;
        if state.failing_copy_in.contains(&oid) {
            return Err(DatabaseError::Query(format!(
                "COPY into {} failed: injected failure",
                relation.qualified_name()
            ))
            .into());
        }

        let text = std::str::from_utf8(&data)
            .map_err(|e| DatabaseError::Query(format!("invalid COPY data: {}", e)))?;
        let rows: Vec<Vec<Option<String>>> = text
            .lines()
            .filter(|l| !l.is_empty())
            .map(|line| line.split('\t').map(decode_copy_value).collect())
            .collect();
        let count = rows.len() as u64;
        state.append_rows(oid, rows)?;
        Ok(count)
    }

    async fn write_tuple_statistic(&mut self, stat: &TupleStatistic) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.statistics_target(&stat.schema, &stat.table)?;
        state.tuple_stats.insert(oid, (stat.rel_tuples, stat.rel_pages));
        Ok(())
    }

    async fn write_attribute_statistic(
        &mut self,
        stat: &AttributeStatistic,
        features: &StatisticsFeatures,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let oid = state.statistics_target(&stat.schema, &stat.table)?;
        let table = state.table(oid)?;
        let attnum = table
            .columns
            .iter()
            .position(|c| c.name == stat.attname)
            .map(|i| i as i16 + 1)
            .ok_or_else(|| {
                DatabaseError::ObjectNotFound(format!(
                    "column {} of {}",
                    stat.attname,
                    stat.qualified_table()
                ))
            })?;

        let slots = features.slot_count.min(state.features.slot_count);
        let mut row = AttributeStatisticRow {
            relation: oid,
            schema: stat.schema.clone(),
            table: stat.table.clone(),
            attname: stat.attname.clone(),
            type_name: stat.type_name.clone(),
            attnum,
            inherit: stat.inherit,
            null_fraction: stat.null_fraction,
            width: stat.width,
            distinct: stat.distinct,
            ..Default::default()
        };
        for slot in stat.slots.iter().take(slots) {
            row.kinds.push(slot.as_ref().map_or(0, |s| s.kind.0));
            row.operators.push(slot.as_ref().and_then(|s| s.operator).unwrap_or(0));
            row.collations.push(slot.as_ref().and_then(|s| s.collation).unwrap_or(0));
            row.values.push(slot.as_ref().and_then(|s| s.values.clone()));
            row.numbers.push(slot.as_ref().and_then(|s| s.numbers.clone()));
        }
        state.attribute_stats.entry(oid).or_default().insert(attnum, row);
        Ok(())
    }
}

impl State {
    fn alloc_oid(&mut self) -> Oid {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }

    fn find(&self, kind: impl Fn(ObjectKind) -> bool, schema: &str, name: &str) -> Option<Oid> {
        self.objects
            .values()
            .find(|o| kind(o.kind) && o.schema == schema && o.name == name)
            .map(|o| o.oid)
    }

    fn find_relation(&self, schema: &str, name: &str) -> Result<Oid> {
        self.find(|k| k.is_relation(), schema, name)
            .ok_or_else(|| DatabaseError::ObjectNotFound(qualify(schema, name)).into())
    }

    /// Resolve `schema.table` or a bare name in `public`.
    fn relation_oid(&self, qualified: &str) -> Result<Oid> {
        let (schema, name) = match qualified.split_once('.') {
            Some((schema, name)) => (schema, name),
            None => ("public", qualified),
        };
        self.find_relation(schema, name)
    }

    fn schema_oid(&self, schema: &str) -> Result<Oid> {
        self.find(|k| k == ObjectKind::Schema, "", schema)
            .ok_or_else(|| DatabaseError::ObjectNotFound(format!("schema {}", schema)).into())
    }

    fn table(&self, oid: Oid) -> Result<&TableData> {
        self.tables
            .get(&oid)
            .ok_or_else(|| DatabaseError::ObjectNotFound(format!("table with oid {}", oid)).into())
    }

    fn statistics_target(&self, schema: &str, table: &str) -> Result<Oid> {
        let oid = self.find_relation(schema, table)?;
        if self.failing_statistics.contains(&oid) {
            return Err(DatabaseError::Query(format!(
                "permission denied for pg_statistic on {}",
                qualify(schema, table)
            ))
            .into());
        }
        Ok(oid)
    }

    fn ensure_absent(&self, kind: ObjectKind, schema: &str, name: &str) -> Result<()> {
        let clash = if kind.is_relation() {
            self.find(|k| k.is_relation(), schema, name)
        } else {
            self.find(|k| k == kind, schema, name)
        };
        match clash {
            Some(_) => Err(DatabaseError::ObjectExists(format!("{} {}", kind, qualify(schema, name))).into()),
            None => Ok(()),
        }
    }

    fn add_object(&mut self, object: CatalogObject) -> Oid {
        let oid = object.oid;
        self.objects.insert(oid, object);
        oid
    }

    fn append_rows(&mut self, oid: Oid, rows: Vec<Vec<Option<String>>>) -> Result<()> {
        let table = self
            .tables
            .get_mut(&oid)
            .ok_or_else(|| DatabaseError::ObjectNotFound(format!("table with oid {}", oid)))?;
        for row in &rows {
            if row.len() != table.columns.len() {
                return Err(DatabaseError::Query(format!(
                    "expected {} columns, got {}",
                    table.columns.len(),
                    row.len()
                ))
                .into());
            }
            for (value, column) in row.iter().zip(&table.columns) {
                if let Some(v) = value {
                    check_type(&column.type_name, v)?;
                }
            }
        }
        table.rows.extend(rows);
        table.mod_count += 1;
        Ok(())
    }

    /// Apply one parsed statement. The stored definition is the statement
    /// as the parser renders it.
    fn apply(&mut self, statement: Statement) -> Result<()> {
        let definition = statement.to_string();
        match statement {
            Statement::CreateSchema { schema_name, .. } => {
                let name = match &schema_name {
                    SchemaName::Simple(name) | SchemaName::NamedAuthorization(name, _) => {
                        single_name(name)?
                    }
                    SchemaName::UnnamedAuthorization(role) => ident_name(role),
                };
                self.ensure_absent(ObjectKind::Schema, "", &name)?;
                let oid = self.alloc_oid();
                self.add_object(
                    CatalogObject::new(oid, ObjectKind::Schema, "", name, definition).with_owner("gpadmin"),
                );
                Ok(())
            }
            Statement::CreateTable(create) => self.create_table(&create, definition),
            Statement::CreateView {
                name,
                materialized,
                query,
                ..
            } => {
                let kind = if materialized {
                    ObjectKind::MaterializedView
                } else {
                    ObjectKind::View
                };
                self.create_view(&name, &query, kind, definition)
            }
            Statement::CreateSequence { name, .. } => {
                self.create_in_schema(&name, ObjectKind::Sequence, definition)
            }
            Statement::CreateType { name, .. } => self.create_in_schema(&name, ObjectKind::Type, definition),
            Statement::CreateFunction(function) => {
                self.create_in_schema(&function.name, ObjectKind::Function, definition)
            }
            Statement::CreateIndex(index) => self.create_index(&index, definition),
            Statement::AlterTable { name, operations, .. } => {
                for operation in operations {
                    match operation {
                        AlterTableOperation::AddConstraint { constraint, .. } => {
                            self.add_constraint(&name, constraint, definition.clone())?
                        }
                        other => return Err(unsupported(&other.to_string())),
                    }
                }
                Ok(())
            }
            other => Err(unsupported(&other.to_string())),
        }
    }

    fn create_table(&mut self, create: &CreateTable, definition: String) -> Result<()> {
        let (schema, name) = qualified_name(&create.name)?;
        let schema_oid = self.schema_oid(&schema)?;
        self.ensure_absent(ObjectKind::Table, &schema, &name)?;
        if !create.constraints.is_empty() {
            return Err(unsupported("table constraints inside CREATE TABLE"));
        }

        let mut columns: Vec<Column> = Vec::with_capacity(create.columns.len());
        let mut type_deps = Vec::new();
        for column in &create.columns {
            let column_name = ident_name(&column.name);
            if columns.iter().any(|c| c.name == column_name) {
                return Err(DatabaseError::Query(format!(
                    "column \"{}\" specified more than once",
                    column_name
                ))
                .into());
            }
            if let DataType::Custom(type_name, _) = &column.data_type {
                let (type_schema, type_short) = qualified_name(type_name)?;
                if let Some(oid) = self.find(|k| k == ObjectKind::Type, &type_schema, &type_short) {
                    type_deps.push(oid);
                }
            }
            columns.push(Column {
                name: column_name,
                type_name: column_type(&column.data_type),
            });
        }

        let oid = self.alloc_oid();
        let mut object = CatalogObject::new(oid, ObjectKind::Table, &schema, &name, definition)
            .with_owner("gpadmin")
            .with_dependency(schema_oid);
        for dep in type_deps {
            object = object.with_dependency(dep);
        }
        self.add_object(object);
        self.tables.insert(
            oid,
            TableData {
                columns,
                append_optimized: is_append_optimized(create),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn create_view(&mut self, name: &ObjectName, query: &Query, kind: ObjectKind, definition: String) -> Result<()> {
        let (schema, view) = qualified_name(name)?;
        let schema_oid = self.schema_oid(&schema)?;
        self.ensure_absent(kind, &schema, &view)?;

        let mut referenced = Vec::new();
        let _ = visit_relations(query, |relation| {
            referenced.push(relation.clone());
            ControlFlow::<()>::Continue(())
        });
        let mut deps = Vec::with_capacity(referenced.len());
        for relation in &referenced {
            let (rel_schema, rel_name) = qualified_name(relation)?;
            deps.push(self.find_relation(&rel_schema, &rel_name)?);
        }

        let oid = self.alloc_oid();
        let mut object = CatalogObject::new(oid, kind, &schema, &view, definition)
            .with_owner("gpadmin")
            .with_dependency(schema_oid);
        for dep in deps {
            object = object.with_dependency(dep);
        }
        self.add_object(object);
        if kind == ObjectKind::MaterializedView {
            self.tables.insert(oid, TableData::default());
        }
        Ok(())
    }

    fn create_in_schema(&mut self, name: &ObjectName, kind: ObjectKind, definition: String) -> Result<()> {
        let (schema, name) = qualified_name(name)?;
        let schema_oid = self.schema_oid(&schema)?;
        self.ensure_absent(kind, &schema, &name)?;
        let oid = self.alloc_oid();
        self.add_object(
            CatalogObject::new(oid, kind, &schema, &name, definition)
                .with_owner("gpadmin")
                .with_dependency(schema_oid),
        );
        Ok(())
    }

    /// New object attached to `table_oid`, not yet added.
    fn attached(&mut self, kind: ObjectKind, table_oid: Oid, name: &str, definition: String) -> Result<CatalogObject> {
        let parent = self
            .objects
            .get(&table_oid)
            .map(CatalogEntity::object_ref)
            .ok_or_else(|| DatabaseError::ObjectNotFound(format!("relation with oid {}", table_oid)))?;
        self.ensure_absent(kind, &parent.schema, name)?;

        let oid = self.alloc_oid();
        Ok(CatalogObject::new(oid, kind, parent.schema.clone(), name, definition)
            .with_owner("gpadmin")
            .with_parent(parent))
    }

    fn create_index(&mut self, index: &CreateIndex, definition: String) -> Result<()> {
        let name = index
            .name
            .as_ref()
            .ok_or_else(|| unsupported("CREATE INDEX without a name"))?;
        let (_, index_name) = qualified_name(name)?;
        let (schema, table) = qualified_name(&index.table_name)?;
        let table_oid = self.find_relation(&schema, &table)?;
        let columns = column_names(&index.columns);
        if index.unique {
            self.check_unique(table_oid, &columns)?;
        }

        let object = self.attached(ObjectKind::Index, table_oid, &index_name, definition)?;
        let oid = self.add_object(object);
        if index.unique {
            self.keys.insert(
                oid,
                UniqueKey {
                    table: table_oid,
                    columns,
                    primary: false,
                },
            );
        }
        Ok(())
    }

    /// `ALTER TABLE t ADD [CONSTRAINT c] {PRIMARY KEY|UNIQUE|FOREIGN KEY|CHECK} ...`
    fn add_constraint(&mut self, table_name: &ObjectName, constraint: TableConstraint, definition: String) -> Result<()> {
        let (schema, table) = qualified_name(table_name)?;
        let table_oid = self.find_relation(&schema, &table)?;

        match constraint {
            TableConstraint::PrimaryKey { name, columns, .. } => {
                let columns = column_names(&columns);
                let name = constraint_name(name.as_ref(), &table, &[], "pkey");
                self.add_key(table_oid, &name, columns, true, definition)
            }
            TableConstraint::Unique { name, columns, .. } => {
                let columns = column_names(&columns);
                let name = constraint_name(name.as_ref(), &table, &columns, "key");
                self.add_key(table_oid, &name, columns, false, definition)
            }
            TableConstraint::ForeignKey {
                name,
                columns,
                foreign_table,
                referred_columns,
                ..
            } => {
                let columns = column_names(&columns);
                let (ref_schema, ref_table) = qualified_name(&foreign_table)?;
                let ref_oid = self.find_relation(&ref_schema, &ref_table)?;
                let (key_oid, ref_columns) = self.referenced_key(ref_oid, &column_names(&referred_columns))?;
                self.check_foreign_key(table_oid, &columns, ref_oid, &ref_columns)?;

                let name = constraint_name(name.as_ref(), &table, &columns, "fkey");
                let object = self
                    .attached(ObjectKind::Constraint, table_oid, &name, definition)?
                    .with_reference(ref_oid)
                    .with_dependency(key_oid);
                self.add_object(object);
                Ok(())
            }
            TableConstraint::Check { name, .. } => {
                let name = constraint_name(name.as_ref(), &table, &[], "check");
                let object = self.attached(ObjectKind::Constraint, table_oid, &name, definition)?;
                self.add_object(object);
                Ok(())
            }
            other => Err(unsupported(&other.to_string())),
        }
    }

    fn add_key(&mut self, table_oid: Oid, name: &str, columns: Vec<String>, primary: bool, definition: String) -> Result<()> {
        if primary && self.keys.values().any(|k| k.table == table_oid && k.primary) {
            return Err(DatabaseError::Query(format!("multiple primary keys for table with oid {}", table_oid)).into());
        }
        self.check_unique(table_oid, &columns)?;
        let object = self.attached(ObjectKind::Constraint, table_oid, name, definition)?;
        let oid = self.add_object(object);
        self.keys.insert(
            oid,
            UniqueKey {
                table: table_oid,
                columns,
                primary,
            },
        );
        Ok(())
    }

    /// The constraint or unique index a foreign key is checked against:
    /// the primary key when no columns are named, otherwise a key over
    /// exactly `columns`.
    fn referenced_key(&self, table_oid: Oid, columns: &[String]) -> Result<(Oid, Vec<String>)> {
        self.keys
            .iter()
            .filter(|(_, key)| key.table == table_oid)
            .find(|(_, key)| {
                if columns.is_empty() {
                    key.primary
                } else {
                    key.columns == columns
                }
            })
            .map(|(oid, key)| (*oid, key.columns.clone()))
            .ok_or_else(|| {
                let table = self
                    .objects
                    .get(&table_oid)
                    .map(|o| qualify(&o.schema, &o.name))
                    .unwrap_or_default();
                DatabaseError::Query(format!(
                    "there is no unique constraint matching given keys for referenced table {}",
                    table
                ))
                .into()
            })
    }

    fn key_values(&self, table_oid: Oid, columns: &[String]) -> Result<Vec<Option<Vec<String>>>> {
        let table = self.table(table_oid)?;
        let indexes = columns
            .iter()
            .map(|column| {
                table
                    .columns
                    .iter()
                    .position(|c| &c.name == column)
                    .ok_or_else(|| DatabaseError::ObjectNotFound(format!("column {}", column)).into())
            })
            .collect::<Result<Vec<usize>>>()?;
        // A key with any NULL part is never compared
        Ok(table
            .rows
            .iter()
            .map(|row| indexes.iter().map(|i| row[*i].clone()).collect())
            .collect())
    }

    fn check_unique(&self, table_oid: Oid, columns: &[String]) -> Result<()> {
        let mut seen = HashSet::new();
        for key in self.key_values(table_oid, columns)?.into_iter().flatten() {
            if !seen.insert(key.clone()) {
                return Err(DatabaseError::Query(format!(
                    "could not create unique index: duplicate key ({})",
                    key.join(", ")
                ))
                .into());
            }
        }
        Ok(())
    }

    fn check_foreign_key(&self, table_oid: Oid, columns: &[String], ref_oid: Oid, ref_columns: &[String]) -> Result<()> {
        if columns.len() != ref_columns.len() {
            return Err(DatabaseError::Query(
                "number of referencing and referenced columns for foreign key disagree".to_string(),
            )
            .into());
        }
        let referenced: HashSet<Vec<String>> = self
            .key_values(ref_oid, ref_columns)?
            .into_iter()
            .flatten()
            .collect();
        for key in self.key_values(table_oid, columns)?.into_iter().flatten() {
            if !referenced.contains(&key) {
                return Err(DatabaseError::Query(format!(
                    "insert or update violates foreign key constraint: key ({})=({}) is not present",
                    columns.join(", "),
                    key.join(", ")
                ))
                .into());
            }
        }
        Ok(())
    }

    /// ANALYZE: compute tuple and per-column statistics.
    fn analyze(&mut self, oid: Oid) -> Result<()> {
        let features = self.features;
        let segments = self.segment_count;
        let object = self
            .objects
            .get(&oid)
            .cloned()
            .ok_or_else(|| DatabaseError::ObjectNotFound(format!("oid {}", oid)))?;
        let table = self.table(oid)?.clone();

        let total_rows = table.rows.len();
        let bytes: usize = table
            .rows
            .iter()
            .flat_map(|r| r.iter())
            .map(|v| v.as_ref().map_or(0, |s| s.len() + 1))
            .sum();
        let pages = bytes.div_ceil(PAGE_SIZE).max(1) as i32;
        self.tuple_stats.insert(oid, (total_rows as f64, pages));

        let mut rows_by_attnum = BTreeMap::new();
        for (index, column) in table.columns.iter().enumerate() {
            let values: Vec<Option<&str>> = table.rows.iter().map(|r| r[index].as_deref()).collect();
            let segment_of: Vec<usize> = table
                .rows
                .iter()
                .map(|r| segment_for(r.first().and_then(|v| v.as_deref()), segments))
                .collect();
            let row = column_statistics(
                oid,
                &object,
                column,
                index as i16 + 1,
                &values,
                &segment_of,
                segments,
                &features,
            );
            rows_by_attnum.insert(row.attnum, row);
        }
        self.attribute_stats.insert(oid, rows_by_attnum);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn column_statistics(
    oid: Oid,
    table: &CatalogObject,
    column: &Column,
    attnum: i16,
    values: &[Option<&str>],
    segment_of: &[usize],
    segments: usize,
    features: &StatisticsFeatures,
) -> AttributeStatisticRow {
    let (eq, lt) = type_operators(&column.type_name);
    let collation = if features.per_slot_collation && is_collatable(&column.type_name) {
        DEFAULT_COLLATION
    } else {
        0
    };

    let rows = values.len();
    let present: Vec<(usize, &str)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    let nulls = rows - present.len();

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, v) in &present {
        *counts.entry(*v).or_default() += 1;
    }

    let width = match column.type_name.as_str() {
        "bool" => 1,
        "int2" => 2,
        "int4" | "float4" | "date" => 4,
        "int8" | "float8" => 8,
        _ if present.is_empty() => 0,
        _ => (present.iter().map(|(_, v)| v.len() + 1).sum::<usize>() / present.len()) as i32,
    };

    let mut slots: Vec<(StatisticKind, Oid, Option<Vec<String>>, Option<Vec<String>>)> = Vec::new();
    if !present.is_empty() {
        let n = present.len() as f32;
        let mut repeated: Vec<(&str, usize)> =
            counts.iter().filter(|(_, c)| **c > 1).map(|(v, c)| (*v, *c)).collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| compare_values(&column.type_name, a.0, b.0)));

        if !repeated.is_empty() {
            slots.push((
                StatisticKind::MCV,
                eq,
                Some(repeated.iter().map(|(v, _)| v.to_string()).collect()),
                Some(repeated.iter().map(|(_, c)| (*c as f32 / n).to_string()).collect()),
            ));
        }

        let mut singles: Vec<&str> = counts.iter().filter(|(_, c)| **c == 1).map(|(v, _)| *v).collect();
        singles.sort_by(|a, b| compare_values(&column.type_name, a, b));
        if singles.len() >= 2 {
            slots.push((
                StatisticKind::HISTOGRAM,
                lt,
                Some(singles.iter().map(|v| v.to_string()).collect()),
                None,
            ));
        }

        if counts.len() >= 2 {
            let corr = correlation(&column.type_name, &present);
            slots.push((StatisticKind::CORRELATION, lt, None, Some(vec![corr.to_string()])));
        }

        if features.ndv_by_segments {
            let mut local: Vec<HashSet<&str>> = vec![HashSet::new(); segments];
            for (i, v) in &present {
                local[segment_of[*i]].insert(*v);
            }
            let sum: usize = local.iter().map(HashSet::len).sum();
            slots.push((StatisticKind::NDV_BY_SEGMENTS, lt, Some(vec![(sum as f32).to_string()]), None));
        }
    }
    slots.truncate(features.slot_count);

    let mut row = AttributeStatisticRow {
        relation: oid,
        schema: table.schema.clone(),
        table: table.name.clone(),
        attname: column.name.clone(),
        type_name: column.type_name.clone(),
        attnum,
        inherit: false,
        null_fraction: if rows == 0 { 0.0 } else { nulls as f32 / rows as f32 },
        width,
        distinct: DistinctEstimate::from_counts(counts.len() as u64, present.len() as u64).to_raw(),
        ..Default::default()
    };
    for index in 0..features.slot_count {
        match slots.get(index) {
            Some((kind, op, values, numbers)) => {
                row.kinds.push(kind.0);
                row.operators.push(*op);
                row.collations.push(if *kind == StatisticKind::CORRELATION || values.is_some() {
                    collation
                } else {
                    0
                });
                row.values.push(values.clone());
                row.numbers.push(numbers.clone());
            }
            None => {
                row.kinds.push(0);
                row.operators.push(0);
                row.collations.push(0);
                row.values.push(None);
                row.numbers.push(None);
            }
        }
    }
    row
}

/// Pearson correlation between physical position and sort order.
fn correlation(type_name: &str, present: &[(usize, &str)]) -> f32 {
    let n = present.len();
    if n < 2 {
        return 1.0;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| compare_values(type_name, present[*a].1, present[*b].1));
    let mut rank = vec![0f64; n];
    for (r, i) in order.into_iter().enumerate() {
        rank[i] = r as f64;
    }

    let mean = (n - 1) as f64 / 2.0;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (pos, r) in rank.iter().enumerate() {
        let dx = pos as f64 - mean;
        let dy = r - mean;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 1.0;
    }
    (cov / (var_x.sqrt() * var_y.sqrt())) as f32
}

fn segment_for(key: Option<&str>, segments: usize) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.unwrap_or("").bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % segments as u64) as usize
}

fn type_operators(type_name: &str) -> (Oid, Oid) {
    match type_name {
        "int2" => (94, 95),
        "int4" => (96, 97),
        "int8" => (410, 412),
        "float4" => (620, 622),
        "float8" => (670, 672),
        "numeric" => (1752, 1754),
        "bool" => (91, 58),
        "date" => (1093, 1095),
        "text" | "varchar" => (98, 664),
        _ => (0, 0),
    }
}

fn is_collatable(type_name: &str) -> bool {
    matches!(type_name, "text" | "varchar")
}

fn is_numeric(type_name: &str) -> bool {
    matches!(type_name, "int2" | "int4" | "int8" | "float4" | "float8" | "numeric")
}

fn compare_values(type_name: &str, a: &str, b: &str) -> Ordering {
    if is_numeric(type_name) {
        if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
            return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
        }
    }
    a.cmp(b)
}

fn check_type(type_name: &str, value: &str) -> Result<()> {
    let ok = match type_name {
        "int2" => value.parse::<i16>().is_ok(),
        "int4" => value.parse::<i32>().is_ok(),
        "int8" => value.parse::<i64>().is_ok(),
        "float4" | "float8" | "numeric" => value.parse::<f64>().is_ok(),
        "bool" => matches!(value, "t" | "f" | "true" | "false"),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(DatabaseError::Query(format!("invalid input syntax for type {}: \"{}\"", type_name, value)).into())
    }
}

fn encode_copy_value(value: Option<&str>) -> String {
    match value {
        None => "\\N".to_string(),
        Some(v) => v
            .replace('\\', "\\\\")
            .replace('\t', "\\t")
            .replace('\n', "\\n"),
    }
}

fn decode_copy_value(field: &str) -> Option<String> {
    if field == "\\N" {
        return None;
    }
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('t') => out.push('\t'),
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

fn parse(sql: &str) -> Result<Vec<Statement>> {
    Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| Error::from(DatabaseError::Query(format!("syntax error: {}", e))))
}

fn unsupported(what: &str) -> Error {
    DatabaseError::Query(format!("unsupported statement: {}", what)).into()
}

/// Catalog form of an identifier: unquoted names fold to lowercase.
fn ident_name(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_ascii_lowercase(),
    }
}

fn name_parts(name: &ObjectName) -> Result<Vec<String>> {
    name.0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(ident) => Ok(ident_name(ident)),
            other => Err(unsupported(&other.to_string())),
        })
        .collect()
}

fn single_name(name: &ObjectName) -> Result<String> {
    match name_parts(name)?.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(DatabaseError::Query(format!("invalid schema name: {}", name)).into()),
    }
}

/// `(schema, name)` of a possibly qualified name; bare names are in `public`.
fn qualified_name(name: &ObjectName) -> Result<(String, String)> {
    match name_parts(name)?.as_slice() {
        [object] => Ok(("public".to_string(), object.clone())),
        [schema, object] => Ok((schema.clone(), object.clone())),
        _ => Err(DatabaseError::Query(format!("improper qualified name: {}", name)).into()),
    }
}

/// Column name of a rendered key or index column, without ordering options.
fn column_name(rendered: &str) -> String {
    let rendered = rendered.trim();
    if let Some(quoted) = rendered.strip_prefix('"') {
        let mut name = String::new();
        let mut chars = quoted.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                } else {
                    break;
                }
            }
            name.push(c);
        }
        return name;
    }
    rendered
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn column_names<T: ToString>(columns: &[T]) -> Vec<String> {
    columns.iter().map(|c| column_name(&c.to_string())).collect()
}

/// `pg_type` name of a column type, without modifiers.
fn column_type(data_type: &DataType) -> String {
    match data_type {
        DataType::Int(_) | DataType::Integer(_) | DataType::Int4(_) => "int4".to_string(),
        DataType::SmallInt(_) | DataType::Int2(_) => "int2".to_string(),
        DataType::BigInt(_) | DataType::Int8(_) => "int8".to_string(),
        DataType::Boolean | DataType::Bool => "bool".to_string(),
        DataType::Real | DataType::Float4 => "float4".to_string(),
        DataType::DoublePrecision | DataType::Float8 => "float8".to_string(),
        DataType::Numeric(_) | DataType::Decimal(_) | DataType::Dec(_) => "numeric".to_string(),
        DataType::Varchar(_) | DataType::CharacterVarying(_) | DataType::CharVarying(_) => {
            "varchar".to_string()
        }
        DataType::Text => "text".to_string(),
        DataType::Date => "date".to_string(),
        DataType::Custom(name, _) => name
            .0
            .last()
            .map(|part| match part {
                ObjectNamePart::Identifier(ident) => ident_name(ident),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        other => other.to_string().to_ascii_lowercase(),
    }
}

fn is_append_optimized(create: &CreateTable) -> bool {
    let rendered = create.to_string().to_ascii_lowercase();
    ["appendonly", "appendoptimized"].iter().any(|option| {
        rendered.contains(&format!("{} = true", option)) || rendered.contains(&format!("{} = 'true'", option))
    })
}

/// PostgreSQL's default name for an unnamed constraint.
fn constraint_name(name: Option<&Ident>, table: &str, columns: &[String], suffix: &str) -> String {
    match name {
        Some(name) => ident_name(name),
        None if columns.is_empty() => format!("{}_{}", table, suffix),
        None => format!("{}_{}_{}", table, columns.join("_"), suffix),
    }
}
