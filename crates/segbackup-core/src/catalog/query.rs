//! Read-only catalog query collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CatalogObject, Oid, Relation};
use crate::Result;

/// Raw `pg_statistic` row joined with its relation and attribute.
///
/// The per-slot vectors have one element per slot the source engine
/// stores. A zero kind marks an empty slot; zero operator and collation
/// OIDs mean "none".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeStatisticRow {
    pub relation: Oid,
    pub schema: String,
    pub table: String,
    pub attname: String,
    pub type_name: String,
    pub attnum: i16,
    pub inherit: bool,
    pub null_fraction: f32,
    pub width: i32,
    pub distinct: f32,
    pub kinds: Vec<i16>,
    pub operators: Vec<Oid>,
    pub collations: Vec<Oid>,
    pub values: Vec<Option<Vec<String>>>,
    pub numbers: Vec<Option<Vec<String>>>,
}

/// Raw `pg_class` tuple statistics row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleStatisticRow {
    pub relation: Oid,
    pub schema: String,
    pub table: String,
    pub rel_tuples: f64,
    pub rel_pages: i32,
}

/// Queries against the system catalogs, evaluated inside the caller's
/// snapshot. Implementations never modify the catalog.
#[async_trait]
pub trait CatalogQuery: Send {
    /// All user relations.
    async fn list_relations(&mut self) -> Result<Vec<Relation>>;

    /// All user catalog objects, relations included, with definitions.
    async fn list_objects(&mut self) -> Result<Vec<CatalogObject>>;

    /// Statistic rows for the given relations.
    async fn attribute_statistics(&mut self, relations: &[Oid]) -> Result<Vec<AttributeStatisticRow>>;

    /// Tuple statistics for the given relations.
    async fn tuple_statistics(&mut self, relations: &[Oid]) -> Result<Vec<TupleStatisticRow>>;
}
