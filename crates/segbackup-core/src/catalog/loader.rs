//! Loads the captured object set through a [`CatalogQuery`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use super::{CatalogEntity, CatalogObject, CatalogQuery, ObjectKind, Oid, Relation};
use crate::config::ObjectSelection;
use crate::statistics::{capture_attribute, capture_tuple, AttributeStatistic, TupleStatistic};
use crate::version::StatisticsFeatures;
use crate::Result;

/// Reads relations, object definitions and statistics for one run.
pub struct CatalogLoader<'a, Q: CatalogQuery + ?Sized> {
    query: &'a mut Q,
}

impl<'a, Q: CatalogQuery + ?Sized> CatalogLoader<'a, Q> {
    pub fn new(query: &'a mut Q) -> Self {
        Self { query }
    }

    /// Relations selected by `filter`, ordered by schema and name.
    pub async fn load_relations(&mut self, filter: &ObjectSelection) -> Result<Vec<Relation>> {
        let mut relations: Vec<Relation> = self
            .query
            .list_relations()
            .await?
            .into_iter()
            .filter(|r| filter.matches_relation(&r.schema, &r.name))
            .collect();
        relations.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        debug!("Selected {} relations", relations.len());
        Ok(relations)
    }

    /// Every object needed to recreate `relations`: their schemas, the
    /// types and functions of those schemas, the relations themselves and
    /// their indexes, constraints, triggers and rules. Built-in schemas are
    /// left out since every target already has them.
    pub async fn load_objects(
        &mut self,
        relations: &[Relation],
        filter: &ObjectSelection,
    ) -> Result<Vec<CatalogObject>> {
        let selected: HashSet<Oid> = relations.iter().map(|r| r.oid).collect();
        let relation_schemas: BTreeSet<&str> = relations.iter().map(|r| r.schema.as_str()).collect();

        let objects: Vec<CatalogObject> = self
            .query
            .list_objects()
            .await?
            .into_iter()
            .filter(|obj| match obj.kind {
                ObjectKind::Schema if obj.is_builtin() => false,
                ObjectKind::Schema => {
                    relation_schemas.contains(obj.name.as_str())
                        || (!filter.has_relation_includes() && filter.matches_schema(&obj.name))
                }
                ObjectKind::Type | ObjectKind::Function => {
                    filter.matches_schema(&obj.schema)
                        && (!filter.has_relation_includes()
                            || relation_schemas.contains(obj.schema.as_str()))
                }
                kind if kind.is_relation() => selected.contains(&obj.oid),
                _ => obj
                    .parent
                    .as_ref()
                    .is_some_and(|parent| selected.contains(&parent.oid)),
            })
            .collect();

        debug!(
            "Loaded {} catalog objects for {} relations",
            objects.len(),
            relations.len()
        );
        Ok(objects)
    }

    /// Column statistics of the tables among `relations`, each list in
    /// attnum order.
    pub async fn load_attribute_statistics(
        &mut self,
        relations: &[Relation],
        source: &StatisticsFeatures,
    ) -> Result<BTreeMap<Oid, Vec<AttributeStatistic>>> {
        let oids = analyzable(relations);
        if oids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut by_relation: BTreeMap<Oid, Vec<AttributeStatistic>> = BTreeMap::new();
        for row in self.query.attribute_statistics(&oids).await? {
            by_relation
                .entry(row.relation)
                .or_default()
                .push(capture_attribute(&row, source));
        }
        for stats in by_relation.values_mut() {
            stats.sort_by_key(|s| s.attnum);
        }
        Ok(by_relation)
    }

    pub async fn load_tuple_statistics(
        &mut self,
        relations: &[Relation],
    ) -> Result<BTreeMap<Oid, TupleStatistic>> {
        let oids = analyzable(relations);
        if oids.is_empty() {
            return Ok(BTreeMap::new());
        }

        Ok(self
            .query
            .tuple_statistics(&oids)
            .await?
            .iter()
            .map(|row| (row.relation, capture_tuple(row)))
            .collect())
    }
}

fn analyzable(relations: &[Relation]) -> Vec<Oid> {
    relations
        .iter()
        .filter(|r| matches!(r.kind, ObjectKind::Table | ObjectKind::MaterializedView))
        .map(|r| r.oid)
        .collect()
}
