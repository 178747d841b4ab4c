//! Test helper utilities.
//!
//! Builds synthetic catalogs used across unit tests.

use segbackup_core::catalog::{CatalogObject, ObjectKind, ObjectRef, Oid};

fn parent_ref(table: &CatalogObject) -> ObjectRef {
    ObjectRef {
        oid: table.oid,
        kind: table.kind,
        schema: table.schema.clone(),
        name: table.name.clone(),
    }
}

pub fn schema(oid: Oid, name: &str) -> CatalogObject {
    CatalogObject::new(oid, ObjectKind::Schema, "", name, format!("CREATE SCHEMA {}", name))
}

pub fn table(oid: Oid, schema_oid: Oid, schema: &str, name: &str) -> CatalogObject {
    CatalogObject::new(
        oid,
        ObjectKind::Table,
        schema,
        name,
        format!("CREATE TABLE {}.{} (id int4)", schema, name),
    )
    .with_dependency(schema_oid)
}

pub fn index(oid: Oid, table: &CatalogObject, name: &str) -> CatalogObject {
    CatalogObject::new(
        oid,
        ObjectKind::Index,
        &table.schema,
        name,
        format!("CREATE INDEX {} ON {}.{} (id)", name, table.schema, table.name),
    )
    .with_parent(parent_ref(table))
}

pub fn foreign_key(oid: Oid, table: &CatalogObject, referenced: &CatalogObject, name: &str) -> CatalogObject {
    CatalogObject::new(
        oid,
        ObjectKind::Constraint,
        &table.schema,
        name,
        format!(
            "ALTER TABLE {}.{} ADD CONSTRAINT {} FOREIGN KEY (id) REFERENCES {}.{} (id)",
            table.schema, table.name, name, referenced.schema, referenced.name
        ),
    )
    .with_parent(parent_ref(table))
    .with_reference(referenced.oid)
}

pub fn view(oid: Oid, schema_oid: Oid, schema: &str, name: &str, over: &CatalogObject) -> CatalogObject {
    CatalogObject::new(
        oid,
        ObjectKind::View,
        schema,
        name,
        format!("CREATE VIEW {}.{} AS SELECT id FROM {}.{}", schema, name, over.schema, over.name),
    )
    .with_dependency(schema_oid)
    .with_dependency(over.oid)
}

/// A catalog of `schemas` schemas with `tables` tables each. Every table
/// has an index, every table after the first has a foreign key to its
/// predecessor, and every schema has a view over its last table. OIDs are
/// assigned in reverse name order so catalog order never matches the
/// deterministic tie-break.
pub fn generate_catalog(schemas: usize, tables: usize) -> Vec<CatalogObject> {
    let mut objects = Vec::new();
    let mut next: Oid = 90_000;
    let mut alloc = || {
        next -= 1;
        next
    };

    for s in 0..schemas {
        let schema_name = format!("s{:02}", s);
        let schema_obj = schema(alloc(), &schema_name);
        let mut previous: Option<CatalogObject> = None;
        for t in 0..tables {
            let tbl = table(alloc(), schema_obj.oid, &schema_name, &format!("t{:03}", t));
            objects.push(index(alloc(), &tbl, &format!("t{:03}_idx", t)));
            if let Some(prev) = &previous {
                objects.push(foreign_key(alloc(), &tbl, prev, &format!("t{:03}_fk", t)));
            }
            previous = Some(tbl.clone());
            objects.push(tbl);
        }
        if let Some(last) = &previous {
            objects.push(view(alloc(), schema_obj.oid, &schema_name, "v_last", last));
        }
        objects.push(schema_obj);
    }
    objects
}
