//! Catalog object model.
//!
//! Every object a backup captures is described by a [`CatalogObject`]. The
//! resolver and executor never look at the kind-specific parts directly;
//! they go through the [`CatalogEntity`] capability set.

mod loader;
mod query;

pub use loader::CatalogLoader;
pub use query::{AttributeStatisticRow, CatalogQuery, TupleStatisticRow};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::toc::Phase;

/// Stable catalog object identifier
pub type Oid = u32;

/// Kind of a captured catalog object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Schema,
    Type,
    Function,
    Sequence,
    Table,
    View,
    MaterializedView,
    Index,
    Constraint,
    Trigger,
    Rule,
}

impl ObjectKind {
    /// Keyword used in DDL for this kind.
    pub fn keyword(&self) -> &'static str {
        match self {
            ObjectKind::Schema => "SCHEMA",
            ObjectKind::Type => "TYPE",
            ObjectKind::Function => "FUNCTION",
            ObjectKind::Sequence => "SEQUENCE",
            ObjectKind::Table => "TABLE",
            ObjectKind::View => "VIEW",
            ObjectKind::MaterializedView => "MATERIALIZED VIEW",
            ObjectKind::Index => "INDEX",
            ObjectKind::Constraint => "CONSTRAINT",
            ObjectKind::Trigger => "TRIGGER",
            ObjectKind::Rule => "RULE",
        }
    }

    /// Phase in which this kind's definition is replayed.
    pub fn metadata_phase(&self) -> Phase {
        match self {
            ObjectKind::Index | ObjectKind::Constraint | ObjectKind::Trigger | ObjectKind::Rule => {
                Phase::PostData
            }
            _ => Phase::PreData,
        }
    }

    /// Whether objects of this kind are rows in `pg_class`.
    pub fn is_relation(&self) -> bool {
        matches!(
            self,
            ObjectKind::Table | ObjectKind::View | ObjectKind::Sequence | ObjectKind::MaterializedView
        )
    }

    /// Whether objects of this kind are attached to an owning relation.
    pub fn has_parent(&self) -> bool {
        matches!(
            self,
            ObjectKind::Index | ObjectKind::Constraint | ObjectKind::Trigger | ObjectKind::Rule
        )
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A relation slated for capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Relation OID
    pub oid: Oid,

    /// Schema name
    pub schema: String,

    /// Relation name
    pub name: String,

    /// Table, view, sequence or materialized view
    pub kind: ObjectKind,

    /// Change tracking of an append-optimized table. Heap tables have
    /// none and are dumped by every incremental backup.
    #[serde(default)]
    pub modification: Option<ModificationState>,
}

/// Change-tracking state of an append-optimized table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationState {
    /// Sum of the modcounts of the table's segment files
    pub mod_count: u64,

    /// Time of the last DDL, TRUNCATE or rewrite recorded for the table
    #[serde(default)]
    pub last_ddl: Option<String>,
}

impl Relation {
    pub fn new(oid: Oid, schema: impl Into<String>, name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            oid,
            schema: schema.into(),
            name: name.into(),
            kind,
            modification: None,
        }
    }

    /// Whether the relation carries row data.
    pub fn has_data(&self) -> bool {
        self.kind == ObjectKind::Table
    }

    pub fn qualified_name(&self) -> String {
        qualify(&self.schema, &self.name)
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            oid: self.oid,
            kind: self.kind,
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }
}

/// Identity of a catalog object without its definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub oid: Oid,
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,
}

impl ObjectRef {
    /// Schema-qualified, quoted name. Schemas are not qualified.
    pub fn qualified_name(&self) -> String {
        match self.kind {
            ObjectKind::Schema => quote_ident(&self.name),
            _ => qualify(&self.schema, &self.name),
        }
    }

    /// Identity that is portable between databases (OIDs are not).
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind,
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.qualified_name())
    }
}

/// Database-independent object identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,
}

/// A captured catalog object with its definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogObject {
    pub oid: Oid,
    pub kind: ObjectKind,
    pub schema: String,
    pub name: String,

    /// Owning role, if any
    #[serde(default)]
    pub owner: Option<String>,

    /// Relation an index, constraint, trigger or rule is attached to
    #[serde(default)]
    pub parent: Option<ObjectRef>,

    /// CREATE statement text as produced by the catalog
    pub definition: String,

    /// OIDs this object depends on
    #[serde(default)]
    pub depends_on: Vec<Oid>,

    /// Referenced relation of a foreign key constraint
    #[serde(default)]
    pub references: Option<Oid>,
}

impl CatalogObject {
    pub fn new(
        oid: Oid,
        kind: ObjectKind,
        schema: impl Into<String>,
        name: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            oid,
            kind,
            schema: schema.into(),
            name: name.into(),
            owner: None,
            parent: None,
            definition: definition.into(),
            depends_on: Vec::new(),
            references: None,
        }
    }

    pub fn with_parent(mut self, parent: ObjectRef) -> Self {
        if !self.depends_on.contains(&parent.oid) {
            self.depends_on.push(parent.oid);
        }
        self.parent = Some(parent);
        self
    }

    pub fn with_dependency(mut self, oid: Oid) -> Self {
        if !self.depends_on.contains(&oid) {
            self.depends_on.push(oid);
        }
        self
    }

    /// Mark this constraint as a foreign key referencing `relation`.
    pub fn with_reference(mut self, relation: Oid) -> Self {
        self.references = Some(relation);
        self.with_dependency(relation)
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Schemas every database is created with. They are never captured, and
/// dependencies on them are satisfied by the target.
pub const BUILTIN_SCHEMAS: &[&str] = &["public"];

/// Capabilities every catalog object kind exposes to the resolver and
/// executor.
pub trait CatalogEntity {
    /// Identity of the object.
    fn object_ref(&self) -> ObjectRef;

    /// OIDs that must exist before this object can be created.
    fn dependencies(&self) -> Vec<Oid>;

    /// Statement that creates the object.
    fn create_statement(&self) -> String;

    /// Whether the object exists in every database without being created.
    fn is_builtin(&self) -> bool;
}

impl CatalogEntity for CatalogObject {
    fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            oid: self.oid,
            kind: self.kind,
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    fn dependencies(&self) -> Vec<Oid> {
        let mut deps: Vec<Oid> = self
            .depends_on
            .iter()
            .copied()
            .filter(|oid| *oid != self.oid)
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    fn create_statement(&self) -> String {
        let stmt = self.definition.trim_end();
        if stmt.ends_with(';') {
            stmt.to_string()
        } else {
            format!("{};", stmt)
        }
    }

    fn is_builtin(&self) -> bool {
        self.kind == ObjectKind::Schema && BUILTIN_SCHEMAS.contains(&self.name.as_str())
    }
}

/// Quote an identifier unless it is a plain lowercase name.
pub fn quote_ident(ident: &str) -> String {
    let plain = !ident.is_empty()
        && ident
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// `schema.name` with both parts quoted as needed.
pub fn qualify(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "orders");
        assert_eq!(quote_ident("Orders"), "\"Orders\"");
        assert_eq!(quote_ident("my table"), "\"my table\"");
        assert_eq!(quote_ident("1abc"), "\"1abc\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_kind_phase_classification() {
        assert_eq!(ObjectKind::Table.metadata_phase(), Phase::PreData);
        assert_eq!(ObjectKind::Function.metadata_phase(), Phase::PreData);
        assert_eq!(ObjectKind::Index.metadata_phase(), Phase::PostData);
        assert_eq!(ObjectKind::Constraint.metadata_phase(), Phase::PostData);
        assert!(ObjectKind::MaterializedView.is_relation());
        assert!(!ObjectKind::Schema.is_relation());
    }

    #[test]
    fn test_public_schema_is_builtin() {
        let public = CatalogObject::new(2200, ObjectKind::Schema, "", "public", "CREATE SCHEMA public");
        let sales = CatalogObject::new(16384, ObjectKind::Schema, "", "sales", "CREATE SCHEMA sales");
        let table = CatalogObject::new(16385, ObjectKind::Table, "public", "public", "");
        assert!(public.is_builtin());
        assert!(!sales.is_builtin());
        assert!(!table.is_builtin());
    }

    #[test]
    fn test_dependencies_exclude_self_and_duplicates() {
        let obj = CatalogObject::new(5, ObjectKind::View, "s", "v", "CREATE VIEW s.v AS SELECT 1")
            .with_dependency(3)
            .with_dependency(5)
            .with_dependency(3)
            .with_dependency(1);
        assert_eq!(obj.dependencies(), vec![1, 3]);
        assert_eq!(obj.create_statement(), "CREATE VIEW s.v AS SELECT 1;");
    }
}
