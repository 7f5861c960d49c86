//! Postgres relation (table schema) tracking and the affected-shape
//! predicate used to react to upstream schema drift.

use serde::{Deserialize, Serialize};

use crate::shape::{Column, Shape, TableRef};

/// Postgres-level table schema, identified by a stable relation OID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
}

impl Relation {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.schema.clone(), self.table.clone())
    }
}

/// A relation message that changed an already-known relation's schema.
pub struct RelationChange<'a> {
    pub old: &'a Relation,
    pub new: &'a Relation,
}

impl<'a> RelationChange<'a> {
    pub fn new(old: &'a Relation, new: &'a Relation) -> Self {
        Self { old, new }
    }

    /// Columns dropped, renamed, or retyped between `old` and `new`.
    fn changed_columns(&self) -> impl Iterator<Item = &str> {
        let new_by_name = |name: &str| self.new.columns.iter().find(|c| c.name == name);
        self.old.columns.iter().filter_map(move |old_col| match new_by_name(&old_col.name) {
            Some(new_col) if new_col.type_oid == old_col.type_oid => None,
            _ => Some(old_col.name.as_str()),
        })
    }
}

/// A shape `S` is affected by a [`RelationChange`] iff:
/// - `S.root_table == old.{schema,table}`, or
/// - `S.root_table == new.{schema,table}` (captures renames), or
/// - `S` references a column that changed type, was dropped, or was renamed.
///
/// Conservative by design: over-approximating is acceptable, missing a true
/// positive is not.
pub fn affected_by_change(shape: &Shape, change: &RelationChange<'_>) -> bool {
    shape.references_table(&change.old.table_ref())
        || shape.references_table(&change.new.table_ref())
        || change.changed_columns().any(|col| shape.references_column(col))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Column;

    fn relation(id: u32, schema: &str, table: &str, columns: &[(&str, u32)]) -> Relation {
        Relation {
            id,
            schema: schema.into(),
            table: table.into(),
            columns: columns
                .iter()
                .map(|(name, oid)| Column {
                    name: (*name).into(),
                    type_oid: *oid,
                })
                .collect(),
        }
    }

    fn shape_on(schema: &str, table: &str, where_clause: Option<&str>) -> Shape {
        Shape::new(
            TableRef::new(schema, table),
            where_clause.map(String::from),
            vec![Column {
                name: "id".into(),
                type_oid: 23,
            }],
            vec!["id".into()],
        )
    }

    #[test]
    fn rename_affects_shapes_on_old_and_new_name() {
        let old = relation(1, "public", "test_table", &[("id", 23)]);
        let new = relation(1, "public", "renamed_test_table", &[("id", 23)]);
        let change = RelationChange::new(&old, &new);

        let s1 = shape_on("public", "test_table", None);
        let s2 = shape_on("public", "test_table", Some("id>5"));
        let s3 = shape_on("public", "other_table", None);

        assert!(affected_by_change(&s1, &change));
        assert!(affected_by_change(&s2, &change));
        assert!(!affected_by_change(&s3, &change));
    }

    #[test]
    fn column_type_change_affects_referencing_shapes() {
        let old = relation(1, "public", "items", &[("id", 23), ("price", 700)]);
        let new = relation(1, "public", "items", &[("id", 23), ("price", 1700)]);
        let change = RelationChange::new(&old, &new);

        let mut affected = shape_on("public", "items", None);
        affected.projection.push(Column {
            name: "price".into(),
            type_oid: 700,
        });
        assert!(affected_by_change(&affected, &change));

        let other_table = shape_on("public", "other", None);
        assert!(!affected_by_change(&other_table, &change));
    }

    #[test]
    fn column_drop_affects_shapes_referencing_it() {
        let old = relation(1, "public", "items", &[("id", 23), ("legacy", 23)]);
        let new = relation(1, "public", "items", &[("id", 23)]);
        let change = RelationChange::new(&old, &new);

        let mut affected = shape_on("public", "other", None);
        affected.projection.push(Column {
            name: "legacy".into(),
            type_oid: 23,
        });
        assert!(affected_by_change(&affected, &change));
    }
}
