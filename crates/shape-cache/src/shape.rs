//! Shape definitions, their content-addressed fingerprint, and the opaque
//! handle assigned to them on first sight.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A table column in a shape's projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
}

/// `(schema, name)` identity of a Postgres table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A declarative subset of rows from a Postgres table: a root table, an
/// optional row predicate, a projection, and the primary key columns.
///
/// Two [`Shape`]s are *equivalent* iff these fields are structurally equal;
/// equivalence is what [`Shape::fingerprint`] captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub root_table: TableRef,
    pub where_clause: Option<String>,
    pub projection: Vec<Column>,
    pub pk: Vec<String>,
}

impl Shape {
    pub fn new(root_table: TableRef, where_clause: Option<String>, projection: Vec<Column>, pk: Vec<String>) -> Self {
        Self {
            root_table,
            where_clause,
            projection,
            pk,
        }
    }

    /// Deterministic content hash of this shape's definition. Identical
    /// shapes (by [`PartialEq`]) always produce the same fingerprint, and the
    /// fingerprint is only ever compared for equality, never ordered.
    pub fn fingerprint(&self) -> Fingerprint {
        // `serde_json` field order follows declaration order of the struct, not
        // insertion order of any map, so this serialization is already
        // canonical for a given `Shape` value.
        let canonical =
            serde_json::to_vec(self).expect("Shape contains no non-serializable fields (all owned strings/vecs)");
        Fingerprint(blake3::hash(&canonical))
    }

    /// Whether this shape reads from `table`, in either its current or
    /// its prior identity — used by [`crate::relation::affected_by_change`].
    pub fn references_table(&self, table: &TableRef) -> bool {
        &self.root_table == table
    }

    /// Whether this shape's projection, predicate or primary key references
    /// `column`. Conservative: the predicate is an opaque string, so we treat
    /// it as referencing a column whenever the column's name appears in it
    /// verbatim. Over-approximating here is acceptable; missing a true
    /// positive is not.
    pub fn references_column(&self, column: &str) -> bool {
        self.projection.iter().any(|c| c.name == column)
            || self.pk.iter().any(|c| c == column)
            || self
                .where_clause
                .as_deref()
                .is_some_and(|clause| clause.contains(column))
    }
}

/// Content hash of a [`Shape`]. Used only for deduplication, never persisted
/// as a stable identifier — the [`ShapeHandle`] is what's stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// Opaque, process-lifetime-unique identifier for a shape instance, assigned
/// the first time its fingerprint is seen and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeHandle(String);

impl ShapeHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Construct a handle from an already-generated string, e.g. when
    /// rehydrating from the persistent KV on boot.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for ShapeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShapeHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generates [`ShapeHandle`]s that are unique across restarts and across
/// rapid successive creations within a process.
///
/// Construction: `millis_since_epoch` in hex, followed by a 5-hex-digit
/// per-process counter. Two handles generated within the same millisecond
/// differ because the counter always advances; two handles generated in
/// different milliseconds differ in their timestamp prefix.
pub struct HandleGenerator {
    counter: AtomicU32,
}

impl HandleGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> ShapeHandle {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis();
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
        ShapeHandle(format!("{millis:x}{counter:05x}"))
    }
}

impl Default for HandleGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shape() -> Shape {
        Shape::new(
            TableRef::new("public", "items"),
            None,
            vec![Column {
                name: "id".into(),
                type_oid: 23,
            }],
            vec!["id".into()],
        )
    }

    #[test]
    fn equivalent_shapes_fingerprint_equal() {
        assert_eq!(sample_shape().fingerprint(), sample_shape().fingerprint());
    }

    #[test]
    fn differing_shapes_fingerprint_differently() {
        let mut other = sample_shape();
        other.where_clause = Some("id > 5".into());
        assert_ne!(sample_shape().fingerprint(), other.fingerprint());
    }

    #[test]
    fn handles_generated_rapidly_differ() {
        let gen = HandleGenerator::new();
        let handles: Vec<_> = (0..1000).map(|_| gen.next()).collect();
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(unique.len(), handles.len());
    }

    #[test]
    fn references_column_checks_predicate_too() {
        let mut shape = sample_shape();
        shape.where_clause = Some("status = 'active'".into());
        assert!(shape.references_column("status"));
        assert!(!shape.references_column("unrelated"));
    }
}
