//! Inbound message types pushed by the (external) Shape Log Collector:
//! `Transaction`s are routed to the affected shapes' Consumers, `Relation`
//! messages are routed to the Shape Cache.

use std::collections::HashSet;

use crate::offset::LogOffset;
use crate::relation::Relation;
use crate::shape::TableRef;
use crate::storage::ChangeKind;

/// A single row-level change within a transaction, already carrying the
/// offset it will occupy in any shape's log that accepts it.
#[derive(Debug, Clone)]
pub struct Change {
    pub relation: TableRef,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
    pub key: serde_json::Value,
    pub log_offset: LogOffset,
}

/// A committed transaction from the logical-replication stream, carrying
/// every change across every relation it touched.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub xid: u32,
    pub lsn: u64,
    pub last_log_offset: LogOffset,
    pub changes: Vec<Change>,
    pub affected_relations: HashSet<TableRef>,
}

/// A relation message, describing the current schema of relation `id`.
pub type RelationMessage = Relation;
