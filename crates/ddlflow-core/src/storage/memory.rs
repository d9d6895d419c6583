//! In-memory schema storage.
//!
//! Committed state is an ordered map guarded by a read-write lock.
//! Transactions read committed state, buffer their writes and apply them
//! under the write lock on commit. Every access is checked against the spans
//! the transaction declared.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::keys::{self, SHARD_COUNT};
use super::{ScopeKind, SchemaStorage, Span, SpanSet, StorageError, TransactionScope};
use crate::element::{DescId, IndexId};
use crate::opgen::{Operation, SubObject};

/// What an injected fault does to a matching operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fail with [`StorageError::Transient`].
    Transient,
    /// Fail with [`StorageError::Timeout`].
    Timeout,
    /// Fail with [`StorageError::Violation`].
    Violation,
    /// Fail with [`StorageError::Fatal`].
    Fatal,
    /// Sleep, then run normally.
    Stall(Duration),
}

/// A fault armed against operations matching a filter.
#[derive(Debug, Clone)]
pub struct Fault {
    op: &'static str,
    desc_id: Option<DescId>,
    shard: Option<u16>,
    kind: FaultKind,
    remaining: Option<u32>,
}

impl Fault {
    /// Fire on every operation named `op` (see [`Operation::name`]).
    pub fn on(op: &'static str, kind: FaultKind) -> Self {
        Self {
            op,
            desc_id: None,
            shard: None,
            kind,
            remaining: None,
        }
    }

    /// Fire only `n` times.
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    /// Only match operations on this descriptor.
    pub fn in_descriptor(mut self, desc_id: DescId) -> Self {
        self.desc_id = Some(desc_id);
        self
    }

    /// Only match data operations whose range covers `shard`.
    pub fn at_shard(mut self, shard: u16) -> Self {
        self.shard = Some(shard);
        self
    }

    fn matches(&self, op: &Operation) -> bool {
        if self.remaining == Some(0) || op.name() != self.op {
            return false;
        }
        if self.desc_id.is_some() && op.desc_id() != self.desc_id {
            return false;
        }
        match self.shard {
            Some(shard) => op.range().is_some_and(|r| r.contains(shard)),
            None => true,
        }
    }
}

/// Counters describing storage activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Committed transactions.
    pub commits: u64,
    /// Aborted transactions.
    pub aborts: u64,
    /// Successfully executed operations by name.
    pub executed: BTreeMap<String, u64>,
}

/// Reference [`SchemaStorage`] keeping everything in memory.
///
/// Data operations move and check index entries for real, but constraint
/// validation only verifies that the operation declared the spans it reads:
/// check expressions and foreign-key references are never evaluated, so a
/// `ValidateConstraint` fails only through an injected fault.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, String>>,
    faults: Mutex<Vec<Fault>>,
    executed: DashMap<&'static str, u64>,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a key directly, outside any transaction.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<String>) {
        self.data.write().insert(key.into(), value.into());
    }

    /// Read a committed key.
    pub fn get(&self, key: &[u8]) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    /// Seed `rows` entries into an index, spread round-robin over shards.
    pub fn seed_rows(&self, table_id: DescId, index_id: IndexId, rows: u64) {
        let mut data = self.data.write();
        for row in 0..rows {
            let shard = (row % SHARD_COUNT as u64) as u8;
            data.insert(
                keys::row_key(table_id, index_id, shard, row),
                format!("row{row}"),
            );
        }
    }

    /// Number of committed keys with the given prefix.
    pub fn count_prefix(&self, prefix: &[u8]) -> usize {
        let span = Span::prefix(prefix.to_vec());
        self.data
            .read()
            .range(span.start..span.end)
            .count()
    }

    /// Copy of all committed state.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, String> {
        self.data.read().clone()
    }

    /// Copy of committed descriptors and data, without the event log.
    pub fn state_snapshot(&self) -> BTreeMap<Vec<u8>, String> {
        let events = keys::event_span();
        self.data
            .read()
            .iter()
            .filter(|(k, _)| !events.contains_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Arm a fault.
    pub fn inject(&self, fault: Fault) {
        debug!(op = fault.op, kind = ?fault.kind, "fault injected");
        self.faults.lock().push(fault);
    }

    /// Disarm every fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Times an operation with this name executed successfully.
    pub fn executed(&self, op: &str) -> u64 {
        self.executed.get(op).map(|c| *c).unwrap_or(0)
    }

    /// Activity counters.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            executed: self
                .executed
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }

    fn check_faults(&self, op: &Operation, clock: &Clock) -> Result<(), StorageError> {
        let kind = {
            let mut faults = self.faults.lock();
            let Some(fault) = faults.iter_mut().find(|f| f.matches(op)) else {
                return Ok(());
            };
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            fault.kind
        };
        debug!(op = %op, kind = ?kind, "fault fired");
        match kind {
            FaultKind::Transient => Err(StorageError::Transient(format!("injected fault in {op}"))),
            FaultKind::Timeout => Err(StorageError::Timeout(Duration::ZERO)),
            FaultKind::Violation => Err(StorageError::Violation(format!("injected fault in {op}"))),
            FaultKind::Fatal => Err(StorageError::Fatal(format!("injected fault in {op}"))),
            FaultKind::Stall(delay) => clock.sleep(delay),
        }
    }
}

impl SchemaStorage for MemoryStorage {
    fn begin(&self, scope: ScopeKind) -> Result<Box<dyn TransactionScope + '_>, StorageError> {
        trace!(?scope, "begin transaction");
        Ok(Box::new(MemoryTransaction {
            storage: self,
            clock: Clock {
                started: Instant::now(),
                deadline: None,
            },
            spans: SpanSet::new(),
            writes: Vec::new(),
            executed: Vec::new(),
        }))
    }
}

enum Write {
    Put(Vec<u8>, String),
    Delete(Vec<u8>),
    DeleteRange(Span),
}

/// Deadline bookkeeping of one transaction.
struct Clock {
    started: Instant,
    deadline: Option<Instant>,
}

impl Clock {
    fn check(&self) -> Result<(), StorageError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(StorageError::Timeout(self.started.elapsed()))
            }
            _ => Ok(()),
        }
    }

    /// Sleep for `delay`, waking early with a timeout at the deadline.
    fn sleep(&self, delay: Duration) -> Result<(), StorageError> {
        let wake = Instant::now() + delay;
        let until = self.deadline.map_or(wake, |deadline| deadline.min(wake));
        std::thread::sleep(until.saturating_duration_since(Instant::now()));
        self.check()
    }
}

struct MemoryTransaction<'a> {
    storage: &'a MemoryStorage,
    clock: Clock,
    spans: SpanSet,
    writes: Vec<Write>,
    executed: Vec<&'static str>,
}

impl MemoryTransaction<'_> {
    fn put(&mut self, key: Vec<u8>, value: impl Into<String>) -> Result<(), StorageError> {
        self.spans.check_write(&key)?;
        self.writes.push(Write::Put(key, value.into()));
        Ok(())
    }

    fn delete(&mut self, key: Vec<u8>) -> Result<(), StorageError> {
        self.spans.check_write(&key)?;
        self.writes.push(Write::Delete(key));
        Ok(())
    }

    fn delete_range(&mut self, span: Span) -> Result<(), StorageError> {
        self.spans.check_write_span(&span)?;
        self.writes.push(Write::DeleteRange(span));
        Ok(())
    }

    fn scan(&self, span: &Span) -> Result<Vec<(Vec<u8>, String)>, StorageError> {
        self.spans.check_read_span(span)?;
        Ok(self
            .storage
            .data
            .read()
            .range(span.start.clone()..span.end.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn state_key(table_id: DescId, object: SubObject) -> Vec<u8> {
        match object {
            SubObject::Column(id) => keys::column_key(table_id, id, "state"),
            SubObject::Index(id) => keys::index_key(table_id, id, "state"),
            SubObject::Constraint(id) => keys::constraint_key(table_id, id, "state"),
        }
    }

    /// Copy every entry of `from` into `into` within the same shards.
    fn copy_index(
        &mut self,
        table_id: DescId,
        from: IndexId,
        into: IndexId,
        range: keys::ShardRange,
    ) -> Result<usize, StorageError> {
        let source_prefix = keys::index_prefix(table_id, from);
        let target_prefix = keys::index_prefix(table_id, into);
        let rows = self.scan(&keys::index_span(table_id, from, range))?;
        let copied = rows.len();
        for (key, value) in rows {
            self.clock.check()?;
            let mut target = target_prefix.clone();
            target.extend_from_slice(&key[source_prefix.len()..]);
            self.put(target, value)?;
        }
        Ok(copied)
    }

    fn apply(&mut self, op: &Operation) -> Result<(), StorageError> {
        match op {
            Operation::CreateDescriptor {
                desc_id,
                kind,
                name,
            } => {
                self.put(
                    keys::descriptor_meta(*desc_id),
                    format!("{} {name}", kind.as_str()),
                )?;
                self.put(keys::descriptor_state(*desc_id), "PUBLIC")
            }
            Operation::MarkDescriptorDropped { desc_id } => {
                self.put(keys::descriptor_state(*desc_id), "DROPPED")
            }
            Operation::DeleteDescriptor { desc_id } => {
                self.delete_range(keys::descriptor_span(*desc_id))
            }
            Operation::AddColumn {
                table_id,
                column_id,
                name,
            } => {
                self.put(keys::column_key(*table_id, *column_id, "name"), name.clone())?;
                self.put(
                    keys::column_key(*table_id, *column_id, "state"),
                    "DELETE_ONLY",
                )
            }
            Operation::SetColumnType {
                table_id,
                column_id,
                sql_type,
                nullable,
            } => {
                let value = if *nullable {
                    sql_type.clone()
                } else {
                    format!("{sql_type} NOT NULL")
                };
                self.put(keys::column_key(*table_id, *column_id, "type"), value)
            }
            Operation::RemoveColumnType {
                table_id,
                column_id,
            } => self.delete(keys::column_key(*table_id, *column_id, "type")),
            Operation::SetColumnDefault {
                table_id,
                column_id,
                expr,
            } => self.put(
                keys::column_key(*table_id, *column_id, "default"),
                expr.clone(),
            ),
            Operation::RemoveColumnDefault {
                table_id,
                column_id,
            } => self.delete(keys::column_key(*table_id, *column_id, "default")),
            Operation::SetColumnComment {
                table_id,
                column_id,
                comment,
            } => self.put(
                keys::column_key(*table_id, *column_id, "comment"),
                comment.clone(),
            ),
            Operation::RemoveColumnComment {
                table_id,
                column_id,
            } => self.delete(keys::column_key(*table_id, *column_id, "comment")),
            Operation::AddIndex {
                table_id,
                index_id,
                key_column_ids,
                unique,
                state,
            } => {
                let columns: Vec<String> = key_column_ids.iter().map(|c| c.to_string()).collect();
                let mut def = format!("({})", columns.join(","));
                if *unique {
                    def.push_str(" UNIQUE");
                }
                self.put(keys::index_key(*table_id, *index_id, "def"), def)?;
                self.put(keys::index_key(*table_id, *index_id, "state"), state.as_str())
            }
            Operation::SetIndexName {
                table_id,
                index_id,
                name,
            } => self.put(keys::index_key(*table_id, *index_id, "name"), name.clone()),
            Operation::RemoveIndexName { table_id, index_id } => {
                self.delete(keys::index_key(*table_id, *index_id, "name"))
            }
            Operation::AddCheckConstraint {
                table_id,
                constraint_id,
                expr,
            } => {
                self.put(
                    keys::constraint_key(*table_id, *constraint_id, "def"),
                    format!("CHECK ({expr})"),
                )?;
                self.put(
                    keys::constraint_key(*table_id, *constraint_id, "state"),
                    "WRITE_ONLY",
                )
            }
            Operation::AddForeignKey {
                table_id,
                constraint_id,
                referenced_table_id,
            } => {
                self.put(
                    keys::constraint_key(*table_id, *constraint_id, "def"),
                    format!("REFERENCES {referenced_table_id}"),
                )?;
                self.put(
                    keys::constraint_key(*table_id, *constraint_id, "state"),
                    "WRITE_ONLY",
                )
            }
            Operation::SetMutationState {
                table_id,
                object,
                state,
            } => self.put(Self::state_key(*table_id, *object), state.as_str()),
            Operation::RemoveColumn {
                table_id,
                column_id,
            } => {
                self.delete(keys::column_key(*table_id, *column_id, "name"))?;
                self.delete(keys::column_key(*table_id, *column_id, "state"))
            }
            Operation::RemoveIndex { table_id, index_id } => {
                self.delete(keys::index_key(*table_id, *index_id, "def"))?;
                self.delete(keys::index_key(*table_id, *index_id, "state"))
            }
            Operation::RemoveConstraint {
                table_id,
                constraint_id,
            } => {
                self.delete(keys::constraint_key(*table_id, *constraint_id, "def"))?;
                self.delete(keys::constraint_key(*table_id, *constraint_id, "state"))
            }
            Operation::UpdateTypeBackReference {
                type_id,
                table_id,
                present,
            } => {
                let key = keys::back_reference(*type_id, *table_id);
                if *present {
                    self.put(key, "1")
                } else {
                    self.delete(key)
                }
            }
            Operation::LogEvent {
                element,
                status,
                statement,
                username,
            } => self.put(
                keys::event_key(element, status.as_str()),
                format!("{username}: {statement}"),
            ),
            Operation::BackfillIndex {
                table_id,
                index_id,
                source_index_id,
                range,
            } => {
                let copied = self.copy_index(*table_id, *source_index_id, *index_id, *range)?;
                trace!(table_id, index_id, %range, copied, "backfilled");
                Ok(())
            }
            Operation::MergeIndex {
                table_id,
                index_id,
                temp_index_id,
                range,
            } => {
                let copied = self.copy_index(*table_id, *temp_index_id, *index_id, *range)?;
                trace!(table_id, index_id, %range, copied, "merged");
                Ok(())
            }
            Operation::ValidateIndex {
                table_id,
                index_id,
                unique,
                range,
            } => {
                let entries = self.scan(&keys::index_span(*table_id, *index_id, *range))?;
                let primary =
                    self.scan(&keys::index_span(*table_id, keys::PRIMARY_INDEX_ID, *range))?;
                if entries.len() < primary.len() {
                    return Err(StorageError::Violation(format!(
                        "index {table_id}.{index_id} has {} entries in shards {range}, expected {}",
                        entries.len(),
                        primary.len()
                    )));
                }
                if *unique {
                    let mut seen: HashMap<&str, &[u8]> = HashMap::new();
                    for (key, value) in &entries {
                        if seen.insert(value.as_str(), key.as_slice()).is_some() {
                            return Err(StorageError::Violation(format!(
                                "duplicate value {value:?} in unique index {table_id}.{index_id}"
                            )));
                        }
                    }
                }
                Ok(())
            }
            Operation::ValidateConstraint {
                table_id,
                referenced_table_id,
                range,
                ..
            } => {
                self.scan(&keys::index_span(*table_id, keys::PRIMARY_INDEX_ID, *range))?;
                if let Some(referenced) = referenced_table_id {
                    self.scan(&keys::index_span(
                        *referenced,
                        keys::PRIMARY_INDEX_ID,
                        keys::ShardRange::FULL,
                    ))?;
                }
                Ok(())
            }
            Operation::ClearIndexData {
                table_id,
                index_id,
                range,
            } => self.delete_range(keys::index_span(*table_id, *index_id, *range)),
            Operation::ClearTableData { table_id } => {
                self.delete_range(keys::table_data_span(*table_id))
            }
        }
    }
}

impl TransactionScope for MemoryTransaction<'_> {
    fn declare(&mut self, access: &super::AccessSet) {
        self.spans.add(access);
    }

    fn set_deadline(&mut self, deadline: Instant) {
        self.clock.deadline = Some(deadline);
    }

    fn execute(&mut self, op: &Operation) -> Result<(), StorageError> {
        self.clock.check()?;
        self.storage.check_faults(op, &self.clock)?;
        self.apply(op)?;
        self.executed.push(op.name());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        {
            let mut data = this.storage.data.write();
            for write in this.writes {
                match write {
                    Write::Put(key, value) => {
                        data.insert(key, value);
                    }
                    Write::Delete(key) => {
                        data.remove(&key);
                    }
                    Write::DeleteRange(span) => {
                        let doomed: Vec<Vec<u8>> = data
                            .range(span.start..span.end)
                            .map(|(k, _)| k.clone())
                            .collect();
                        for key in doomed {
                            data.remove(&key);
                        }
                    }
                }
            }
        }
        for name in this.executed {
            *this.storage.executed.entry(name).or_insert(0) += 1;
        }
        this.storage.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        self.storage.aborts.fetch_add(1, Ordering::Relaxed);
    }
}
