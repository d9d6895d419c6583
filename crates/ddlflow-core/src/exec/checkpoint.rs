//! Execution checkpoints and their persistence.
//!
//! A checkpoint is written after every committed stage and every committed
//! work unit, so a restarted executor can pick up exactly where the previous
//! one stopped.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};

use crate::config::CheckpointStoreConfig;
use crate::element::Status;
use crate::error::Error;

/// Lifecycle of one schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Nothing has run yet.
    Pending,
    /// Forward stages are running.
    Executing,
    /// Stages of the rollback plan are running.
    RollingBack,
    /// Every stage committed.
    Succeeded,
    /// The change was undone.
    RolledBack,
    /// Stopped in a state that needs an operator.
    Failed,
}

impl ExecutionStatus {
    /// Check if no further automatic progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::RolledBack | ExecutionStatus::Failed
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Executing => write!(f, "executing"),
            ExecutionStatus::RollingBack => write!(f, "rolling_back"),
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::RolledBack => write!(f, "rolled_back"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted progress of one plan.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Plan identifier.
    pub plan_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// Next stage to run, in the forward plan or, while rolling back, in the
    /// rollback plan.
    pub stage_index: usize,
    /// Work units of `stage_index` that already committed.
    pub completed_units: Vec<u32>,
    /// Status reached by every model element, in model order.
    pub statuses: Vec<Status>,
    /// Statuses the forward plan had reached when rollback started.
    pub rollback_origin: Option<Vec<Status>>,
    /// Stage that failed, if any.
    pub failed_stage: Option<usize>,
    /// Failure or rollback cause.
    pub error: Option<String>,
    /// When execution started (microseconds since epoch).
    pub started_at: u64,
    /// When the checkpoint was last written (microseconds since epoch).
    pub updated_at: u64,
}

impl Checkpoint {
    /// Fresh checkpoint for a plan that has not started.
    pub fn new(plan_id: impl Into<String>, statuses: Vec<Status>) -> Self {
        let now = current_timestamp();
        Self {
            plan_id: plan_id.into(),
            status: ExecutionStatus::Pending,
            stage_index: 0,
            completed_units: Vec::new(),
            statuses,
            rollback_origin: None,
            failed_stage: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Move to the next stage with the statuses it reached.
    pub fn advance(&mut self, statuses: Vec<Status>) {
        self.stage_index += 1;
        self.completed_units.clear();
        self.statuses = statuses;
        self.touch();
    }

    /// Record a committed work unit.
    pub fn complete_unit(&mut self, ordinal: u32) {
        if !self.completed_units.contains(&ordinal) {
            self.completed_units.push(ordinal);
        }
        self.touch();
    }

    /// Switch to running the rollback plan.
    pub fn start_rollback(&mut self, cause: impl Into<String>) {
        self.rollback_origin = Some(self.statuses.clone());
        self.status = ExecutionStatus::RollingBack;
        self.stage_index = 0;
        self.completed_units.clear();
        self.error = Some(cause.into());
        self.touch();
    }

    /// Stop at a stage that needs an operator.
    pub fn fail(&mut self, stage: usize, cause: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.failed_stage = Some(stage);
        self.error = Some(cause.into());
        self.touch();
    }

    /// Whether this checkpoint is running, or failed while running, the
    /// rollback plan.
    pub fn in_rollback(&self) -> bool {
        self.rollback_origin.is_some()
    }

    /// Refresh the update time.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp();
    }

    /// Serialize the checkpoint to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a checkpoint from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Current time in microseconds since the Unix epoch.
pub(crate) fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Durable home for checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for its plan.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error>;

    /// Load the checkpoint of a plan.
    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, Error>;

    /// Forget a plan's checkpoint.
    fn delete(&self, plan_id: &str) -> Result<(), Error>;
}

/// Checkpoint store backed by a sled tree.
pub struct SledCheckpointStore {
    tree: sled::Tree,
    /// Database opened by the store itself, kept alive alongside the tree.
    _db: Option<sled::Db>,
}

impl SledCheckpointStore {
    /// Tree name for checkpoints.
    pub const TREE_NAME: &'static str = "ddlflow:checkpoint";

    /// Open or create the store inside an existing database.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree, _db: None })
    }

    /// Open a database from configuration and the store inside it.
    pub fn open_with_config(config: &CheckpointStoreConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self {
            tree,
            _db: Some(db),
        })
    }

    /// List all checkpoints.
    pub fn list(&self) -> Result<Vec<Checkpoint>, Error> {
        let mut checkpoints = Vec::new();
        for result in self.tree.scan_prefix(b"checkpoint:") {
            let (_, value) = result?;
            checkpoints.push(Checkpoint::from_bytes(&value)?);
        }
        Ok(checkpoints)
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.tree.flush()?;
        Ok(())
    }

    fn checkpoint_key(plan_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(11 + plan_id.len());
        key.extend_from_slice(b"checkpoint:");
        key.extend_from_slice(plan_id.as_bytes());
        key
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        let key = Self::checkpoint_key(&checkpoint.plan_id);
        self.tree.insert(key, checkpoint.to_bytes()?)?;
        Ok(())
    }

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, Error> {
        match self.tree.get(Self::checkpoint_key(plan_id))? {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, plan_id: &str) -> Result<(), Error> {
        self.tree.remove(Self::checkpoint_key(plan_id))?;
        Ok(())
    }
}

/// Checkpoint store kept in memory. Checkpoints are stored encoded, so a
/// value round-trips exactly as it would through [`SledCheckpointStore`].
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.lock().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.lock().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        let bytes = checkpoint.to_bytes()?;
        self.checkpoints
            .lock()
            .insert(checkpoint.plan_id.clone(), bytes);
        Ok(())
    }

    fn load(&self, plan_id: &str) -> Result<Option<Checkpoint>, Error> {
        match self.checkpoints.lock().get(plan_id) {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, plan_id: &str) -> Result<(), Error> {
        self.checkpoints.lock().remove(plan_id);
        Ok(())
    }
}
