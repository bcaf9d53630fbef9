//! Durable, resumable state persistence.
//!
//! Checkpoints are JSON envelopes keyed by `(run_id, slot)`, where the slot
//! is an attempt id or `coordinator`. Concurrent attempts write disjoint
//! files, so the only shared resource is the directory itself.
//!
//! # Guarantees
//!
//! - Writes are atomic: an exclusive lock is taken, the envelope is written
//!   to a temporary file, synced and renamed over the previous checkpoint.
//! - A checkpoint that cannot be read, parsed, or that belongs to another
//!   key or schema version is reported as not found after a warning. The
//!   file is kept aside as `<slot>.json.corrupt` for inspection; missing
//!   state is never guessed.
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::checkpoint::CheckpointStore;
//!
//! let store = CheckpointStore::new(".converge/runs");
//! let id = store.save(&iteration_state)?;
//! let restored = store.load_attempt(&run_id, &attempt_id)?;
//! ```

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConvergeError, Result};
use crate::state::{AttemptId, CoordinatorState, IterationState, RunId, STATE_VERSION};

/// Directory under each run holding checkpoint files.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Slot name of the coordinator checkpoint.
pub const COORDINATOR_SLOT: &str = "coordinator";

const TMP_SUFFIX: &str = ".tmp";
const LOCK_SUFFIX: &str = ".lock";
const CORRUPT_SUFFIX: &str = ".corrupt";

// ============================================================================
// Checkpoint ID
// ============================================================================

/// Unique identifier for a saved checkpoint.
///
/// Wraps a UUID v4 string for type safety and serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Create a new random checkpoint ID.
    ///
    /// # Example
    ///
    /// ```
    /// use converge::checkpoint::CheckpointId;
    ///
    /// let id = CheckpointId::new();
    /// assert!(!id.as_str().is_empty());
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Checkpointable State
// ============================================================================

/// State that can be stored in the checkpoint store.
pub trait Checkpoint: Serialize + DeserializeOwned {
    /// Kind tag written into the envelope.
    const KIND: &'static str;

    /// Run the state belongs to.
    fn run_id(&self) -> &RunId;

    /// Slot within the run (file stem).
    fn slot(&self) -> String;

    /// Whether the state's schema version can be resumed.
    fn is_version_compatible(&self) -> bool;
}

impl Checkpoint for IterationState {
    const KIND: &'static str = "iteration";

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn slot(&self) -> String {
        self.attempt_id.to_string()
    }

    fn is_version_compatible(&self) -> bool {
        IterationState::is_version_compatible(self)
    }
}

impl Checkpoint for CoordinatorState {
    const KIND: &'static str = "coordinator";

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn slot(&self) -> String {
        COORDINATOR_SLOT.to_string()
    }

    fn is_version_compatible(&self) -> bool {
        CoordinatorState::is_version_compatible(self)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<S> {
    version: u32,
    kind: String,
    checkpoint_id: CheckpointId,
    saved_at: DateTime<Utc>,
    state: S,
}

// ============================================================================
// Store
// ============================================================================

/// File-based checkpoint store rooted at the artifacts directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory holding the checkpoints of one run.
    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str()).join(CHECKPOINT_DIR)
    }

    /// Path of a checkpoint file.
    #[must_use]
    pub fn path_for(&self, run_id: &RunId, slot: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{slot}.json"))
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Persist `state` atomically and return the new checkpoint's id.
    pub fn save<S: Checkpoint>(&self, state: &S) -> Result<CheckpointId> {
        let path = self.path_for(state.run_id(), &state.slot());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = File::create(Self::sibling(&path, LOCK_SUFFIX))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| ConvergeError::checkpoint(format!("failed to acquire lock: {e}")))?;

        let envelope = Envelope {
            version: STATE_VERSION,
            kind: S::KIND.to_string(),
            checkpoint_id: CheckpointId::new(),
            saved_at: Utc::now(),
            state,
        };
        let json = serde_json::to_string_pretty(&envelope)?;

        let tmp_path = Self::sibling(&path, TMP_SUFFIX);
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        debug!(
            kind = S::KIND,
            slot = %state.slot(),
            checkpoint = %envelope.checkpoint_id,
            "Checkpoint saved"
        );
        Ok(envelope.checkpoint_id)
    }

    /// Load the checkpoint in `slot`, or `None` if there is no usable one.
    pub fn load<S: Checkpoint>(&self, run_id: &RunId, slot: &str) -> Result<Option<S>> {
        let path = self.path_for(run_id, slot);
        if !path.exists() {
            return Ok(None);
        }

        let lock_path = Self::sibling(&path, LOCK_SUFFIX);
        let _lock = if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file)
                .map_err(|e| ConvergeError::checkpoint(format!("failed to acquire lock: {e}")))?;
            Some(lock_file)
        } else {
            None
        };

        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Unreadable checkpoint at {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        let envelope: Envelope<S> = match serde_json::from_str(&contents) {
            Ok(env) => env,
            Err(e) => {
                warn!(
                    "Corrupted checkpoint at {}: {}. Restarting from baseline.",
                    path.display(),
                    e
                );
                Self::set_aside(&path);
                return Ok(None);
            }
        };

        if envelope.kind != S::KIND
            || envelope.state.run_id() != run_id
            || envelope.state.slot() != slot
        {
            warn!(
                "Checkpoint at {} belongs to {} {}/{}, not {}/{}. Ignoring.",
                path.display(),
                envelope.kind,
                envelope.state.run_id(),
                envelope.state.slot(),
                run_id,
                slot
            );
            Self::set_aside(&path);
            return Ok(None);
        }

        if envelope.version != STATE_VERSION || !envelope.state.is_version_compatible() {
            warn!(
                "Incompatible checkpoint version {} at {} (supported: {}). Starting fresh.",
                envelope.version,
                path.display(),
                STATE_VERSION
            );
            Self::set_aside(&path);
            return Ok(None);
        }

        Ok(Some(envelope.state))
    }

    /// Load an attempt's iteration state.
    pub fn load_attempt(
        &self,
        run_id: &RunId,
        attempt_id: &AttemptId,
    ) -> Result<Option<IterationState>> {
        self.load(run_id, attempt_id.as_str())
    }

    /// Load the coordinator state of a run.
    pub fn load_coordinator(&self, run_id: &RunId) -> Result<Option<CoordinatorState>> {
        self.load(run_id, COORDINATOR_SLOT)
    }

    /// Whether a checkpoint exists in `slot`.
    #[must_use]
    pub fn exists(&self, run_id: &RunId, slot: &str) -> bool {
        self.path_for(run_id, slot).exists()
    }

    fn set_aside(path: &Path) {
        let target = Self::sibling(path, CORRUPT_SUFFIX);
        if let Err(e) = fs::rename(path, &target) {
            warn!("Failed to set aside {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryEntry;
    use crate::state::{AttemptConfig, Feedback, TaskSpec};
    use tempfile::TempDir;

    fn test_store() -> (CheckpointStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = CheckpointStore::new(temp_dir.path());
        (store, temp_dir)
    }

    fn iteration_state(run: &str, attempt: usize) -> IterationState {
        let config = AttemptConfig {
            attempt_id: AttemptId::from_index(attempt),
            baseline: "empty".into(),
            strategy: "direct".into(),
            max_iterations: 10,
            threshold: 0.9,
            stagnation_window: 3,
            stagnation_epsilon: 0.02,
            max_fast_retries: 3,
            history_window: 5,
        };
        let mut state = IterationState::new(RunId::from_string(run), TaskSpec::new("t"), config);
        state.iteration = 3;
        state.last_feedback = Some(Feedback {
            score: 0.5,
            issues: vec!["x".into()],
            suggestions: vec![],
            complete: false,
        });
        state.history.push(HistoryEntry::new(1, "p", 0.5, &[]));
        state
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (store, _dir) = test_store();
        let state = iteration_state("run-1", 1);

        let id = store.save(&state).expect("save should succeed");
        assert!(!id.as_str().is_empty());

        let loaded = store
            .load_attempt(&state.run_id, &state.attempt_id)
            .expect("load should succeed")
            .expect("checkpoint should exist");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_scores_restore_bit_for_bit() {
        let (store, _dir) = test_store();
        let mut state = iteration_state("run-1", 1);
        // Deterministic spread of long-mantissa values in [0, 1)
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        for i in 0..200u32 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let score = (x >> 11) as f64 / (1u64 << 53) as f64;
            state.history.push(HistoryEntry::new(i + 2, "p", score, &[]));
            state.last_feedback = Some(Feedback {
                score,
                issues: vec![],
                suggestions: vec![],
                complete: false,
            });

            store.save(&state).unwrap();
            let loaded: IterationState = store
                .load_attempt(&state.run_id, &state.attempt_id)
                .unwrap()
                .unwrap();
            assert_eq!(loaded, state, "score {score:?} changed on reload");
        }
    }

    #[test]
    fn test_each_save_gets_new_id() {
        let (store, _dir) = test_store();
        let state = iteration_state("run-1", 1);
        let a = store.save(&state).unwrap();
        let b = store.save(&state).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let (store, _dir) = test_store();
        let loaded = store
            .load_attempt(&RunId::from_string("run-x"), &AttemptId::from_index(1))
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_no_tmp_file_after_save() {
        let (store, _dir) = test_store();
        let state = iteration_state("run-1", 2);
        store.save(&state).unwrap();
        let path = store.path_for(&state.run_id, "attempt-02");
        assert!(path.exists());
        assert!(!CheckpointStore::sibling(&path, TMP_SUFFIX).exists());
    }

    #[test]
    fn test_corrupt_checkpoint_is_set_aside() {
        let (store, _dir) = test_store();
        let state = iteration_state("run-1", 1);
        store.save(&state).unwrap();
        let path = store.path_for(&state.run_id, state.attempt_id.as_str());
        fs::write(&path, "{ not json").unwrap();

        let loaded = store.load_attempt(&state.run_id, &state.attempt_id).unwrap();
        assert!(loaded.is_none());
        assert!(!path.exists());
        assert!(CheckpointStore::sibling(&path, CORRUPT_SUFFIX).exists());
    }

    #[test]
    fn test_checkpoint_for_other_key_is_ignored() {
        let (store, _dir) = test_store();
        let state = iteration_state("run-1", 1);
        store.save(&state).unwrap();
        // Copy attempt-01's file into attempt-02's slot.
        let src = store.path_for(&state.run_id, "attempt-01");
        let dst = store.path_for(&state.run_id, "attempt-02");
        fs::copy(&src, &dst).unwrap();

        let loaded = store
            .load_attempt(&state.run_id, &AttemptId::from_index(2))
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_incompatible_version_is_ignored() {
        let (store, _dir) = test_store();
        let mut state = iteration_state("run-1", 1);
        state.version = STATE_VERSION + 1;
        store.save(&state).unwrap();
        let loaded = store.load_attempt(&state.run_id, &state.attempt_id).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_attempts_do_not_collide() {
        let (store, _dir) = test_store();
        let a = iteration_state("run-1", 1);
        let mut b = iteration_state("run-1", 2);
        b.iteration = 7;
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        let la = store.load_attempt(&a.run_id, &a.attempt_id).unwrap().unwrap();
        let lb = store.load_attempt(&b.run_id, &b.attempt_id).unwrap().unwrap();
        assert_eq!(la.iteration, 3);
        assert_eq!(lb.iteration, 7);
    }

    #[test]
    fn test_coordinator_roundtrip() {
        let (store, _dir) = test_store();
        let state = CoordinatorState::new(
            RunId::from_string("run-9"),
            TaskSpec::new("t"),
            2,
            vec![iteration_state("run-9", 1).config],
        );
        store.save(&state).unwrap();
        let loaded = store.load_coordinator(&state.run_id).unwrap().unwrap();
        assert_eq!(loaded, state);
    }
}
