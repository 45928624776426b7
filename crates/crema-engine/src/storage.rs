//! Run persistence: an append-only trial log plus periodic checkpoints.
//!
//! On disk a run lives in `<root>/<run_id>/`:
//! - `trials.jsonl`: one [`LogEntry`] per line, appended as trials complete
//! - `checkpoint.json`: the latest [`Checkpoint`], replaced atomically

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crema_types::{
    config_error, validation_error, CremaError, CremaResult, Reward, TasteEvaluation, Trial,
};

use crate::state::OptimizationState;

/// Format version written into every checkpoint.
pub const CHECKPOINT_VERSION: u32 = 1;

const LOG_FILE: &str = "trials.jsonl";
const CHECKPOINT_FILE: &str = "checkpoint.json";

/// One line of the trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Trial(Trial),
    TasteAmended {
        index: u64,
        taste: TasteEvaluation,
        reward: Reward,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub written_at: DateTime<Utc>,
    pub state: OptimizationState,
}

impl Checkpoint {
    pub fn new(state: OptimizationState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            written_at: Utc::now(),
            state,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }
}

/// What a store knows about a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredRun {
    pub checkpoint: Option<Checkpoint>,
    /// Every log entry in write order, including those already folded into
    /// the checkpoint.
    pub entries: Vec<LogEntry>,
}

/// Durable storage for runs.
pub trait RunStore: Send {
    fn append(&mut self, run_id: &str, entry: &LogEntry) -> CremaResult<()>;

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> CremaResult<()>;

    /// `None` when the store has never seen `run_id`.
    fn load(&self, run_id: &str) -> CremaResult<Option<RecoveredRun>>;

    fn list_runs(&self) -> CremaResult<Vec<String>>;
}

fn persistence(context: &str, err: impl std::fmt::Display) -> CremaError {
    CremaError::Persistence {
        message: format!("{context}: {err}"),
    }
}

fn check_version(checkpoint: &Checkpoint) -> CremaResult<()> {
    if checkpoint.version > CHECKPOINT_VERSION {
        return Err(CremaError::Persistence {
            message: format!(
                "checkpoint version {} is newer than supported version {CHECKPOINT_VERSION}",
                checkpoint.version
            ),
        });
    }
    Ok(())
}

/// JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    pub fn new<P: AsRef<Path>>(root: P) -> CremaResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| persistence(&format!("creating {}", root.display()), e))?;
        Ok(Self { root })
    }

    /// `<platform data dir>/crema`.
    pub fn default_location() -> CremaResult<Self> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| config_error!("no data directory on this platform"))?;
        Self::new(data_dir.join("crema"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> CremaResult<PathBuf> {
        if run_id.is_empty()
            || run_id.contains(['/', '\\'])
            || run_id == "."
            || run_id == ".."
        {
            return Err(validation_error!("invalid run id {run_id:?}"));
        }
        Ok(self.root.join(run_id))
    }

    fn ensure_run_dir(&self, run_id: &str) -> CremaResult<PathBuf> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir)
            .map_err(|e| persistence(&format!("creating {}", dir.display()), e))?;
        Ok(dir)
    }

    fn read_log(path: &Path) -> CremaResult<Vec<LogEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| persistence(&format!("reading {}", path.display()), e))?;
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A crash mid-append can leave a torn final line
                Err(e) if i + 1 == lines.len() => {
                    warn!(path = %path.display(), error = %e, "ignoring torn final log line");
                }
                Err(e) => {
                    return Err(persistence(
                        &format!("{} line {}", path.display(), i + 1),
                        e,
                    ))
                }
            }
        }
        Ok(entries)
    }
}

impl RunStore for FileRunStore {
    fn append(&mut self, run_id: &str, entry: &LogEntry) -> CremaResult<()> {
        let path = self.ensure_run_dir(run_id)?.join(LOG_FILE);
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| persistence(&format!("opening {}", path.display()), e))?;
        writeln!(file, "{line}")
            .and_then(|_| file.sync_data())
            .map_err(|e| persistence(&format!("appending to {}", path.display()), e))?;
        Ok(())
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> CremaResult<()> {
        let dir = self.ensure_run_dir(checkpoint.run_id())?;
        let path = dir.join(CHECKPOINT_FILE);
        let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(checkpoint)?;
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| persistence(&format!("creating {}", tmp.display()), e))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| persistence(&format!("writing {}", tmp.display()), e))?;
        }
        fs::rename(&tmp, &path)
            .map_err(|e| persistence(&format!("replacing {}", path.display()), e))?;
        debug!(
            run_id = checkpoint.run_id(),
            trials = checkpoint.state.history.len(),
            "checkpoint written"
        );
        Ok(())
    }

    fn load(&self, run_id: &str) -> CremaResult<Option<RecoveredRun>> {
        let dir = self.run_dir(run_id)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let checkpoint_path = dir.join(CHECKPOINT_FILE);
        let checkpoint = if checkpoint_path.exists() {
            let text = fs::read_to_string(&checkpoint_path)
                .map_err(|e| persistence(&format!("reading {}", checkpoint_path.display()), e))?;
            let checkpoint: Checkpoint = serde_json::from_str(&text)
                .map_err(|e| persistence(&format!("parsing {}", checkpoint_path.display()), e))?;
            check_version(&checkpoint)?;
            Some(checkpoint)
        } else {
            None
        };
        let entries = Self::read_log(&dir.join(LOG_FILE))?;
        Ok(Some(RecoveredRun {
            checkpoint,
            entries,
        }))
    }

    fn list_runs(&self) -> CremaResult<Vec<String>> {
        let mut runs = Vec::new();
        let dir = fs::read_dir(&self.root)
            .map_err(|e| persistence(&format!("listing {}", self.root.display()), e))?;
        for entry in dir {
            let entry = entry.map_err(|e| persistence("listing runs", e))?;
            if entry.path().is_dir() {
                runs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[derive(Debug, Default)]
struct MemoryRun {
    entries: Vec<LogEntry>,
    checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    runs: BTreeMap<String, MemoryRun>,
    /// Writes allowed before every further write fails.
    writes_left: Option<usize>,
}

impl MemoryInner {
    fn take_write(&mut self) -> CremaResult<()> {
        match &mut self.writes_left {
            Some(0) => Err(CremaError::Persistence {
                message: "store is out of space".into(),
            }),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// In-memory store. Clones share the same underlying runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes start failing after `writes` successful ones.
    pub fn failing_after(writes: usize) -> Self {
        let store = Self::default();
        store.inner.lock().writes_left = Some(writes);
        store
    }

    pub fn entries(&self, run_id: &str) -> Vec<LogEntry> {
        self.inner
            .lock()
            .runs
            .get(run_id)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }

    pub fn checkpoint(&self, run_id: &str) -> Option<Checkpoint> {
        self.inner
            .lock()
            .runs
            .get(run_id)
            .and_then(|r| r.checkpoint.clone())
    }
}

impl RunStore for MemoryRunStore {
    fn append(&mut self, run_id: &str, entry: &LogEntry) -> CremaResult<()> {
        let mut inner = self.inner.lock();
        inner.take_write()?;
        inner
            .runs
            .entry(run_id.to_string())
            .or_default()
            .entries
            .push(entry.clone());
        Ok(())
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> CremaResult<()> {
        let mut inner = self.inner.lock();
        inner.take_write()?;
        inner
            .runs
            .entry(checkpoint.run_id().to_string())
            .or_default()
            .checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> CremaResult<Option<RecoveredRun>> {
        let inner = self.inner.lock();
        let Some(run) = inner.runs.get(run_id) else {
            return Ok(None);
        };
        if let Some(checkpoint) = &run.checkpoint {
            check_version(checkpoint)?;
        }
        Ok(Some(RecoveredRun {
            checkpoint: run.checkpoint.clone(),
            entries: run.entries.clone(),
        }))
    }

    fn list_runs(&self) -> CremaResult<Vec<String>> {
        Ok(self.inner.lock().runs.keys().cloned().collect())
    }
}

/// Owns the store for the duration of a run and guarantees the most recent
/// checkpoint reaches it, even when the run is dropped mid-flight.
pub struct CheckpointScope<S: RunStore> {
    store: S,
    pending: Option<Checkpoint>,
}

impl<S: RunStore> CheckpointScope<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            pending: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn append(&mut self, run_id: &str, entry: &LogEntry) -> CremaResult<()> {
        self.store.append(run_id, entry)
    }

    /// Remember `checkpoint` without writing it yet.
    pub fn stage(&mut self, checkpoint: Checkpoint) {
        self.pending = Some(checkpoint);
    }

    /// Write `checkpoint` now.
    pub fn commit(&mut self, checkpoint: Checkpoint) -> CremaResult<()> {
        self.pending = Some(checkpoint);
        self.flush()
    }

    pub fn flush(&mut self) -> CremaResult<()> {
        if let Some(checkpoint) = self.pending.take() {
            if let Err(e) = self.store.write_checkpoint(&checkpoint) {
                self.pending = Some(checkpoint);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl<S: RunStore> Drop for CheckpointScope<S> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "failed to flush checkpoint on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crema_optimizer::ParameterSpace;
    use crema_types::{ParameterSet, RunConfig, TrialMeasurement};
    use tempfile::TempDir;

    fn state(run_id: &str) -> OptimizationState {
        OptimizationState::new(run_id, RunConfig::default(), ParameterSpace::espresso_default())
    }

    fn trial(index: u64) -> LogEntry {
        LogEntry::Trial(Trial::measured(
            index,
            ParameterSet::new().with_scalar("dose", 18.0),
            TrialMeasurement::new(28.0, 36.0),
            Reward::provisional(0.4),
        ))
    }

    #[test]
    fn file_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = FileRunStore::new(temp_dir.path()).unwrap();
        assert!(store.load("run-a").unwrap().is_none());

        store.append("run-a", &trial(0)).unwrap();
        store.append("run-a", &trial(1)).unwrap();
        store.write_checkpoint(&Checkpoint::new(state("run-a"))).unwrap();

        let recovered = store.load("run-a").unwrap().unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert!(matches!(&recovered.entries[1], LogEntry::Trial(t) if t.index == 1));
        let checkpoint = recovered.checkpoint.unwrap();
        assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
        assert_eq!(checkpoint.run_id(), "run-a");

        // No temp file left behind
        let dir = store.run_dir("run-a").unwrap();
        assert!(dir.join("checkpoint.json").exists());
        assert!(!dir.join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn torn_final_line_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = FileRunStore::new(temp_dir.path()).unwrap();
        store.append("run-b", &trial(0)).unwrap();
        let log = store.run_dir("run-b").unwrap().join("trials.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, "{{\"type\":\"trial\",\"index\":").unwrap();

        let recovered = store.load("run-b").unwrap().unwrap();
        assert_eq!(recovered.entries.len(), 1);
        assert!(recovered.checkpoint.is_none());
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = FileRunStore::new(temp_dir.path()).unwrap();
        store.append("run-c", &trial(0)).unwrap();
        let log = store.run_dir("run-c").unwrap().join("trials.jsonl");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "not json").unwrap();
        drop(file);
        store.append("run-c", &trial(1)).unwrap();

        assert!(matches!(
            store.load("run-c"),
            Err(CremaError::Persistence { .. })
        ));
    }

    #[test]
    fn newer_checkpoint_version_is_rejected() {
        let mut store = MemoryRunStore::new();
        let mut checkpoint = Checkpoint::new(state("run-d"));
        checkpoint.version = CHECKPOINT_VERSION + 1;
        store.write_checkpoint(&checkpoint).unwrap();
        assert!(store.load("run-d").is_err());
    }

    #[test]
    fn run_ids_cannot_escape_the_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileRunStore::new(temp_dir.path()).unwrap();
        assert!(store.run_dir("../etc").is_err());
        assert!(store.run_dir("").is_err());
        assert!(store.run_dir("morning-shots").is_ok());
    }

    #[test]
    fn list_runs_is_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = FileRunStore::new(temp_dir.path()).unwrap();
        store.append("zeta", &trial(0)).unwrap();
        store.append("alpha", &trial(0)).unwrap();
        assert_eq!(store.list_runs().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn memory_store_can_fail_on_demand() {
        let mut store = MemoryRunStore::failing_after(1);
        store.append("run-e", &trial(0)).unwrap();
        assert!(matches!(
            store.append("run-e", &trial(1)),
            Err(CremaError::Persistence { .. })
        ));
        assert_eq!(store.entries("run-e").len(), 1);
    }

    #[test]
    fn scope_flushes_pending_checkpoint_on_drop() {
        let store = MemoryRunStore::new();
        {
            let mut scope = CheckpointScope::new(store.clone());
            scope.stage(Checkpoint::new(state("run-f")));
            assert!(scope.has_pending());
            assert!(store.checkpoint("run-f").is_none());
        }
        assert!(store.checkpoint("run-f").is_some());
    }

    #[test]
    fn failed_commit_stays_pending() {
        let store = MemoryRunStore::failing_after(0);
        let mut scope = CheckpointScope::new(store);
        assert!(scope.commit(Checkpoint::new(state("run-g"))).is_err());
        assert!(scope.has_pending());
    }
}
