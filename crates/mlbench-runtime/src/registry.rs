//! Run registry: the single source of truth for run state.
//!
//! Runs live in a sharded map of per-run mutexes: operations on one run are
//! serialized, operations on different runs never contend on a shared lock.
//! When opened with a path, every mutation rewrites a JSON snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mlbench_core::{Error, NewRun, Result, Run, RunId};
use parking_lot::Mutex;
use tracing::{info, warn};

pub struct RunRegistry {
    runs: DashMap<RunId, Arc<Mutex<Run>>>,
    snapshot_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl RunRegistry {
    /// A registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            runs: DashMap::new(),
            snapshot_path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a registry backed by the snapshot at `path`, loading it if present.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let runs: Vec<Run> = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("RunRegistry: {} runs loaded from {}", runs.len(), path.display());

        let map = DashMap::new();
        for run in runs {
            map.insert(run.id, Arc::new(Mutex::new(run)));
        }

        Ok(Self {
            runs: map,
            snapshot_path: Some(path.to_path_buf()),
            persist_lock: Mutex::new(()),
        })
    }

    // ---------------------------------------------------------------
    // CRUD
    // ---------------------------------------------------------------

    /// Insert a new `pending` run. Rejects a duplicate explicit id.
    pub fn create(&self, spec: NewRun) -> Result<Run> {
        let run = Run::new(spec, Utc::now())?;
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => return Err(Error::DuplicateRun(run.id.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(run.clone())));
            }
        }
        self.persist();
        Ok(run)
    }

    pub fn get(&self, id: &RunId) -> Result<Run> {
        let cell = self.cell(id)?;
        let run = cell.lock().clone();
        Ok(run)
    }

    /// Point-in-time copy of every run, oldest first.
    pub fn list(&self) -> Vec<Run> {
        let cells: Vec<Arc<Mutex<Run>>> = self.runs.iter().map(|e| e.value().clone()).collect();
        let mut runs: Vec<Run> = cells.iter().map(|c| c.lock().clone()).collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }

    /// Atomic read-modify-write of one run.
    ///
    /// The mutator works on a copy; the copy replaces the stored run only if
    /// the mutator returns `Ok`, so a failed mutation leaves the run unchanged.
    pub fn update<T>(&self, id: &RunId, mutator: impl FnOnce(&mut Run) -> Result<T>) -> Result<T> {
        let cell = self.cell(id)?;
        let (out, changed) = {
            let mut stored = cell.lock();
            let mut draft = stored.clone();
            let out = mutator(&mut draft)?;
            let changed = draft != *stored;
            if changed {
                *stored = draft;
            }
            (out, changed)
        };
        if changed {
            self.persist();
        }
        Ok(out)
    }

    /// Remove a terminal run whose pool has been released.
    pub fn delete(&self, id: &RunId) -> Result<Run> {
        let removed = self.runs.remove_if(id, |_, cell| cell.lock().is_deletable());
        match removed {
            Some((_, cell)) => {
                let run = cell.lock().clone();
                self.persist();
                Ok(run)
            }
            None if self.runs.contains_key(id) => Err(Error::Conflict(format!(
                "run {id} is still active or holds cluster resources"
            ))),
            None => Err(Error::NotFound(format!("run {id}"))),
        }
    }

    /// Runs not yet in a terminal state.
    pub fn count_active(&self) -> usize {
        self.list()
            .iter()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn cell(&self, id: &RunId) -> Result<Arc<Mutex<Run>>> {
        self.runs
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("run {id}")))
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let _guard = self.persist_lock.lock();
        let runs = self.list();
        let data = match serde_json::to_string_pretty(&runs) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to serialize run registry: {}", e);
                return;
            }
        };
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, data).and_then(|_| std::fs::rename(&tmp, path)) {
            warn!("Failed to save run registry to {}: {}", path.display(), e);
        }
    }
}
