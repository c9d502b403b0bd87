//! Experiment records.
//!
//! Each experiment directory holds an `experiment.json` describing the jobs
//! that were prepared and the Slurm ids they were given. Writes hold an
//! exclusive lock so a concurrent `status` never sees a torn file.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

pub const RECORD_FILE: &str = "experiment.json";

/// Status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Job files written, nothing submitted yet.
    Prepared,
    /// Every job was accepted by the scheduler.
    Submitted,
    /// The experiment scope ended before submission completed.
    Aborted,
}

/// One job of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub name: String,
    pub script: PathBuf,
    pub task_file: PathBuf,
    pub slurm_job_id: Option<String>,
    pub dependency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub name: String,
    pub id: String,
    pub status: ExperimentStatus,
    pub jobs: Vec<JobRecord>,
    pub created_at: String,
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl ExperimentRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            status: ExperimentStatus::Prepared,
            jobs: Vec::new(),
            created_at: now_timestamp(),
            submitted_at: None,
            errors: Vec::new(),
            version: default_version(),
        }
    }
}

/// Reads and writes one experiment's record with file locking.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pub path: PathBuf,
}

impl RecordStore {
    /// Store for the record inside `experiment_dir`.
    #[must_use]
    pub fn new(experiment_dir: impl AsRef<Path>) -> Self {
        Self {
            path: experiment_dir.as_ref().join(RECORD_FILE),
        }
    }

    pub fn load(&self) -> Result<ExperimentRecord, RecordError> {
        let file = File::open(&self.path).map_err(|e| RecordError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| RecordError::Lock(self.path.clone(), e))?;

        let reader = BufReader::new(&file);
        let record = serde_json::from_reader(reader)
            .map_err(|e| RecordError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| RecordError::Lock(self.path.clone(), e))?;
        Ok(record)
    }

    pub fn save(&self, record: &ExperimentRecord) -> Result<(), RecordError> {
        self.update_with(Some(record.clone()), |_| {})
    }

    /// Update the record under an exclusive lock.
    pub fn update<F>(&self, f: F) -> Result<(), RecordError>
    where
        F: FnOnce(&mut ExperimentRecord),
    {
        self.update_with(None, f)
    }

    fn update_with<F>(&self, initial: Option<ExperimentRecord>, f: F) -> Result<(), RecordError>
    where
        F: FnOnce(&mut ExperimentRecord),
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RecordError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| RecordError::Io(self.path.clone(), e))?;

        file.lock_exclusive()
            .map_err(|e| RecordError::Lock(self.path.clone(), e))?;

        let mut record = match initial {
            Some(record) => record,
            None => {
                let reader = BufReader::new(&file);
                serde_json::from_reader(reader)
                    .map_err(|e| RecordError::Parse(self.path.clone(), e.to_string()))?
            }
        };

        f(&mut record);

        file.set_len(0)
            .map_err(|e| RecordError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| RecordError::Io(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, &record)
            .map_err(|e| RecordError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| RecordError::Lock(self.path.clone(), e))?;
        Ok(())
    }

    /// Records of every run of experiment `name` under `log_dir`, oldest first.
    pub fn list(log_dir: &Path, name: &str) -> Result<Vec<ExperimentRecord>, RecordError> {
        let root = experiments_root(log_dir).join(name);
        if !root.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&root).map_err(|e| RecordError::Io(root.clone(), e))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecordError::Io(root.clone(), e))?;
            let store = Self::new(entry.path());
            if store.path.is_file() {
                records.push(store.load()?);
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// `<log_dir>/experiments`.
#[must_use]
pub fn experiments_root(log_dir: &Path) -> PathBuf {
    log_dir.join("experiments")
}

/// Sortable local timestamp.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with experiment records.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("failed to read/write record {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock record {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse record {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write record {0}: {1}")]
    Write(PathBuf, String),
}
