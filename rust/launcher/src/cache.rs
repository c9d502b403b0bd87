//! Packed dataset cache validation.
//!
//! The training runtime packs the fine-tuning dataset once per tokenizer and
//! reuses it on later runs. A cache directory is only trusted when its
//! `manifest.json` lists the packed metadata file and every listed file still
//! hashes to the recorded SHA-256.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::recipe::DataModule;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Decides whether a packed dataset cache can be reused.
pub trait PackedCache {
    fn is_valid(&self, hf_model_id: &str, data: &DataModule) -> bool;
}

/// Digest of every file in a packed cache directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// File name → lowercase hex SHA-256.
    pub files: BTreeMap<String, String>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let file = File::open(&path).map_err(|e| ManifestError::Io(path.clone(), e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ManifestError::Parse(path, e.to_string()))
    }

    /// Hash every regular file in `dir` (except the manifest) and write the manifest.
    pub fn seal(dir: &Path) -> Result<Self, ManifestError> {
        let mut files = BTreeMap::new();
        let entries = std::fs::read_dir(dir).map_err(|e| ManifestError::Io(dir.to_path_buf(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ManifestError::Io(dir.to_path_buf(), e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == MANIFEST_FILE || !entry.path().is_file() {
                continue;
            }
            files.insert(name, sha256_file(&entry.path())?);
        }

        let manifest = Self { files };
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ManifestError::Parse(path.clone(), e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| ManifestError::Io(path, e))?;
        Ok(manifest)
    }

    /// Check that `required` is listed and every listed file matches its digest.
    pub fn verify(&self, dir: &Path, required: &str) -> Result<(), ManifestError> {
        if !self.files.contains_key(required) {
            return Err(ManifestError::Unlisted(required.to_string()));
        }
        for (name, expected) in &self.files {
            let actual = sha256_file(&dir.join(name))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ManifestError::Mismatch(name.clone()));
            }
        }
        Ok(())
    }
}

fn sha256_file(path: &Path) -> Result<String, ManifestError> {
    let file = File::open(path).map_err(|e| ManifestError::Io(path.to_path_buf(), e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| ManifestError::Io(path.to_path_buf(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Manifest-checked cache under `<datasets>/<dataset>/packed/<model>`.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    datasets_dir: PathBuf,
}

impl ManifestCache {
    pub fn new(datasets_dir: impl Into<PathBuf>) -> Self {
        Self {
            datasets_dir: datasets_dir.into(),
        }
    }

    /// `$NEMO_DATASETS_CACHE`, falling back to `<nemo_home>/datasets`.
    pub fn from_env(nemo_home: &Path) -> Self {
        let dir = std::env::var_os("NEMO_DATASETS_CACHE")
            .map_or_else(|| nemo_home.join("datasets"), PathBuf::from);
        Self::new(dir)
    }

    /// Directory holding the packed files for a model's tokenizer.
    pub fn packed_dir(&self, hf_model_id: &str, data: &DataModule) -> PathBuf {
        self.datasets_dir
            .join(&data.dataset)
            .join("packed")
            .join(hf_model_id.replace('/', "--"))
    }

    pub fn metadata_file_name(data: &DataModule) -> String {
        format!("{}_metadata.jsonl", data.seq_length)
    }

    pub fn check(&self, hf_model_id: &str, data: &DataModule) -> Result<(), ManifestError> {
        let dir = self.packed_dir(hf_model_id, data);
        Manifest::load(&dir)?.verify(&dir, &Self::metadata_file_name(data))
    }
}

impl PackedCache for ManifestCache {
    fn is_valid(&self, hf_model_id: &str, data: &DataModule) -> bool {
        match self.check(hf_model_id, data) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Packed cache rejected: {e}");
                false
            }
        }
    }
}

/// Errors raised while checking or sealing a packed cache.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, String),
    #[error("manifest does not list {0}")]
    Unlisted(String),
    #[error("digest mismatch for {0}")]
    Mismatch(String),
}
