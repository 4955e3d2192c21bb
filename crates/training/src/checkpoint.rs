use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{learner::StateSnapshot, metrics::ValidationSummary, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_DIR: &str = "checkpoint";
pub const BEST_DIR: &str = "best";
pub const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TrainingProgress {
    pub global_step: usize,
    pub optimizer_step: usize,
    pub epoch: usize,
    pub smoothed_loss: Option<f64>,
    pub samples_seen: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub progress: TrainingProgress,
    /// Set on the promoted best record.
    #[serde(default)]
    pub validation: Option<ValidationSummary>,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub snapshot: StateSnapshot,
}

/// The overwritable `checkpoint/` record of a run and its promoted `best/`
/// copy.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    run_root: PathBuf,
    config_sha256: String,
}

impl CheckpointStore {
    pub fn new(run_root: impl Into<PathBuf>, config: &TrainingConfig) -> Result<Self, TrainingError> {
        Ok(Self {
            run_root: run_root.into(),
            config_sha256: fingerprint_config(config)?,
        })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_root.join(CHECKPOINT_DIR)
    }

    pub fn best_dir(&self) -> PathBuf {
        self.run_root.join(BEST_DIR)
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_dir().join(MANIFEST_FILENAME).is_file()
    }

    /// Replaces `checkpoint/` with `snapshot`. The previous record stays in
    /// place until the new one is complete.
    pub fn save(
        &self,
        snapshot: &StateSnapshot,
        progress: TrainingProgress,
    ) -> Result<CheckpointManifest, TrainingError> {
        fs::create_dir_all(&self.run_root).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create run directory {}: {err}",
                self.run_root.display()
            ))
        })?;
        let target = self.checkpoint_dir();
        let staging = self.run_root.join(format!("{CHECKPOINT_DIR}.tmp"));
        reset_dir(&staging)?;

        if snapshot.model.is_empty() {
            return Err(TrainingError::checkpoint(
                "model contains no parameters to checkpoint",
            ));
        }
        let model_path = staging.join(MODEL_FILENAME);
        save_tensors(&snapshot.model, &model_path)?;
        let optimizer_path = staging.join(OPTIMIZER_FILENAME);
        save_tensors(&snapshot.optimizer, &optimizer_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            model: file_record(&model_path)?,
            optimizer: file_record(&optimizer_path)?,
            progress,
            validation: None,
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

        swap_into_place(&staging, &target)?;
        info!(
            step = manifest.progress.global_step,
            dir = %target.display(),
            "checkpoint saved"
        );
        Ok(manifest)
    }

    /// Copies the current `checkpoint/` record to `best/`, tagging it with
    /// the validation result that earned the promotion.
    pub fn promote_best(&self, validation: ValidationSummary) -> Result<(), TrainingError> {
        let source = self.checkpoint_dir();
        let mut manifest = load_manifest(&source)?;
        let staging = self.run_root.join(format!("{BEST_DIR}.tmp"));
        reset_dir(&staging)?;
        for record in [&manifest.model, &manifest.optimizer] {
            let from = source.join(&record.filename);
            let to = staging.join(&record.filename);
            fs::copy(&from, &to).map_err(|err| {
                TrainingError::checkpoint(format!(
                    "failed to copy {} to {}: {err}",
                    from.display(),
                    to.display()
                ))
            })?;
        }
        manifest.validation = Some(validation);
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;
        swap_into_place(&staging, &self.best_dir())?;
        info!(
            step = manifest.progress.global_step,
            auc = ?validation.auc,
            "best checkpoint promoted"
        );
        Ok(())
    }

    /// Validation result recorded with the current `best/` record, if any.
    pub fn best_validation(&self) -> Result<Option<ValidationSummary>, TrainingError> {
        let dir = self.best_dir();
        if !dir.join(MANIFEST_FILENAME).is_file() {
            return Ok(None);
        }
        Ok(load_manifest(&dir)?.validation)
    }

    pub fn load(&self, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
        self.load_dir(&self.checkpoint_dir(), device)
    }

    pub fn load_best(&self, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
        self.load_dir(&self.best_dir(), device)
    }

    pub fn load_dir(&self, directory: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
        let manifest = load_manifest(directory)?;
        ensure_version_supported(manifest.version)?;
        if manifest.config_sha256 != self.config_sha256 {
            warn!(
                dir = %directory.display(),
                "checkpoint was written under a different configuration"
            );
        }

        let model = load_verified(directory, &manifest.model, device)?;
        let optimizer = load_verified(directory, &manifest.optimizer, device)?;
        let snapshot = StateSnapshot {
            model,
            optimizer,
            optimizer_step: manifest.progress.optimizer_step,
        };
        Ok(LoadedCheckpoint { manifest, snapshot })
    }
}

fn load_verified(
    directory: &Path,
    record: &FileRecord,
    device: &Device,
) -> Result<HashMap<String, Tensor>, TrainingError> {
    let path = directory.join(&record.filename);
    validate_file(&path, &record.sha256)?;
    load_safetensors(&path, device).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
    })
}

fn save_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    candle_core::safetensors::save(tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize tensors to {}: {err}",
            path.display()
        ))
    })
}

fn reset_dir(dir: &Path) -> Result<(), TrainingError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|err| {
            TrainingError::checkpoint(format!("failed to remove {}: {err}", dir.display()))
        })?;
    }
    fs::create_dir_all(dir).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", dir.display()))
    })
}

/// Renames `staging` over `target`, keeping the old record as `<target>.old`
/// until the rename succeeds.
fn swap_into_place(staging: &Path, target: &Path) -> Result<(), TrainingError> {
    let mut backup = target.as_os_str().to_owned();
    backup.push(".old");
    let backup = PathBuf::from(backup);
    if backup.exists() {
        fs::remove_dir_all(&backup).map_err(|err| {
            TrainingError::checkpoint(format!("failed to remove {}: {err}", backup.display()))
        })?;
    }
    if target.exists() {
        fs::rename(target, &backup).map_err(|err| {
            TrainingError::checkpoint(format!("failed to retire {}: {err}", target.display()))
        })?;
    }
    fs::rename(staging, target).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to move {} into place: {err}",
            staging.display()
        ))
    })?;
    if backup.exists() {
        fs::remove_dir_all(&backup).map_err(|err| {
            TrainingError::checkpoint(format!("failed to remove {}: {err}", backup.display()))
        })?;
    }
    Ok(())
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::checkpoint(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
