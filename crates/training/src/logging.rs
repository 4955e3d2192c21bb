use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde::Serialize;
use tracing::info;

use crate::{
    config::LoggingConfig,
    metrics::{StepSnapshot, ValidationSummary},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
    pub log_every_n_steps: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard_dir.clone(),
            tensorboard_flush_every_n: config.flush_every_n.max(1),
            log_every_n_steps: config.log_every_n_steps.max(1),
        }
    }
}

/// Cheap to clone; clones share one event file.
#[derive(Clone)]
pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<Arc<Mutex<EventFile>>>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = settings
            .tensorboard_dir
            .as_deref()
            .map(|dir| EventFile::create(dir, settings.tensorboard_flush_every_n))
            .transpose()?
            .map(|events| Arc::new(Mutex::new(events)));
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn should_log(&self, step: usize) -> bool {
        step % self.settings.log_every_n_steps == 0
    }

    pub fn log_training_step(&mut self, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            info!(
                step = snapshot.step,
                loss = format_args!("{:.4}", snapshot.step_loss),
                smoothed = format_args!("{:.4}", snapshot.smoothed_loss),
                lr = format_args!("{:.3e}", snapshot.learning_rate),
                rows_per_sec = format_args!("{:.1}", snapshot.rows_per_sec),
                "train"
            );
        }

        if let Some(mut events) = self.events() {
            let _ = events.scalars(
                snapshot.step,
                &[
                    ("train/loss", snapshot.step_loss),
                    ("train/loss_smoothed", snapshot.smoothed_loss),
                    ("train/rows_per_sec", snapshot.rows_per_sec),
                    ("train/learning_rate", snapshot.learning_rate),
                ],
            );
        }
    }

    pub fn log_validation(&mut self, step: usize, summary: &ValidationSummary) {
        if self.settings.enable_stdout {
            info!(
                step,
                valid_loss = format_args!("{:.4}", summary.valid_loss),
                auc = ?summary.auc,
                rows = summary.rows,
                "validation"
            );
        }

        if let Some(mut events) = self.events() {
            let mut values = vec![("valid/loss", summary.valid_loss)];
            values.extend(summary.auc.map(|auc| ("valid/auc", auc)));
            let _ = events.scalars(step, &values);
        }
    }

    pub fn flush(&mut self) {
        if let Some(mut events) = self.events() {
            let _ = events.flush();
        }
    }

    fn events(&self) -> Option<MutexGuard<'_, EventFile>> {
        self.tensorboard.as_ref().and_then(|events| events.lock().ok())
    }
}

/// Appends one JSON object per line to `metrics.jsonl` in the run root.
pub struct MetricsJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl MetricsJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrainingError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), TrainingError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write {}: {err}", self.path.display()))
            })
    }
}

const FILE_VERSION: &str = "brain.Event:2";

/// Scalar summaries in TensorBoard's `tfevents` record format. Each record is
/// `len | masked_crc(len) | payload | masked_crc(payload)`, little endian.
struct EventFile {
    out: BufWriter<File>,
    flush_every: usize,
    unflushed: usize,
}

impl EventFile {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| event_file_error("create", dir, err))?;
        let now = unix_now();
        let path = dir.join(format!("events.out.tfevents.{}.{}", now.as_secs(), host_name()));
        let file = File::create(&path).map_err(|err| event_file_error("create", &path, err))?;
        let mut events = Self {
            out: BufWriter::new(file),
            flush_every: flush_every.max(1),
            unflushed: 0,
        };
        events.append(&Event {
            wall_time: now.as_secs_f64(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        Ok(events)
    }

    /// Writes all `values` as one event at `step`.
    fn scalars(&mut self, step: usize, values: &[(&str, f64)]) -> Result<(), TrainingError> {
        let value = values
            .iter()
            .map(|&(tag, value)| SummaryValue {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            })
            .collect();
        self.append(&Event {
            wall_time: unix_now().as_secs_f64(),
            step: step as i64,
            file_version: None,
            summary: Some(Summary { value }),
        })
    }

    fn append(&mut self, event: &Event) -> Result<(), TrainingError> {
        let record = frame_record(&event.encode_to_vec());
        self.out
            .write_all(&record)
            .map_err(|err| TrainingError::runtime(format!("failed to write tensorboard event: {err}")))?;
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.out
            .flush()
            .map_err(|err| TrainingError::runtime(format!("failed to flush tensorboard events: {err}")))?;
        self.unflushed = 0;
        Ok(())
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn frame_record(payload: &[u8]) -> BytesMut {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    hasher.finalize().rotate_right(15).wrapping_add(0xa282_ead8)
}

fn event_file_error(action: &str, path: &Path, err: std::io::Error) -> TrainingError {
    TrainingError::runtime(format!("failed to {action} {}: {err}", path.display()))
}

fn unix_now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `tensorflow.Event`, restricted to the fields written here.
#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<SummaryValue>,
}

#[derive(Clone, PartialEq, Message)]
struct SummaryValue {
    #[prost(string, tag = "1")]
    tag: String,
    #[prost(float, optional, tag = "2")]
    simple_value: Option<f32>,
}
