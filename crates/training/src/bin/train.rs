use std::{
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Number, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use training::{RunMode, Session, SessionOptions, TrainOutcome, TrainingConfig, TrainingError};

/// Conventional exit status after SIGINT.
const INTERRUPTED_EXIT: u8 = 130;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run() {
        Ok(code) => code,
        Err(err) => {
            error!("training failed: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Length-bucketed text classifier fine-tuning", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Continue from the run root's checkpoint")]
    resume: bool,

    #[arg(long, help = "Delete an existing run root before training")]
    clean: bool,

    #[arg(long, conflicts_with = "submission", help = "Score the validation split with the best checkpoint")]
    validation: bool,

    #[arg(long, help = "Write submission.csv for the test file with the best checkpoint")]
    submission: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<ExitCode, TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let mode = if args.validation {
        RunMode::Validate
    } else if args.submission {
        RunMode::Submission
    } else {
        RunMode::Train
    };
    let options = SessionOptions {
        clean: args.clean,
        resume: args.resume,
    };
    let session = Session::new(config, options, mode)?;

    match mode {
        RunMode::Validate => {
            match session.validate()? {
                Some(summary) => info!(valid_loss = summary.valid_loss, auc = ?summary.auc, "validation done"),
                None => info!("validation split produced no batches"),
            }
            Ok(ExitCode::SUCCESS)
        }
        RunMode::Submission => {
            session.submission()?;
            Ok(ExitCode::SUCCESS)
        }
        RunMode::Train => {
            let shutdown_flag = Arc::new(AtomicBool::new(false));
            let handler_flag = shutdown_flag.clone();
            ctrlc::set_handler(move || {
                handler_flag.store(true, Ordering::Relaxed);
            })
            .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

            match session.train(|| shutdown_flag.load(Ordering::Relaxed))? {
                TrainOutcome::Interrupted { global_step } => {
                    info!(global_step, "interrupted");
                    Ok(ExitCode::from(INTERRUPTED_EXIT))
                }
                TrainOutcome::Completed { .. } | TrainOutcome::Stopped { .. } => Ok(ExitCode::SUCCESS),
            }
        }
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Sets `path` (dot-separated object keys) inside `value`, creating
/// intermediate objects as needed.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' has an empty segment"
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::runtime("override path must not be empty"));
    };
    let mut current = value;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{segment}' points into a non-object value"
            )));
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    let Some(map) = current.as_object_mut() else {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' points into a non-object value"
        )));
    };
    map.insert(last.to_string(), new_value);
    Ok(())
}
