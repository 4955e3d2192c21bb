use std::{fs, path::Path};

use tempfile::tempdir;
use training::{RunMode, Session, SessionOptions, TrainOutcome, TrainingConfig, TrainingError};

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": {"type": "Lowercase"},
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3,
            "you": 4, "are": 5, "nice": 6, "awful": 7, "people": 8,
            "the": 9, "movie": 10, "was": 11, "great": 12, "terrible": 13
        },
        "unk_token": "[UNK]"
    }
}"#;

const TOXIC: [&str; 3] = [
    "you are awful people",
    "the movie was terrible and you are awful awful awful people",
    "awful",
];
const CLEAN: [&str; 3] = [
    "you are nice",
    "the movie was great",
    "the movie was great and the people are nice nice nice",
];

const ROWS: usize = 40;
const VALID_ROWS: usize = 10;

fn write_fixture(base: &Path) {
    fs::write(base.join("tokenizer.json"), TOKENIZER_JSON).unwrap();

    let mut train = String::from(
        "id,comment_text,target,severe_toxicity,obscene,identity_attack,insult,threat,male\n",
    );
    for row in 0..ROWS {
        let toxic = row % 2 == 0;
        let text = if toxic { TOXIC[row % 3] } else { CLEAN[row % 3] };
        let target = if toxic { 0.8 } else { 0.1 };
        let male = if row % 5 == 0 { "1.0" } else { "" };
        train.push_str(&format!(
            "{row},{text},{target},0.0,0.1,0.0,{target},0.0,{male}\n"
        ));
    }
    fs::write(base.join("train.csv"), train).unwrap();

    let fold: Vec<String> = (0..VALID_ROWS).map(|row| row.to_string()).collect();
    fs::write(
        base.join("folds.json"),
        serde_json::to_string(&vec![fold]).unwrap(),
    )
    .unwrap();

    let mut test = String::from("id,comment_text\n");
    for row in 0..7 {
        test.push_str(&format!("t{row},{}\n", if row % 2 == 0 { TOXIC[row % 3] } else { CLEAN[row % 3] }));
    }
    fs::write(base.join("test.csv"), test).unwrap();

    let config = r#"
        [model]
        hidden_size = 8

        [tokenizer]
        tokenizer_json = "tokenizer.json"

        [data]
        train_csv = "train.csv"
        test_csv = "test.csv"
        folds_json = "folds.json"
        train_seq_length = 16
        test_seq_length = 24
        batch_size = 4
        eval_batch_size = 3
        num_workers = 2

        [optimizer]
        learning_rate = 1e-3

        [runtime]
        run_root = "runs/fold0"
        epochs = 2
        accumulation_steps = 2
        checkpoint_interval = 3
        device = "cpu"

        [runtime.logging]
        enable_stdout = false
        tensorboard_dir = "runs/fold0/tb"
    "#;
    fs::write(base.join("run.toml"), config).unwrap();
}

fn resume() -> SessionOptions {
    SessionOptions {
        resume: true,
        ..SessionOptions::default()
    }
}

#[test]
fn train_validate_and_submit() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    write_fixture(base);
    let config = TrainingConfig::from_path(base.join("run.toml")).unwrap();
    let run_root = config.runtime.run_root.clone();

    // 30 training rows in batches of 4 give 8 steps per epoch.
    let session = Session::new(config.clone(), SessionOptions::default(), RunMode::Train).unwrap();
    let outcome = session.train(|| false).unwrap();
    match outcome {
        TrainOutcome::Completed {
            global_step,
            smoothed_loss,
        } => {
            assert_eq!(global_step, 16);
            assert!(smoothed_loss.is_some_and(f64::is_finite));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    drop(session);

    for file in [
        "params.json",
        "metrics.jsonl",
        "valid-predictions.csv",
        "checkpoint/manifest.json",
        "checkpoint/model.safetensors",
        "checkpoint/optimizer.safetensors",
        "best/manifest.json",
        "best/model.safetensors",
    ] {
        assert!(run_root.join(file).is_file(), "missing {file}");
    }
    assert!(fs::read_dir(run_root.join("tb")).unwrap().next().is_some());

    // Handoffs at steps 3, 6, 8 (epoch end), 9, 12, 15 and 16 (epoch end).
    let journal = fs::read_to_string(run_root.join("metrics.jsonl")).unwrap();
    let steps: Vec<u64> = journal
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![3, 6, 8, 9, 12, 15, 16]);

    let predictions = fs::read_to_string(run_root.join("valid-predictions.csv")).unwrap();
    assert_eq!(predictions.lines().count(), VALID_ROWS + 1);
    assert_eq!(predictions.lines().next(), Some("id,target,prediction"));

    // A second run into the same root must opt in.
    assert!(matches!(
        Session::new(config.clone(), SessionOptions::default(), RunMode::Train),
        Err(TrainingError::Initialization(_))
    ));

    // Resuming a finished run replays nothing.
    let session = Session::new(config.clone(), resume(), RunMode::Train).unwrap();
    assert!(matches!(
        session.train(|| false).unwrap(),
        TrainOutcome::Completed { global_step: 16, .. }
    ));
    drop(session);

    let summary = Session::new(config.clone(), SessionOptions::default(), RunMode::Validate)
        .unwrap()
        .validate()
        .unwrap()
        .unwrap();
    assert_eq!(summary.rows, VALID_ROWS);
    assert!(summary.auc.is_some());

    let submission = Session::new(config, SessionOptions::default(), RunMode::Submission)
        .unwrap()
        .submission()
        .unwrap();
    let text = fs::read_to_string(submission).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 8);
    assert_eq!(lines[0], "id,prediction");
    assert!(lines[1].starts_with("t0,"));
}

#[test]
fn interrupted_run_resumes_to_completion() {
    let tmp = tempdir().unwrap();
    let base = tmp.path();
    write_fixture(base);
    let mut config = TrainingConfig::from_path(base.join("run.toml")).unwrap();
    config.runtime.logging.tensorboard_dir = None;
    config.runtime.checkpoint_interval = Some(100);

    let session = Session::new(config.clone(), SessionOptions::default(), RunMode::Train).unwrap();
    let mut polls = 0;
    // The first poll precedes the start handoff; stop once five steps ran.
    let outcome = session
        .train(|| {
            polls += 1;
            polls > 6
        })
        .unwrap();
    assert_eq!(outcome, TrainOutcome::Interrupted { global_step: 5 });
    drop(session);

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(config.runtime.run_root.join("checkpoint/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["progress"]["global_step"], 5);
    assert_eq!(manifest["progress"]["optimizer_step"], 2);
    assert!(!config.runtime.run_root.join("best").exists());

    let session = Session::new(config.clone(), resume(), RunMode::Train).unwrap();
    assert!(matches!(
        session.train(|| false).unwrap(),
        TrainOutcome::Completed { global_step: 16, .. }
    ));

    let clean = SessionOptions {
        clean: true,
        ..SessionOptions::default()
    };
    Session::new(config.clone(), clean, RunMode::Train).unwrap();
    assert!(!config.runtime.run_root.join("checkpoint").exists());
}
