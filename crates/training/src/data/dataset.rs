use std::{collections::HashSet, fs, path::Path};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::DataConfig, data::Result, TrainingError};

/// Auxiliary targets predicted next to the main label.
pub const AUX_COLUMNS: [&str; 6] = [
    "target",
    "severe_toxicity",
    "obscene",
    "identity_attack",
    "insult",
    "threat",
];

/// Identity mentions used to up-weight subgroup examples.
pub const IDENTITY_COLUMNS: [&str; 9] = [
    "male",
    "female",
    "homosexual_gay_or_lesbian",
    "christian",
    "jewish",
    "muslim",
    "black",
    "white",
    "psychiatric_or_mental_illness",
];

/// Per-row target layout: `[label, sample_weight, aux...]`.
pub const TARGET_WIDTH: usize = 2 + AUX_COLUMNS.len();

const SAMPLE_SEED: u64 = 42;

/// Rows of a labelled CSV split.
#[derive(Debug, Clone, Default)]
pub struct LabelledRows {
    pub ids: Vec<String>,
    pub texts: Vec<String>,
    /// Raw toxicity score per row, kept for prediction exports.
    pub scores: Vec<f32>,
    /// Row-major `rows x TARGET_WIDTH`.
    pub targets: Vec<f32>,
}

impl LabelledRows {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn target_row(&self, index: usize) -> &[f32] {
        &self.targets[index * TARGET_WIDTH..(index + 1) * TARGET_WIDTH]
    }

    /// Scale applied to the weighted main-target loss so that the average
    /// sample weight counts as one.
    pub fn loss_weight(&self) -> f64 {
        if self.is_empty() {
            return 1.0;
        }
        let total: f64 = (0..self.len())
            .map(|row| self.target_row(row)[1] as f64)
            .sum();
        let mean = total / self.len() as f64;
        if mean > 0.0 {
            1.0 / mean
        } else {
            1.0
        }
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        let mut selected = Self::default();
        for &row in rows {
            selected.ids.push(self.ids[row].clone());
            selected.texts.push(self.texts[row].clone());
            selected.scores.push(self.scores[row]);
            selected.targets.extend_from_slice(self.target_row(row));
        }
        selected
    }

    /// Keeps a seeded random subset of at most `limit` rows.
    pub fn sample(self, limit: Option<usize>) -> Self {
        match limit {
            Some(limit) if self.len() > limit => {
                let mut rows: Vec<usize> = (0..self.len()).collect();
                rows.shuffle(&mut StdRng::seed_from_u64(SAMPLE_SEED));
                rows.truncate(limit);
                rows.sort_unstable();
                self.select(&rows)
            }
            _ => self,
        }
    }
}

/// Unlabelled rows for inference.
#[derive(Debug, Clone, Default)]
pub struct TextRows {
    pub ids: Vec<String>,
    pub texts: Vec<String>,
}

/// Builds `[label, sample_weight, aux...]` for one row.
///
/// Every row starts at a quarter weight and gains a quarter for each of:
/// mentioning an identity, being toxic while some identity is absent, and
/// being non-toxic while some identity is present.
pub fn build_targets(score: f32, aux: &[f32; 6], identities: &[f32]) -> [f32; TARGET_WIDTH] {
    let toxic = score >= 0.5;
    let any_identity = identities.iter().any(|&v| v >= 0.5);
    let any_absent = identities.iter().any(|&v| v < 0.5);

    let mut weight = 0.25;
    if any_identity {
        weight += 0.25;
    }
    if toxic && any_absent {
        weight += 0.25;
    }
    if !toxic && any_identity {
        weight += 0.25;
    }

    let mut row = [0.0; TARGET_WIDTH];
    row[0] = if toxic { 1.0 } else { 0.0 };
    row[1] = weight;
    row[2..].copy_from_slice(aux);
    row
}

pub fn read_labelled_csv(path: &Path, config: &DataConfig) -> Result<LabelledRows> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| TrainingError::data(format!("failed to open {}: {err}", path.display())))?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|header| header == name);
    let required = |name: &str| {
        column(name).ok_or_else(|| {
            TrainingError::data(format!("{} has no '{}' column", path.display(), name))
        })
    };

    let id_col = required(&config.id_column)?;
    let text_col = required(&config.text_column)?;
    let aux_cols = AUX_COLUMNS
        .iter()
        .map(|name| required(name))
        .collect::<Result<Vec<_>>>()?;
    // Identity annotations are sparse; an absent column reads as zeros.
    let identity_cols: Vec<Option<usize>> = IDENTITY_COLUMNS.iter().map(|name| column(name)).collect();

    let mut rows = LabelledRows::default();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |col: usize| record.get(col).unwrap_or("");

        let mut aux = [0.0f32; 6];
        for (slot, &col) in aux.iter_mut().zip(&aux_cols) {
            *slot = parse_score(field(col), line)?;
        }
        let identities = identity_cols
            .iter()
            .map(|col| col.map_or(Ok(0.0), |col| parse_score(field(col), line)))
            .collect::<Result<Vec<f32>>>()?;

        let score = aux[0];
        rows.ids.push(field(id_col).to_string());
        rows.texts.push(field(text_col).to_string());
        rows.scores.push(score);
        rows.targets
            .extend_from_slice(&build_targets(score, &aux, &identities));
    }

    if rows.is_empty() {
        return Err(TrainingError::data(format!("{} contains no rows", path.display())));
    }
    Ok(rows)
}

pub fn read_text_csv(path: &Path, config: &DataConfig) -> Result<TextRows> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| TrainingError::data(format!("failed to open {}: {err}", path.display())))?;
    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| TrainingError::data(format!("{} has no '{}' column", path.display(), name)))
    };
    let id_col = position(&config.id_column)?;
    let text_col = position(&config.text_column)?;

    let mut rows = TextRows::default();
    for record in reader.records() {
        let record = record?;
        rows.ids.push(record.get(id_col).unwrap_or("").to_string());
        rows.texts.push(record.get(text_col).unwrap_or("").to_string());
    }
    Ok(rows)
}

/// Splits `rows` into train and validation parts.
///
/// With a folds file the validation part is every row whose id is listed in
/// fold `config.fold`; otherwise a seeded `valid_fraction` of the rows.
pub fn split_train_valid(rows: &LabelledRows, config: &DataConfig) -> Result<(Vec<usize>, Vec<usize>)> {
    let is_valid: Vec<bool> = match &config.folds_json {
        Some(path) => {
            let folds: Vec<Vec<serde_json::Value>> = serde_json::from_str(&fs::read_to_string(path)?)?;
            let fold = folds.get(config.fold).ok_or_else(|| {
                TrainingError::data(format!(
                    "fold {} requested but {} defines {} folds",
                    config.fold,
                    path.display(),
                    folds.len()
                ))
            })?;
            let ids: HashSet<String> = fold.iter().map(id_string).collect();
            rows.ids.iter().map(|id| ids.contains(id)).collect()
        }
        None => {
            let mut order: Vec<usize> = (0..rows.len()).collect();
            order.shuffle(&mut StdRng::seed_from_u64(SAMPLE_SEED));
            let valid_rows = ((rows.len() as f64 * config.valid_fraction).round() as usize)
                .clamp(1, rows.len().saturating_sub(1).max(1));
            let mut flags = vec![false; rows.len()];
            for &row in &order[..valid_rows] {
                flags[row] = true;
            }
            flags
        }
    };

    let (valid, train): (Vec<usize>, Vec<usize>) = (0..rows.len()).partition(|&row| is_valid[row]);
    if train.is_empty() || valid.is_empty() {
        return Err(TrainingError::data(format!(
            "split left {} training and {} validation rows",
            train.len(),
            valid.len()
        )));
    }
    Ok((train, valid))
}

fn id_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_score(raw: &str, line: usize) -> Result<f32> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(0.0);
    }
    raw.parse::<f32>()
        .map_err(|err| TrainingError::data(format!("row {line}: invalid score '{raw}': {err}")))
}
