use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Weight of the newest sample in the smoothed training loss.
pub const LOSS_SMOOTHING: f64 = 0.02;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Seeds the average, e.g. when resuming from a checkpoint.
    pub fn with_value(alpha: f64, value: Option<f64>) -> Self {
        Self { alpha, value }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Throughput bookkeeping between two log lines.
#[derive(Debug)]
pub struct ThroughputMeter {
    window_start: Instant,
    rows: u64,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            rows: 0,
        }
    }

    pub fn record(&mut self, rows: usize) {
        self.rows += rows as u64;
    }

    /// Rows per second since the last call, then starts a new window.
    pub fn take_rate(&mut self) -> f64 {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.rows as f64 / elapsed
        } else {
            0.0
        };
        self.window_start = Instant::now();
        self.rows = 0;
        rate
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSnapshot {
    pub step: usize,
    pub step_loss: f64,
    pub smoothed_loss: f64,
    pub learning_rate: f64,
    pub rows_per_sec: f64,
}

/// Collects per-batch losses and main-target probabilities over a
/// validation pass.
#[derive(Debug, Default)]
pub struct ValidationMetrics {
    losses: Vec<f64>,
    probabilities: Vec<f64>,
    labels: Vec<bool>,
}

impl ValidationMetrics {
    pub fn update(&mut self, loss: f64, probabilities: &[f32], labels: &[f32]) {
        self.losses.push(loss);
        self.probabilities
            .extend(probabilities.iter().map(|&p| p as f64));
        self.labels.extend(labels.iter().map(|&y| y >= 0.5));
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn finalize(&self) -> Option<ValidationSummary> {
        if self.losses.is_empty() {
            return None;
        }
        let valid_loss = self.losses.iter().sum::<f64>() / self.losses.len() as f64;
        Some(ValidationSummary {
            valid_loss,
            auc: roc_auc(&self.probabilities, &self.labels),
            rows: self.probabilities.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ValidationSummary {
    pub valid_loss: f64,
    /// Undefined when the split holds a single class.
    pub auc: Option<f64>,
    pub rows: usize,
}

/// Area under the ROC curve via the rank-sum statistic, averaging ranks
/// over tied scores.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let positives = labels.iter().filter(|&&y| y).count();
    let negatives = labels.len().saturating_sub(positives);
    if scores.len() != labels.len() || positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; tied block [start, end) shares the mean rank.
        let rank = (start + end + 1) as f64 / 2.0;
        for &index in &order[start..end] {
            if labels[index] {
                positive_rank_sum += rank;
            }
        }
        start = end;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}
