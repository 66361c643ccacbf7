use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{LogisticRegression, logit, sigmoid};

pub const ECE_BINS: usize = 10;
pub const MAX_PLATT_ECE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub ece: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

/// Maps a raw classifier probability to a calibrated one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calibrator {
    /// `sigmoid(a * logit(p) + b)`.
    Platt { a: f64, b: f64 },
    /// Monotone lookup with linear interpolation, clipped at both ends.
    Isotonic { x: Vec<f64>, y: Vec<f64> },
    Identity,
}

impl Calibrator {
    pub fn kind(&self) -> &'static str {
        match self {
            Calibrator::Platt { .. } => "platt",
            Calibrator::Isotonic { .. } => "isotonic",
            Calibrator::Identity => "identity",
        }
    }

    pub fn apply(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        match self {
            Calibrator::Platt { a, b } => sigmoid(a * logit(p) + b),
            Calibrator::Isotonic { x, y } => interpolate(x, y, p),
            Calibrator::Identity => p,
        }
    }

    pub fn apply_all(&self, probs: &[f64]) -> Vec<f64> {
        probs.iter().map(|p| self.apply(*p)).collect()
    }
}

/// Outcome of the calibration policy, with the Platt ECE that drove it.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationChoice {
    pub calibrator: Calibrator,
    pub platt_ece: Option<f64>,
}

/// Platt first; isotonic if Platt leaves ECE above `MAX_PLATT_ECE`;
/// identity when the validation labels are all one class.
pub fn select_calibrator(raw_probs: &[f64], labels: &[u8]) -> CalibrationChoice {
    let has_pos = labels.iter().any(|l| *l == 1);
    let has_neg = labels.iter().any(|l| *l == 0);
    if raw_probs.is_empty() || !has_pos || !has_neg {
        warn!(
            samples = raw_probs.len(),
            "validation split has a single class; using identity calibrator"
        );
        return CalibrationChoice {
            calibrator: Calibrator::Identity,
            platt_ece: None,
        };
    }

    let Some(platt) = fit_platt(raw_probs, labels) else {
        warn!("platt fit failed; falling back to isotonic");
        return CalibrationChoice {
            calibrator: fit_isotonic(raw_probs, labels),
            platt_ece: None,
        };
    };
    let ece = expected_calibration_error(&platt.apply_all(raw_probs), labels, ECE_BINS);
    if ece > MAX_PLATT_ECE {
        info!(ece, "platt calibration too coarse; using isotonic");
        return CalibrationChoice {
            calibrator: fit_isotonic(raw_probs, labels),
            platt_ece: Some(ece),
        };
    }
    info!(ece, "using platt calibration");
    CalibrationChoice {
        calibrator: platt,
        platt_ece: Some(ece),
    }
}

/// 1-D logistic regression of label on logit(raw probability), same fitter and C as the model.
pub fn fit_platt(raw_probs: &[f64], labels: &[u8]) -> Option<Calibrator> {
    let x: Vec<Vec<f64>> = raw_probs.iter().map(|p| vec![logit(*p)]).collect();
    let lr = LogisticRegression::fit(&x, labels, 1.0).ok()?;
    // Orient toward label 1 whatever the class order.
    let sign = if lr.classes[1] == 1 { 1.0 } else { -1.0 };
    Some(Calibrator::Platt {
        a: sign * lr.coefficients[0],
        b: sign * lr.intercept,
    })
}

/// Pool-adjacent-violators fit. Tied inputs are pooled before the pass.
pub fn fit_isotonic(raw_probs: &[f64], labels: &[u8]) -> Calibrator {
    let mut pairs: Vec<(f64, f64)> = raw_probs
        .iter()
        .zip(labels)
        .map(|(p, l)| (p.clamp(0.0, 1.0), f64::from(*l)))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // (sum_x, sum_y, count)
    let mut blocks: Vec<(f64, f64, f64)> = Vec::new();
    for (x, y) in pairs {
        match blocks.last_mut() {
            Some(last) if last.0 / last.2 == x => {
                last.0 += x;
                last.1 += y;
                last.2 += 1.0;
            }
            _ => blocks.push((x, y, 1.0)),
        }
        while blocks.len() >= 2 {
            let n = blocks.len();
            let (prev, cur) = (blocks[n - 2], blocks[n - 1]);
            if prev.1 / prev.2 <= cur.1 / cur.2 {
                break;
            }
            blocks.truncate(n - 2);
            blocks.push((prev.0 + cur.0, prev.1 + cur.1, prev.2 + cur.2));
        }
    }

    Calibrator::Isotonic {
        x: blocks.iter().map(|b| b.0 / b.2).collect(),
        y: blocks.iter().map(|b| (b.1 / b.2).clamp(0.0, 1.0)).collect(),
    }
}

pub fn evaluate_probs(probs: &[f64], labels: &[u8]) -> Metrics {
    if probs.is_empty() || probs.len() != labels.len() {
        return Metrics {
            samples: 0,
            brier: 0.0,
            log_loss: 0.0,
            ece: 0.0,
            accuracy: 0.0,
        };
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;
    for (p, label) in probs.iter().zip(labels) {
        let y = f64::from(*label);
        let p = p.clamp(0.0, 1.0);
        brier_sum += (p - y).powi(2);
        let actual_prob = if *label == 1 { p } else { 1.0 - p }.clamp(1e-12, 1.0);
        log_loss_sum += -actual_prob.ln();
        if (p >= 0.5) == (*label == 1) {
            correct += 1;
        }
    }

    let n = probs.len() as f64;
    Metrics {
        samples: probs.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        ece: expected_calibration_error(probs, labels, ECE_BINS),
        accuracy: correct as f64 / n,
    }
}

/// Σ (bin count / n) · |mean confidence − observed rate| over equal-width bins.
pub fn expected_calibration_error(probs: &[f64], labels: &[u8], bins: usize) -> f64 {
    let n = probs.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    calibration_bins(probs, labels, bins)
        .iter()
        .filter(|b| b.count > 0)
        .map(|b| (b.count as f64 / n as f64) * (b.avg_pred - b.actual_rate).abs())
        .sum()
}

pub fn calibration_bins(probs: &[f64], labels: &[u8], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, label) in probs.iter().zip(labels) {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        if *label == 1 {
            actual_sum[idx] += 1.0;
        }
    }

    let mut out = Vec::with_capacity(bins);
    for i in 0..bins {
        let count = counts[i];
        let (avg_pred, actual_rate) = if count > 0 {
            (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
        } else {
            (0.0, 0.0)
        };
        out.push(CalibrationBin {
            bucket_start: i as f64 / bins as f64,
            bucket_end: (i + 1) as f64 / bins as f64,
            count,
            avg_pred,
            actual_rate,
        });
    }
    out
}

fn interpolate(xs: &[f64], ys: &[f64], p: f64) -> f64 {
    let (Some(&x0), Some(&y0), Some(&xn), Some(&yn)) =
        (xs.first(), ys.first(), xs.last(), ys.last())
    else {
        return p;
    };
    if p <= x0 {
        return y0;
    }
    if p >= xn {
        return yn;
    }
    let hi = xs.partition_point(|x| *x < p).min(xs.len() - 1);
    let lo = hi.saturating_sub(1);
    let (xl, xh, yl, yh) = (xs[lo], xs[hi], ys[lo], ys[hi]);
    if xh <= xl {
        return yh;
    }
    yl + (yh - yl) * (p - xl) / (xh - xl)
}
