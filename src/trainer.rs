use anyhow::Result;
use chrono::{Days, NaiveDate, Utc};
use tracing::{info, warn};

use crate::artifacts::{ARTIFACT_VERSION, ArtifactStore, MetricsEntry, ModelArtifact, SplitInfo};
use crate::calibration::{self, Calibrator, Metrics};
use crate::elo::EloConfig;
use crate::error::ForecastError;
use crate::features::{FEATURE_COLUMNS, FeatureRow, FeatureVectorBuilder};
use crate::model::{LogisticRegression, StandardScaler};
use crate::recency::RecencyConfig;
use crate::store::HistoricalMatchStore;

pub const TRAIN_FRACTION_NUM: i64 = 9;
pub const TRAIN_FRACTION_DEN: i64 = 12;

#[derive(Debug, Clone, Copy)]
pub struct TrainerConfig {
    pub c: f64,
    pub recency: RecencyConfig,
    pub elo: EloConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            recency: RecencyConfig::default(),
            elo: EloConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TemporalSplit<'a> {
    pub cutoff: NaiveDate,
    pub train: Vec<&'a FeatureRow>,
    pub valid: Vec<&'a FeatureRow>,
}

/// `min + (max - min) * 9/12`, floored to whole days.
pub fn temporal_cutoff(min: NaiveDate, max: NaiveDate) -> NaiveDate {
    let span = (max - min).num_days().max(0);
    let offset = span * TRAIN_FRACTION_NUM / TRAIN_FRACTION_DEN;
    min.checked_add_days(Days::new(offset as u64)).unwrap_or(max)
}

/// Rows dated on or before the cutoff train; the rest validate. Never shuffled.
pub fn temporal_split(rows: &[FeatureRow]) -> Option<TemporalSplit<'_>> {
    let min = rows.iter().map(|r| r.date).min()?;
    let max = rows.iter().map(|r| r.date).max()?;
    let cutoff = temporal_cutoff(min, max);
    let mut ordered: Vec<&FeatureRow> = rows.iter().collect();
    ordered.sort_by_key(|r| r.date);
    let (train, valid): (Vec<&FeatureRow>, Vec<&FeatureRow>) =
        ordered.into_iter().partition(|r| r.date <= cutoff);
    Some(TemporalSplit {
        cutoff,
        train,
        valid,
    })
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub artifact: ModelArtifact,
    pub raw_train: Metrics,
    pub raw_valid: Metrics,
    pub calibrated_valid: Metrics,
    pub platt_ece: Option<f64>,
}

pub struct TemporalTrainer {
    cfg: TrainerConfig,
    artifacts: ArtifactStore,
}

impl TemporalTrainer {
    pub fn new(cfg: TrainerConfig, artifacts: ArtifactStore) -> Self {
        Self { cfg, artifacts }
    }

    /// Builds the leakage-safe feature table from `store`, then trains on it.
    pub fn train_store(&self, store: &HistoricalMatchStore) -> Result<TrainReport> {
        info!(
            records = store.len(),
            teams = store.teams().len(),
            maps = store.maps().len(),
            earliest = ?store.earliest_date(),
            latest = ?store.latest_date(),
            "building feature table"
        );
        let builder = FeatureVectorBuilder::new(store, self.cfg.recency, self.cfg.elo);
        let rows = builder.build_feature_table()?;
        self.train(&rows)
    }

    /// Fits, calibrates and persists. Identical rows give identical parameters.
    pub fn train(&self, rows: &[FeatureRow]) -> Result<TrainReport> {
        let report = self.fit(rows)?;
        self.artifacts.save_model(&report.artifact)?;
        let saved_at = report.artifact.saved_at.as_str();
        self.artifacts.append_metrics(&[
            MetricsEntry::new(saved_at, "raw_train", &report.raw_train),
            MetricsEntry::new(saved_at, "raw_valid", &report.raw_valid),
            MetricsEntry::new(saved_at, "calibrated_valid", &report.calibrated_valid),
        ])?;
        info!(
            path = %self.artifacts.model_path().display(),
            calibrator = report.artifact.calibrator.kind(),
            "saved model artifact"
        );
        Ok(report)
    }

    /// Everything except persistence.
    pub fn fit(&self, rows: &[FeatureRow]) -> Result<TrainReport> {
        let split = temporal_split(rows)
            .ok_or_else(|| ForecastError::DataUnavailable("feature table is empty".to_string()))?;
        info!(
            cutoff = %split.cutoff,
            train = split.train.len(),
            valid = split.valid.len(),
            "temporal split"
        );

        let (x_train, y_train) = design_matrix(&split.train);
        let (x_valid, y_valid) = design_matrix(&split.valid);

        let scaler = StandardScaler::fit(&x_train);
        let classifier =
            LogisticRegression::fit(&scaler.transform_all(&x_train), &y_train, self.cfg.c)?;

        let raw_train_p = positive_probs(&classifier, &scaler, &x_train)?;
        let raw_valid_p = positive_probs(&classifier, &scaler, &x_valid)?;

        let choice = if split.valid.is_empty() {
            warn!("no validation rows after the cutoff; using identity calibrator");
            calibration::CalibrationChoice {
                calibrator: Calibrator::Identity,
                platt_ece: None,
            }
        } else {
            calibration::select_calibrator(&raw_valid_p, &y_valid)
        };
        let calibrated_valid_p = choice.calibrator.apply_all(&raw_valid_p);

        let raw_train = calibration::evaluate_probs(&raw_train_p, &y_train);
        let raw_valid = calibration::evaluate_probs(&raw_valid_p, &y_valid);
        let calibrated_valid = calibration::evaluate_probs(&calibrated_valid_p, &y_valid);
        info!(
            train_brier = raw_train.brier,
            valid_brier = raw_valid.brier,
            calibrated_brier = calibrated_valid.brier,
            calibrated_ece = calibrated_valid.ece,
            "training metrics"
        );

        let artifact = ModelArtifact {
            version: ARTIFACT_VERSION,
            saved_at: Utc::now().to_rfc3339(),
            feature_columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            scaler,
            classifier,
            calibrator: choice.calibrator,
            split: SplitInfo {
                train_max_date: split.train.last().map(|r| r.date).unwrap_or(split.cutoff),
                valid_min_date: split.valid.first().map(|r| r.date),
                train_rows: split.train.len(),
                valid_rows: split.valid.len(),
            },
        };

        Ok(TrainReport {
            artifact,
            raw_train,
            raw_valid,
            calibrated_valid,
            platt_ece: choice.platt_ece,
        })
    }
}

fn design_matrix(rows: &[&FeatureRow]) -> (Vec<Vec<f64>>, Vec<u8>) {
    let x = rows.iter().map(|r| r.features.values().to_vec()).collect();
    let y = rows.iter().map(|r| r.label()).collect();
    (x, y)
}

fn positive_probs(
    classifier: &LogisticRegression,
    scaler: &StandardScaler,
    rows: &[Vec<f64>],
) -> Result<Vec<f64>> {
    rows.iter()
        .map(|x| {
            classifier
                .prob_for_label(&scaler.transform(x), 1)
                .ok_or_else(|| {
                    anyhow::Error::from(ForecastError::DegenerateTrainingSet(format!(
                        "classifier classes {:?} lack label 1",
                        classifier.classes
                    )))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{temporal_cutoff, temporal_split};
    use crate::features::{FeatureRow, FeatureVector};

    fn row(day: u32) -> FeatureRow {
        FeatureRow {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            team_a: "A".to_string(),
            team_b: "B".to_string(),
            map: "Ascent".to_string(),
            features: FeatureVector {
                label: Some((day % 2) as u8),
                ..FeatureVector::default()
            },
        }
    }

    #[test]
    fn cutoff_is_nine_twelfths_of_the_span() {
        let min = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let max = NaiveDate::from_ymd_opt(2024, 1, 13).unwrap();
        assert_eq!(temporal_cutoff(min, max), NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(temporal_cutoff(min, min), min);
    }

    #[test]
    fn split_is_chronological() {
        let rows: Vec<FeatureRow> = [13, 2, 10, 1, 11, 5].into_iter().map(row).collect();
        let split = temporal_split(&rows).unwrap();
        let train_days: Vec<u32> = split
            .train
            .iter()
            .map(|r| r.date.format("%d").to_string().parse().unwrap())
            .collect();
        assert_eq!(train_days, vec![1, 2, 5, 10]);
        assert_eq!(split.valid.len(), 2);
        assert!(split.valid.iter().all(|r| r.date > split.cutoff));
        assert!(temporal_split(&[]).is_none());
    }
}
