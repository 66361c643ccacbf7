use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::calibration::{Calibrator, Metrics};
use crate::error::ForecastError;
use crate::features::FEATURE_COLUMNS;
use crate::model::{LogisticRegression, StandardScaler};

pub const ARTIFACT_VERSION: u32 = 1;
pub const MODEL_FILE: &str = "model.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub train_max_date: NaiveDate,
    pub valid_min_date: Option<NaiveDate>,
    pub train_rows: usize,
    pub valid_rows: usize,
}

/// Everything needed to score a matchup, readable without any ML runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u32,
    pub saved_at: String,
    pub feature_columns: Vec<String>,
    pub scaler: StandardScaler,
    pub classifier: LogisticRegression,
    pub calibrator: Calibrator,
    pub split: SplitInfo,
}

impl ModelArtifact {
    fn check_compatible(&self) -> std::result::Result<(), ForecastError> {
        if self.version != ARTIFACT_VERSION {
            return Err(ForecastError::ArtifactVersion(format!(
                "version {} (expected {ARTIFACT_VERSION})",
                self.version
            )));
        }
        if self.feature_columns != FEATURE_COLUMNS {
            return Err(ForecastError::ArtifactVersion(format!(
                "feature columns {:?} do not match {:?}",
                self.feature_columns, FEATURE_COLUMNS
            )));
        }
        let dim = FEATURE_COLUMNS.len();
        if self.scaler.mean.len() != dim
            || self.scaler.scale.len() != dim
            || self.classifier.coefficients.len() != dim
        {
            return Err(ForecastError::ArtifactVersion(
                "scaler/classifier width does not match feature columns".to_string(),
            ));
        }
        Ok(())
    }
}

/// One line of the append-only metrics ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub saved_at: String,
    pub tag: String,
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub ece: f64,
}

impl MetricsEntry {
    pub fn new(saved_at: &str, tag: &str, m: &Metrics) -> Self {
        Self {
            saved_at: saved_at.to_string(),
            tag: tag.to_string(),
            samples: m.samples,
            brier: m.brier,
            log_loss: m.log_loss,
            ece: m.ece,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE)
    }

    pub fn save_model(&self, artifact: &ModelArtifact) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
        let path = self.model_path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(artifact).context("serialize model artifact")?;
        fs::write(&tmp, json).context("write model artifact")?;
        fs::rename(&tmp, &path).context("swap model artifact")?;
        Ok(path)
    }

    pub fn load_model(&self) -> Result<ModelArtifact> {
        let path = self.model_path();
        if !path.exists() {
            return Err(ForecastError::ArtifactMissing(path).into());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read model artifact {}", path.display()))?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)
            .with_context(|| format!("parse model artifact {}", path.display()))?;
        artifact.check_compatible()?;
        Ok(artifact)
    }

    pub fn append_metrics(&self, entries: &[MetricsEntry]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))?;
        let path = self.metrics_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open metrics ledger {}", path.display()))?;
        for entry in entries {
            let line = serde_json::to_string(entry).context("serialize metrics entry")?;
            writeln!(file, "{line}").context("append metrics entry")?;
        }
        Ok(())
    }

    pub fn read_metrics(&self) -> Result<Vec<MetricsEntry>> {
        let path = self.metrics_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read metrics ledger {}", path.display()))?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("parse metrics entry"))
            .collect()
    }
}
