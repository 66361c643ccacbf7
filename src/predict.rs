use anyhow::{Result, anyhow};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifacts::{ArtifactStore, ModelArtifact};
use crate::elo::EloConfig;
use crate::features::{FEATURE_COLUMNS, FeatureVector, FeatureVectorBuilder};
use crate::model::{logit, sigmoid};
use crate::recency::RecencyConfig;
use crate::store::HistoricalMatchStore;

pub const ASYMMETRY_EPSILON: f64 = 0.001;

// Same order as FEATURE_COLUMNS.
const DRIVER_LABELS: [&str; 5] = ["winrate_diff", "h2h", "mapElo_diff", "ACS_diff", "KD_diff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Uncertainty {
    Low,
    Medium,
    High,
}

impl Uncertainty {
    pub fn from_prob(p: f64) -> Self {
        let confidence = p.max(1.0 - p);
        if confidence > 0.7 {
            Uncertainty::Low
        } else if confidence > 0.6 {
            Uncertainty::Medium
        } else {
            Uncertainty::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorContribution {
    pub feature: String,
    /// Standardized value times coefficient: this feature's share of the
    /// raw logit. A linear read-out, not a Shapley value.
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub team_a: String,
    pub team_b: String,
    pub map: String,
    pub as_of: Option<NaiveDate>,
    pub prob_team_a: f64,
    pub prob_team_b: f64,
    pub features: FeatureVector,
    pub factor_contribution: Vec<FactorContribution>,
    pub explanation: String,
    pub uncertainty: Uncertainty,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_saved_at: Option<String>,
}

impl Prediction {
    /// Neutral 50/50 answer carrying the reason the model could not be used.
    pub fn fallback(team_a: &str, team_b: &str, map: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let (team_a, team_b, map) = (team_a.trim(), team_b.trim(), map.trim());
        Self {
            team_a: team_a.to_string(),
            team_b: team_b.to_string(),
            map: map.to_string(),
            as_of: None,
            prob_team_a: 0.5,
            prob_team_b: 0.5,
            features: FeatureVector::default(),
            factor_contribution: Vec::new(),
            explanation: format!("{team_a} vs {team_b} on {map}: no model estimate ({reason})."),
            uncertainty: Uncertainty::High,
            fallback_reason: Some(reason),
            model_saved_at: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymmetricPrediction {
    pub prob_team_a: f64,
    pub prob_team_b: f64,
    pub uncertainty: Uncertainty,
    /// |P_AB(A) - (1 - P_BA(B))| before averaging.
    pub raw_asymmetry: f64,
    pub asymmetry_detected: bool,
    pub forward: Prediction,
    pub reverse: Prediction,
}

/// Pluggable post-model adjustment, added to the raw logit before calibration.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn score_adjustment(&self, base: &FeatureVector) -> f64;
}

/// Leans harder on map-specific Elo than the fitted weights do.
#[derive(Debug, Clone, Copy)]
pub struct SosTilt {
    pub weight: f64,
}

impl ScoringStrategy for SosTilt {
    fn name(&self) -> &str {
        "sos_tilt"
    }

    fn score_adjustment(&self, base: &FeatureVector) -> f64 {
        self.weight * base.sos_elo_diff
    }
}

pub struct PredictionService {
    model: std::result::Result<ModelArtifact, String>,
    recency: RecencyConfig,
    elo: EloConfig,
    strategies: Vec<Box<dyn ScoringStrategy>>,
}

impl PredictionService {
    pub fn new(artifact: ModelArtifact, recency: RecencyConfig, elo: EloConfig) -> Self {
        Self {
            model: Ok(artifact),
            recency,
            elo,
            strategies: Vec::new(),
        }
    }

    /// Never fails: a missing or unreadable artifact is remembered and every
    /// prediction falls back with that reason.
    pub fn load(artifacts: &ArtifactStore, recency: RecencyConfig, elo: EloConfig) -> Self {
        let model = artifacts.load_model().map_err(|err| {
            warn!(error = %err, "model artifact unavailable; predictions will fall back");
            format!("{err:#}")
        });
        Self {
            model,
            recency,
            elo,
            strategies: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn ScoringStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn model(&self) -> Option<&ModelArtifact> {
        self.model.as_ref().ok()
    }

    /// Always well-formed; failures become a 50/50 fallback with a reason.
    pub fn predict(
        &self,
        store: &HistoricalMatchStore,
        team_a: &str,
        team_b: &str,
        map: &str,
    ) -> Prediction {
        match self.try_predict(store, team_a, team_b, map) {
            Ok(p) => p,
            Err(err) => {
                warn!(team_a, team_b, map, error = %err, "prediction fell back to 50/50");
                Prediction::fallback(team_a, team_b, map, format!("{err:#}"))
            }
        }
    }

    pub fn try_predict(
        &self,
        store: &HistoricalMatchStore,
        team_a: &str,
        team_b: &str,
        map: &str,
    ) -> Result<Prediction> {
        let (team_a, team_b, map) = (team_a.trim(), team_b.trim(), map.trim());
        if team_a.is_empty() || team_b.is_empty() || map.is_empty() {
            return Err(anyhow!("team and map names must be non-empty"));
        }
        if team_a == team_b {
            return Err(anyhow!("a team cannot play itself"));
        }
        let model = self.model.as_ref().map_err(|reason| anyhow!("{reason}"))?;
        let latest = store
            .latest_date()
            .ok_or_else(|| anyhow!("no match history available"))?;
        let as_of = latest
            .checked_add_days(Days::new(1))
            .ok_or_else(|| anyhow!("history date {latest} out of range"))?;

        let builder = FeatureVectorBuilder::new(store, self.recency, self.elo);
        let features = builder.build(team_a, team_b, map, as_of)?;

        let z = model.scaler.transform(&features.values());
        let raw = model
            .classifier
            .prob_for_label(&z, 1)
            .ok_or_else(|| anyhow!("classifier was not trained on label 1"))?;
        let adjustment: f64 = self
            .strategies
            .iter()
            .map(|s| {
                let delta = s.score_adjustment(&features);
                debug!(strategy = s.name(), delta, "score adjustment");
                delta
            })
            .sum();
        let adjusted = if adjustment == 0.0 {
            raw
        } else {
            sigmoid(logit(raw) + adjustment)
        };
        let prob_team_a = model.calibrator.apply(adjusted);

        // Coefficients point at classes[1]; flip them if that is not label 1.
        let sign = if model.classifier.classes[1] == 1 { 1.0 } else { -1.0 };
        let factor_contribution: Vec<FactorContribution> = FEATURE_COLUMNS
            .iter()
            .zip(z.iter().zip(&model.classifier.coefficients))
            .map(|(name, (zi, wi))| FactorContribution {
                feature: name.to_string(),
                contribution: sign * zi * wi,
            })
            .collect();

        Ok(Prediction {
            team_a: team_a.to_string(),
            team_b: team_b.to_string(),
            map: map.to_string(),
            as_of: Some(as_of),
            prob_team_a,
            prob_team_b: 1.0 - prob_team_a,
            explanation: explanation(team_a, team_b, map, prob_team_a, &factor_contribution),
            features,
            factor_contribution,
            uncertainty: Uncertainty::from_prob(prob_team_a),
            fallback_reason: None,
            model_saved_at: Some(model.saved_at.clone()),
        })
    }

    /// Queries both orientations and averages them so the pair sums to one.
    pub fn predict_symmetric(
        &self,
        store: &HistoricalMatchStore,
        team_a: &str,
        team_b: &str,
        map: &str,
    ) -> SymmetricPrediction {
        let forward = self.predict(store, team_a, team_b, map);
        let reverse = self.predict(store, team_b, team_a, map);
        let p_ab = forward.prob_team_a;
        let p_ab_from_reverse = 1.0 - reverse.prob_team_a;
        let raw_asymmetry = (p_ab - p_ab_from_reverse).abs();
        let prob_team_a = (p_ab + p_ab_from_reverse) / 2.0;
        let asymmetry_detected = raw_asymmetry > ASYMMETRY_EPSILON;
        if asymmetry_detected {
            debug!(team_a, team_b, map, raw_asymmetry, "orientations disagree");
        }
        SymmetricPrediction {
            prob_team_a,
            prob_team_b: 1.0 - prob_team_a,
            uncertainty: Uncertainty::from_prob(prob_team_a),
            raw_asymmetry,
            asymmetry_detected,
            forward,
            reverse,
        }
    }
}

fn explanation(
    team_a: &str,
    team_b: &str,
    map: &str,
    prob_team_a: f64,
    factors: &[FactorContribution],
) -> String {
    let drivers: Vec<String> = DRIVER_LABELS
        .iter()
        .zip(factors)
        .map(|(label, f)| format!("{label}({:+.3})", f.contribution))
        .collect();
    format!(
        "{team_a} vs {team_b} on {map}: {team_a} win prob = {:.1}%. Drivers: {}.",
        prob_team_a * 100.0,
        drivers.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{PredictionService, SosTilt, Uncertainty};
    use crate::artifacts::{ArtifactStore, ModelArtifact, SplitInfo};
    use crate::calibration::Calibrator;
    use crate::elo::EloConfig;
    use crate::features::FEATURE_COLUMNS;
    use crate::match_record::{MatchRecord, TeamPerf, Tier};
    use crate::model::{LogisticRegression, StandardScaler};
    use crate::recency::RecencyConfig;
    use crate::store::HistoricalMatchStore;

    fn artifact(intercept: f64) -> ModelArtifact {
        ModelArtifact {
            version: 1,
            saved_at: "2024-07-01T00:00:00+00:00".to_string(),
            feature_columns: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            scaler: StandardScaler {
                mean: vec![0.0; 5],
                scale: vec![0.5, 0.2, 0.1, 20.0, 0.3],
            },
            classifier: LogisticRegression {
                coefficients: vec![0.6, 0.3, 0.5, 0.1, 0.2],
                intercept,
                classes: [0, 1],
                c: 1.0,
            },
            calibrator: Calibrator::Identity,
            split: SplitInfo {
                train_max_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                valid_min_date: None,
                train_rows: 0,
                valid_rows: 0,
            },
        }
    }

    fn service(intercept: f64) -> PredictionService {
        PredictionService::new(
            artifact(intercept),
            RecencyConfig::default(),
            EloConfig::default(),
        )
    }

    fn store() -> HistoricalMatchStore {
        let rec = |day: u32, winner: &str| {
            MatchRecord::new(
                NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
                "Sentinels",
                "LOUD",
                winner,
                "Lotus",
                "Americas",
                Tier::One,
                TeamPerf {
                    acs: Some(230.0),
                    kd: Some(1.1),
                },
                TeamPerf {
                    acs: Some(205.0),
                    kd: Some(0.95),
                },
            )
            .unwrap()
        };
        HistoricalMatchStore::new(vec![rec(1, "Sentinels"), rec(8, "Sentinels"), rec(15, "LOUD")])
    }

    #[test]
    fn missing_artifacts_fall_back_to_even_odds() {
        let dir = tempfile::tempdir().unwrap();
        let svc = PredictionService::load(
            &ArtifactStore::new(dir.path()),
            RecencyConfig::default(),
            EloConfig::default(),
        );
        let p = svc.predict(&store(), "Sentinels", "LOUD", "Lotus");
        assert!(p.is_fallback());
        assert_eq!(p.prob_team_a, 0.5);
        assert_eq!(p.uncertainty, Uncertainty::High);
        assert!(p.fallback_reason.unwrap().contains("not found"));
    }

    #[test]
    fn empty_history_and_bad_input_fall_back() {
        let svc = service(0.0);
        let empty = HistoricalMatchStore::default();
        assert!(svc.predict(&empty, "A", "B", "Lotus").is_fallback());
        assert!(svc.predict(&store(), "LOUD", "LOUD", "Lotus").is_fallback());
        assert!(svc.predict(&store(), "", "LOUD", "Lotus").is_fallback());

        let p = svc.predict(&empty, "  Sentinels ", " LOUD", "Lotus  ");
        assert!(p.is_fallback());
        assert_eq!((p.team_a.as_str(), p.team_b.as_str()), ("Sentinels", "LOUD"));
        assert_eq!(p.map, "Lotus");
        assert!(p.explanation.starts_with("Sentinels vs LOUD on Lotus:"));
    }

    #[test]
    fn attribution_is_standardized_feature_times_weight() {
        let svc = service(0.0);
        let p = svc.predict(&store(), "Sentinels", "LOUD", "Lotus");
        assert!(!p.is_fallback());
        assert_eq!(p.as_of, NaiveDate::from_ymd_opt(2024, 5, 16));
        assert!(p.prob_team_a > 0.5);
        assert!((p.prob_team_a + p.prob_team_b - 1.0).abs() < 1e-12);

        let a = artifact(0.0);
        let values = p.features.values();
        for (i, f) in p.factor_contribution.iter().enumerate() {
            let expected = values[i] / a.scaler.scale[i] * a.classifier.coefficients[i];
            assert!((f.contribution - expected).abs() < 1e-12);
        }
        assert!(p.explanation.starts_with("Sentinels vs LOUD on Lotus: Sentinels win prob = "));
        assert!(p.explanation.contains("mapElo_diff("));
    }

    #[test]
    fn symmetric_wrapper_sums_to_one_and_reports_bias() {
        let biased = service(0.4);
        let s = biased.predict_symmetric(&store(), "Sentinels", "LOUD", "Lotus");
        let mirror = biased.predict_symmetric(&store(), "LOUD", "Sentinels", "Lotus");
        assert!((s.prob_team_a + mirror.prob_team_a - 1.0).abs() < 1e-12);
        assert!(s.asymmetry_detected);
        assert!(s.raw_asymmetry > 0.001);

        let fair = service(0.0);
        let s = fair.predict_symmetric(&store(), "Sentinels", "LOUD", "Lotus");
        assert!(!s.asymmetry_detected);
    }

    #[test]
    fn strategy_shifts_the_logit() {
        let base = service(0.0);
        let tilted = service(0.0)
            .with_strategy(Box::new(SosTilt { weight: 2.0 }));
        let p0 = base.predict(&store(), "Sentinels", "LOUD", "Lotus");
        let p1 = tilted.predict(&store(), "Sentinels", "LOUD", "Lotus");
        assert!(p0.features.sos_elo_diff > 0.0);
        assert!(p1.prob_team_a > p0.prob_team_a);
    }

    #[test]
    fn uncertainty_thresholds() {
        assert_eq!(Uncertainty::from_prob(0.75), Uncertainty::Low);
        assert_eq!(Uncertainty::from_prob(0.25), Uncertainty::Low);
        assert_eq!(Uncertainty::from_prob(0.65), Uncertainty::Medium);
        assert_eq!(Uncertainty::from_prob(0.55), Uncertainty::High);
    }
}
