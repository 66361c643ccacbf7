use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::elo::{EloConfig, EloRatingEngine};
use crate::error::Result;
use crate::match_record::{MatchRecord, TeamPerf};
use crate::recency::{RecencyConfig, RecencyStats};
use crate::store::HistoricalMatchStore;

pub const FEATURE_COLUMNS: [&str; 5] = [
    "winrate_diff",
    "h2h_shrunk",
    "sos_elo_diff",
    "acs_diff",
    "kd_diff",
];

pub const NEUTRAL_WIN_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub winrate_diff: f64,
    pub h2h_shrunk: f64,
    pub sos_elo_diff: f64,
    pub acs_diff: f64,
    pub kd_diff: f64,
    /// 1 if team A won; only set for historical rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<u8>,
}

impl FeatureVector {
    /// Values in `FEATURE_COLUMNS` order.
    pub fn values(&self) -> [f64; 5] {
        [
            self.winrate_diff,
            self.h2h_shrunk,
            self.sos_elo_diff,
            self.acs_diff,
            self.kd_diff,
        ]
    }
}

/// One training row: a historical map and the features known the day it was played.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub date: NaiveDate,
    pub team_a: String,
    pub team_b: String,
    pub map: String,
    pub features: FeatureVector,
}

impl FeatureRow {
    pub fn label(&self) -> u8 {
        self.features.label.unwrap_or(0)
    }
}

pub struct FeatureVectorBuilder<'s> {
    store: &'s HistoricalMatchStore,
    recency: RecencyStats<'s>,
    elo_cfg: EloConfig,
}

impl<'s> FeatureVectorBuilder<'s> {
    pub fn new(store: &'s HistoricalMatchStore, recency: RecencyConfig, elo_cfg: EloConfig) -> Self {
        Self {
            store,
            recency: RecencyStats::new(store, recency),
            elo_cfg,
        }
    }

    /// Features for a (possibly hypothetical) matchup, using only records before `as_of`.
    pub fn build(
        &self,
        team_a: &str,
        team_b: &str,
        map: &str,
        as_of: NaiveDate,
    ) -> Result<FeatureVector> {
        let elo = EloRatingEngine::replay(self.elo_cfg, self.store.as_of(as_of).iter())?;
        Ok(self.build_with_elo(&elo, team_a, team_b, map, as_of))
    }

    /// Same as [`Self::build`] but against an Elo state the caller has replayed
    /// up to (and excluding) `as_of`.
    pub fn build_with_elo(
        &self,
        elo: &EloRatingEngine,
        team_a: &str,
        team_b: &str,
        map: &str,
        as_of: NaiveDate,
    ) -> FeatureVector {
        let wr_a = self
            .recency
            .decayed_win_rate(team_a, map, as_of)
            .unwrap_or(NEUTRAL_WIN_RATE);
        let wr_b = self
            .recency
            .decayed_win_rate(team_b, map, as_of)
            .unwrap_or(NEUTRAL_WIN_RATE);

        FeatureVector {
            winrate_diff: wr_a - wr_b,
            h2h_shrunk: self.recency.shrunk_head_to_head(team_a, team_b, map, as_of),
            sos_elo_diff: elo.sos_diff(team_a, team_b, map, as_of),
            acs_diff: self.metric_diff(team_a, team_b, map, as_of, |p| p.acs),
            kd_diff: self.metric_diff(team_a, team_b, map, as_of, |p| p.kd),
            label: None,
        }
    }

    /// One labelled row per stored map. Elo advances one calendar day at a
    /// time, so every row only sees ratings from strictly earlier days.
    pub fn build_feature_table(&self) -> Result<Vec<FeatureRow>> {
        let records = self.store.records();
        let mut elo = EloRatingEngine::new(self.elo_cfg);
        let mut out = Vec::with_capacity(records.len());

        for day in records.chunk_by(|a, b| a.date == b.date) {
            let rows: Vec<FeatureRow> = day
                .par_iter()
                .map(|m| self.labelled_row(&elo, m))
                .collect();
            out.extend(rows);
            for m in day {
                elo.update(m)?;
            }
        }

        debug!(rows = out.len(), "built feature table");
        Ok(out)
    }

    fn labelled_row(&self, elo: &EloRatingEngine, m: &MatchRecord) -> FeatureRow {
        let mut features = self.build_with_elo(elo, &m.team_a, &m.team_b, &m.map, m.date);
        features.label = Some(u8::from(m.won_by(&m.team_a)));
        FeatureRow {
            date: m.date,
            team_a: m.team_a.clone(),
            team_b: m.team_b.clone(),
            map: m.map.clone(),
            features,
        }
    }

    fn metric_diff(
        &self,
        team_a: &str,
        team_b: &str,
        map: &str,
        as_of: NaiveDate,
        metric: fn(&TeamPerf) -> Option<f64>,
    ) -> f64 {
        let a = self.recency.decayed_metric(team_a, map, as_of, metric);
        let b = self.recency.decayed_metric(team_b, map, as_of, metric);
        match (a, b) {
            (Some(a), Some(b)) => a - b,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::FeatureVectorBuilder;
    use crate::elo::EloConfig;
    use crate::match_record::{MatchRecord, TeamPerf, Tier};
    use crate::recency::RecencyConfig;
    use crate::store::HistoricalMatchStore;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn rec(day: u32, a: &str, b: &str, winner: &str, a_acs: f64, b_acs: f64) -> MatchRecord {
        MatchRecord::new(
            d(day),
            a,
            b,
            winner,
            "Split",
            "NA",
            Tier::One,
            TeamPerf {
                acs: Some(a_acs),
                kd: Some(1.2),
            },
            TeamPerf {
                acs: Some(b_acs),
                kd: Some(0.9),
            },
        )
        .unwrap()
    }

    #[test]
    fn strangers_get_neutral_features() {
        let store = HistoricalMatchStore::new(vec![rec(1, "A", "B", "A", 230.0, 190.0)]);
        let builder =
            FeatureVectorBuilder::new(&store, RecencyConfig::default(), EloConfig::default());
        let fv = builder.build("X", "Y", "Split", d(10)).unwrap();
        assert_eq!(fv.winrate_diff, 0.0);
        assert_eq!(fv.sos_elo_diff, 0.0);
        assert_eq!(fv.h2h_shrunk, 0.0);
        assert_eq!(fv.acs_diff, 0.0);
        assert_eq!(fv.kd_diff, 0.0);
    }

    #[test]
    fn one_sided_history_defaults_other_side_to_half() {
        let store = HistoricalMatchStore::new(vec![rec(1, "A", "B", "A", 230.0, 190.0)]);
        let builder =
            FeatureVectorBuilder::new(&store, RecencyConfig::default(), EloConfig::default());
        let fv = builder.build("A", "Z", "Split", d(2)).unwrap();
        assert!((fv.winrate_diff - 0.5).abs() < 1e-12);
        assert!(fv.sos_elo_diff > 0.0);
        // Z has no perf observations.
        assert_eq!(fv.acs_diff, 0.0);
    }

    #[test]
    fn table_rows_never_see_their_own_day() {
        let store = HistoricalMatchStore::new(vec![
            rec(1, "A", "B", "A", 230.0, 190.0),
            rec(1, "B", "A", "B", 250.0, 180.0),
            rec(3, "A", "B", "B", 200.0, 210.0),
        ]);
        let builder =
            FeatureVectorBuilder::new(&store, RecencyConfig::default(), EloConfig::default());
        let table = builder.build_feature_table().unwrap();
        assert_eq!(table.len(), 3);

        // Same-day rows start from nothing.
        for row in &table[..2] {
            assert_eq!(row.features.values(), [0.0; 5]);
        }
        assert_eq!(table[0].label(), 1);
        assert_eq!(table[1].label(), 1);

        // Day 3 matches a fresh as-of build exactly.
        let direct = builder.build("A", "B", "Split", d(3)).unwrap();
        assert_eq!(table[2].features.values(), direct.values());
        assert_eq!(table[2].label(), 0);
    }
}
