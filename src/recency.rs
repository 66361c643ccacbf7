use chrono::NaiveDate;

use crate::match_record::{MatchRecord, TeamPerf};
use crate::store::HistoricalMatchStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecencyConfig {
    /// Days for a win-rate (and perf-average) weight to halve.
    pub win_rate_half_life: f64,
    /// e-folding time, in days, of head-to-head weights.
    pub h2h_tau: f64,
    /// Pseudo-count pulling the head-to-head score toward zero.
    pub h2h_lambda: f64,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            win_rate_half_life: 60.0,
            h2h_tau: 60.0,
            h2h_lambda: 7.0,
        }
    }
}

impl RecencyConfig {
    /// Short events move faster than a season.
    pub fn tournament() -> Self {
        Self {
            win_rate_half_life: 30.0,
            ..Self::default()
        }
    }
}

/// Recency-weighted statistics. Every read goes through `store.as_of`.
#[derive(Debug, Clone, Copy)]
pub struct RecencyStats<'s> {
    store: &'s HistoricalMatchStore,
    cfg: RecencyConfig,
}

impl<'s> RecencyStats<'s> {
    pub fn new(store: &'s HistoricalMatchStore, cfg: RecencyConfig) -> Self {
        Self { store, cfg }
    }

    /// `None` when the team has never played the map before `as_of`.
    pub fn decayed_win_rate(&self, team: &str, map: &str, as_of: NaiveDate) -> Option<f64> {
        let snap = self.store.as_of(as_of).on_map(map).involving(team);
        let mut num = 0.0_f64;
        let mut den = 0.0_f64;
        for r in snap.iter() {
            let w = half_life_weight(days_before(r, as_of), self.cfg.win_rate_half_life);
            if r.won_by(team) {
                num += w;
            }
            den += w;
        }
        (den > 0.0).then(|| num / den)
    }

    /// Signed, exponentially weighted meeting record of `team_a` against
    /// `team_b`, shrunk by `n / (n + lambda)`. Exactly 0.0 with no meetings.
    pub fn shrunk_head_to_head(
        &self,
        team_a: &str,
        team_b: &str,
        map: &str,
        as_of: NaiveDate,
    ) -> f64 {
        let snap = self.store.as_of(as_of).on_map(map).between(team_a, team_b);
        let n = snap.len();
        if n == 0 {
            return 0.0;
        }
        let mut num = 0.0_f64;
        let mut den = 0.0_f64;
        for r in snap.iter() {
            let w = (-days_before(r, as_of) / self.cfg.h2h_tau).exp();
            let sign = if r.won_by(team_a) { 1.0 } else { -1.0 };
            num += w * sign;
            den += w;
        }
        let raw = if den > 0.0 { num / den } else { 0.0 };
        raw * shrinkage(n, self.cfg.h2h_lambda)
    }

    /// Recency-weighted average of one of the team's own per-map metrics.
    /// Maps where the metric was not reported are skipped, not counted as zero.
    pub fn decayed_metric(
        &self,
        team: &str,
        map: &str,
        as_of: NaiveDate,
        metric: impl Fn(&TeamPerf) -> Option<f64>,
    ) -> Option<f64> {
        let snap = self.store.as_of(as_of).on_map(map).involving(team);
        let mut num = 0.0_f64;
        let mut den = 0.0_f64;
        for r in snap.iter() {
            let Some(value) = r.perf_of(team).as_ref().and_then(&metric) else {
                continue;
            };
            let w = half_life_weight(days_before(r, as_of), self.cfg.win_rate_half_life);
            num += w * value;
            den += w;
        }
        (den > 0.0).then(|| num / den)
    }
}

pub fn half_life_weight(delta_days: f64, half_life: f64) -> f64 {
    0.5_f64.powf(delta_days / half_life)
}

pub fn shrinkage(n: usize, lambda: f64) -> f64 {
    let n = n as f64;
    n / (n + lambda)
}

fn days_before(r: &MatchRecord, as_of: NaiveDate) -> f64 {
    (as_of - r.date).num_days() as f64
}
