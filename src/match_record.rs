use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// Competitive level. Tier 1 scales rating updates up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    One,
    Two,
}

impl Tier {
    /// Reads a dataset cell. Blank or non-numeric cells default to tier 2;
    /// a number other than 1 or 2 is `None` and the row is not usable.
    pub fn from_cell(raw: &str) -> Option<Self> {
        match raw.trim().parse::<f64>() {
            Ok(v) if v == 1.0 => Some(Tier::One),
            Ok(v) if v == 2.0 => Some(Tier::Two),
            Ok(v) if v.is_finite() => None,
            _ => Some(Tier::Two),
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::One),
            2 => Ok(Tier::Two),
            other => Err(format!("tier must be 1 or 2, got {other}")),
        }
    }
}

impl From<Tier> for u8 {
    fn from(value: Tier) -> Self {
        match value {
            Tier::One => 1,
            Tier::Two => 2,
        }
    }
}

/// Per-map performance line for one side. `None` means not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamPerf {
    pub acs: Option<f64>,
    pub kd: Option<f64>,
}

/// One completed map between two teams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub date: NaiveDate,
    pub team_a: String,
    pub team_b: String,
    pub winner: String,
    pub map: String,
    pub region: String,
    pub tier: Tier,
    pub team_a_perf: TeamPerf,
    pub team_b_perf: TeamPerf,
}

impl MatchRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        date: NaiveDate,
        team_a: impl Into<String>,
        team_b: impl Into<String>,
        winner: impl Into<String>,
        map: impl Into<String>,
        region: impl Into<String>,
        tier: Tier,
        team_a_perf: TeamPerf,
        team_b_perf: TeamPerf,
    ) -> Result<Self> {
        let record = Self {
            date,
            team_a: team_a.into(),
            team_b: team_b.into(),
            winner: winner.into(),
            map: map.into(),
            region: region.into(),
            tier,
            team_a_perf,
            team_b_perf,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<()> {
        if self.team_a == self.team_b {
            return Err(ForecastError::InvalidRecord(format!(
                "{} cannot play itself",
                self.team_a
            )));
        }
        if self.winner != self.team_a && self.winner != self.team_b {
            return Err(ForecastError::InvalidRecord(format!(
                "winner {} is neither {} nor {}",
                self.winner, self.team_a, self.team_b
            )));
        }
        Ok(())
    }

    pub fn involves(&self, team: &str) -> bool {
        self.team_a == team || self.team_b == team
    }

    pub fn won_by(&self, team: &str) -> bool {
        self.winner == team
    }

    pub fn opponent_of(&self, team: &str) -> Option<&str> {
        if self.team_a == team {
            Some(&self.team_b)
        } else if self.team_b == team {
            Some(&self.team_a)
        } else {
            None
        }
    }

    pub fn perf_of(&self, team: &str) -> Option<TeamPerf> {
        if self.team_a == team {
            Some(self.team_a_perf)
        } else if self.team_b == team {
            Some(self.team_b_perf)
        } else {
            None
        }
    }

    /// Same map seen from the other side. Used to collapse mirrored cache rows.
    pub fn canonical_key(&self) -> (NaiveDate, String, String, String) {
        let (lo, hi) = if self.team_a <= self.team_b {
            (&self.team_a, &self.team_b)
        } else {
            (&self.team_b, &self.team_a)
        };
        (self.date, lo.clone(), hi.clone(), self.map.clone())
    }
}
