use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate};
use csv::StringRecord;
use tracing::{debug, info};

use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::match_record::{MatchRecord, TeamPerf, Tier};
use crate::store::HistoricalMatchStore;

pub const REQUIRED_COLUMNS: [&str; 11] = [
    "date",
    "teamA",
    "teamB",
    "winner",
    "map_name",
    "region",
    "tier",
    "teamA_ACS",
    "teamB_ACS",
    "teamA_KD",
    "teamB_KD",
];

/// Which rows survive after a load.
#[derive(Debug, Clone, Default)]
pub struct DatasetFilter {
    pub map_pool: Option<HashSet<String>>,
    pub only_tier1: bool,
    pub top_teams_per_region: Option<usize>,
}

impl DatasetFilter {
    pub fn from_config(cfg: &ForecastConfig) -> Self {
        Self {
            map_pool: Some(cfg.map_pool.iter().cloned().collect()),
            only_tier1: cfg.only_tier1,
            top_teams_per_region: cfg.filter_top_teams.then_some(cfg.top_teams_per_region),
        }
    }

    pub fn apply(&self, records: Vec<MatchRecord>) -> Vec<MatchRecord> {
        let before = records.len();
        let out: Vec<MatchRecord> = records.into_iter().filter(|r| self.keeps(r)).collect();
        let allowed = self
            .top_teams_per_region
            .map(|top_n| top_teams_by_region(&out, top_n));
        self.finish(before, out, allowed)
    }

    /// Like [`DatasetFilter::apply`], but ranks teams for the per-region
    /// allow-list over `population` rather than over `records` alone.
    pub fn apply_ranked_by(
        &self,
        records: Vec<MatchRecord>,
        population: &[MatchRecord],
    ) -> Vec<MatchRecord> {
        let before = records.len();
        let out: Vec<MatchRecord> = records.into_iter().filter(|r| self.keeps(r)).collect();
        let allowed = self.top_teams_per_region.map(|top_n| {
            let ranked: Vec<MatchRecord> =
                population.iter().filter(|r| self.keeps(r)).cloned().collect();
            top_teams_by_region(&ranked, top_n)
        });
        self.finish(before, out, allowed)
    }

    fn keeps(&self, r: &MatchRecord) -> bool {
        self.map_pool.as_ref().is_none_or(|pool| pool.contains(&r.map))
            && (!self.only_tier1 || r.tier == Tier::One)
    }

    fn finish(
        &self,
        before: usize,
        mut out: Vec<MatchRecord>,
        allowed: Option<HashMap<String, HashSet<String>>>,
    ) -> Vec<MatchRecord> {
        if let Some(allowed) = allowed {
            out.retain(|r| {
                allowed.get(&r.region).is_some_and(|teams| {
                    teams.contains(r.team_a.as_str()) && teams.contains(r.team_b.as_str())
                })
            });
        }
        info!(before, after = out.len(), "applied dataset filters");
        out
    }
}

/// Per region, the `top_n` teams by number of appearances (ties broken by name).
pub fn top_teams_by_region(records: &[MatchRecord], top_n: usize) -> HashMap<String, HashSet<String>> {
    let mut counts: HashMap<&str, HashMap<&str, usize>> = HashMap::new();
    for r in records {
        let region = counts.entry(r.region.as_str()).or_default();
        *region.entry(r.team_a.as_str()).or_insert(0) += 1;
        *region.entry(r.team_b.as_str()).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|(region, teams)| {
            let mut ranked: Vec<(&str, usize)> = teams.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
            let keep = ranked
                .into_iter()
                .take(top_n)
                .map(|(t, _)| t.to_string())
                .collect();
            (region.to_string(), keep)
        })
        .collect()
}

/// Loads the bulk file named by `cfg` and applies its filters.
pub fn load_filtered(cfg: &ForecastConfig, path: &Path) -> Result<HistoricalMatchStore> {
    let records = load_csv_path(path)?;
    Ok(HistoricalMatchStore::new(
        DatasetFilter::from_config(cfg).apply(records),
    ))
}

pub fn load_csv_path(path: &Path) -> Result<Vec<MatchRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open bulk dataset {}", path.display()))?;
    let records = load_csv(file).with_context(|| format!("load {}", path.display()))?;
    info!(path = %path.display(), rows = records.len(), "loaded bulk dataset");
    Ok(records)
}

/// Parses the bulk schema. Missing columns and malformed rows are fatal.
pub fn load_csv<R: Read>(reader: R) -> Result<Vec<MatchRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers().context("read csv header")?.clone();
    let columns = ColumnIndex::resolve(&headers)?;

    let mut out = Vec::new();
    let mut dropped = 0usize;
    for row in rdr.records() {
        let row = row.context("read csv row")?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        match columns.decode(&row, line)? {
            Some(record) => out.push(record),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        info!(dropped, "dropped rows with a tier outside 1 and 2");
    }
    Ok(out)
}

struct ColumnIndex {
    idx: [usize; REQUIRED_COLUMNS.len()],
}

impl ColumnIndex {
    fn resolve(headers: &StringRecord) -> std::result::Result<Self, ForecastError> {
        let mut idx = [0usize; REQUIRED_COLUMNS.len()];
        let mut missing = Vec::new();
        for (slot, name) in REQUIRED_COLUMNS.iter().enumerate() {
            match headers.iter().position(|h| h == *name) {
                Some(pos) => idx[slot] = pos,
                None => missing.push(name.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(ForecastError::Schema { missing });
        }
        Ok(Self { idx })
    }

    fn field<'r>(&self, row: &'r StringRecord, slot: usize) -> &'r str {
        row.get(self.idx[slot]).unwrap_or("")
    }

    /// `Ok(None)` for a row whose tier is a number other than 1 or 2.
    fn decode(
        &self,
        row: &StringRecord,
        line: u64,
    ) -> std::result::Result<Option<MatchRecord>, ForecastError> {
        let invalid = |reason: String| ForecastError::InvalidRow { line, reason };

        let date = parse_date(self.field(row, 0))
            .ok_or_else(|| invalid(format!("bad date {:?}", self.field(row, 0))))?;
        let tier_raw = self.field(row, 6);
        let Some(tier) = Tier::from_cell(tier_raw) else {
            debug!(line, tier = tier_raw, "dropping row with unknown tier");
            return Ok(None);
        };

        let num = |slot: usize| -> std::result::Result<Option<f64>, ForecastError> {
            let raw = self.field(row, slot);
            if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
                return Ok(None);
            }
            raw.parse::<f64>()
                .map(Some)
                .map_err(|_| invalid(format!("{} is not numeric: {raw:?}", REQUIRED_COLUMNS[slot])))
        };

        let team_a_perf = TeamPerf {
            acs: num(7)?,
            kd: num(9)?,
        };
        let team_b_perf = TeamPerf {
            acs: num(8)?,
            kd: num(10)?,
        };

        MatchRecord::new(
            date,
            self.field(row, 1),
            self.field(row, 2),
            self.field(row, 3),
            self.field(row, 4),
            self.field(row, 5),
            tier,
            team_a_perf,
            team_b_perf,
        )
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
    }
}

/// `YYYY-MM-DD`, a naive timestamp, or RFC 3339; always truncated to the day.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc().date());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::NaiveDate;

    use super::{DatasetFilter, load_csv, parse_date};
    use crate::error::ForecastError;
    use crate::match_record::Tier;

    const HEADER: &str =
        "date,teamA,teamB,winner,map_name,region,tier,teamA_ACS,teamB_ACS,teamA_KD,teamB_KD\n";

    #[test]
    fn missing_columns_are_reported_together() {
        let csv = "date,teamA,teamB,winner,map_name,region\n2024-01-01,A,B,A,Ascent,NA\n";
        let err = load_csv(csv.as_bytes()).unwrap_err();
        match err.downcast_ref::<ForecastError>() {
            Some(ForecastError::Schema { missing }) => {
                assert_eq!(missing.len(), 5);
                assert!(missing.contains(&"tier".to_string()));
            }
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn empty_perf_cells_are_unknown_and_blank_tier_defaults_to_two() {
        let csv = format!("{HEADER}2024-01-01,A,B,B,Ascent,EMEA,,210.5,,1.1,\n");
        let rows = load_csv(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tier, Tier::Two);
        assert_eq!(rows[0].team_a_perf.acs, Some(210.5));
        assert_eq!(rows[0].team_b_perf.acs, None);
        assert_eq!(rows[0].team_b_perf.kd, None);
    }

    #[test]
    fn numeric_tier_outside_one_and_two_drops_the_row() {
        let csv = format!(
            "{HEADER}\
             2024-01-01,A,B,A,Ascent,EMEA,3,,,,\n\
             2024-01-02,A,B,B,Bind,EMEA,1,,,,\n\
             2024-01-03,A,B,A,Lotus,EMEA,n/a,,,,\n"
        );
        let rows = load_csv(csv.as_bytes()).unwrap();
        let tiers: Vec<(&str, Tier)> = rows.iter().map(|r| (r.map.as_str(), r.tier)).collect();
        assert_eq!(tiers, vec![("Bind", Tier::One), ("Lotus", Tier::Two)]);
    }

    #[test]
    fn bad_winner_is_fatal() {
        let csv = format!("{HEADER}2024-01-01,A,B,C,Ascent,EMEA,1,,,,\n");
        let err = load_csv(csv.as_bytes()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ForecastError>(),
            Some(ForecastError::InvalidRow { .. })
        ));
    }

    #[test]
    fn filters_apply_map_pool_tier_and_top_teams() {
        let csv = format!(
            "{HEADER}\
             2024-01-01,A,B,A,Ascent,NA,1,,,,\n\
             2024-01-02,A,C,A,Ascent,NA,1,,,,\n\
             2024-01-03,A,B,B,Pearl,NA,1,,,,\n\
             2024-01-04,B,D,D,Bind,NA,2,,,,\n\
             2024-01-05,A,B,A,Bind,NA,1,,,,\n"
        );
        let rows = load_csv(csv.as_bytes()).unwrap();
        let filter = DatasetFilter {
            map_pool: Some(HashSet::from(["Ascent".to_string(), "Bind".to_string()])),
            only_tier1: true,
            top_teams_per_region: Some(2),
        };
        let kept = filter.apply(rows);
        // A and B are the two most frequent NA teams once Pearl and tier 2 are gone.
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.involves("A") && r.involves("B")));
    }

    #[test]
    fn dates_are_truncated_to_day() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert_eq!(parse_date("2024-05-06"), Some(d));
        assert_eq!(parse_date("2024-05-06T23:10:00Z"), Some(d));
        assert_eq!(parse_date("2024-05-06 10:00:00"), Some(d));
        assert_eq!(parse_date("06/05/2024"), None);
    }
}
