use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ForecastConfig;
use crate::dataset::DatasetFilter;
use crate::match_record::MatchRecord;
use crate::store::HistoricalMatchStore;
use crate::upstream::{FetchedMatch, MatchSource, VlrClient};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchResult {
    Win,
    Loss,
}

impl MatchResult {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchResult::Win => "win",
            MatchResult::Loss => "loss",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("win") {
            MatchResult::Win
        } else {
            MatchResult::Loss
        }
    }
}

/// One map from one team's point of view, as held in the durable cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub team: String,
    pub match_date: NaiveDate,
    pub opponent: String,
    pub map: String,
    pub result: MatchResult,
    pub tournament: String,
    pub region: String,
    pub cached_at: String,
    /// JSON of the fetched match, kept for audit and for rebuilding records.
    pub raw_payload: String,
}

impl CacheRecord {
    fn key(&self) -> (NaiveDate, String, String) {
        (self.match_date, self.opponent.clone(), self.map.clone())
    }

    pub fn decode(&self) -> Result<MatchRecord> {
        let fetched: FetchedMatch = serde_json::from_str(&self.raw_payload)
            .with_context(|| format!("decode cached payload for {}", self.team))?;
        Ok(fetched.record)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_records: usize,
    pub unique_teams: usize,
    pub recent_records_24h: usize,
    pub oldest_cache: Option<String>,
    pub database_size_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LiveCacheConfig {
    pub max_age: TimeDelta,
    pub min_rows: usize,
    pub retention_days: i64,
    /// Run a retention pass on roughly one request in this many.
    pub prune_one_in: u32,
}

impl Default for LiveCacheConfig {
    fn default() -> Self {
        Self {
            max_age: TimeDelta::hours(24),
            min_rows: 5,
            retention_days: 30,
            prune_one_in: 10,
        }
    }
}

/// Staleness-aware cache in front of a [`MatchSource`].
///
/// Each call opens its own connection and each team's writes commit in one
/// transaction. Rows are keyed by (team, date, opponent, map) and upserted,
/// so concurrent refreshes of the same team converge on the same rows.
pub struct LiveCache {
    db_path: PathBuf,
    source: Arc<dyn MatchSource>,
    cfg: LiveCacheConfig,
}

impl LiveCache {
    pub fn open(
        db_path: impl Into<PathBuf>,
        source: Arc<dyn MatchSource>,
        cfg: LiveCacheConfig,
    ) -> Result<Self> {
        let cache = Self {
            db_path: db_path.into(),
            source,
            cfg,
        };
        let conn = cache.connect()?;
        init_schema(&conn)?;
        info!(path = %cache.db_path.display(), "initialized live cache");
        Ok(cache)
    }

    /// Cache backed by the configured database and the public VLR API.
    pub fn from_config(cfg: &ForecastConfig) -> Result<Self> {
        let client = VlrClient::from_config(cfg)?;
        Self::open(cfg.cache_db_path.clone(), Arc::new(client), LiveCacheConfig::default())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn team_data(&self, team: &str, lookback_days: i64) -> Result<Vec<CacheRecord>> {
        self.team_data_at(team, lookback_days, Utc::now())
    }

    /// Cached rows for `team`, refreshed from upstream when empty, older than
    /// `max_age`, or thinner than `min_rows`. Upstream failure serves the cache.
    /// Newest first.
    pub fn team_data_at(
        &self,
        team: &str,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>> {
        let cached = self.cached_rows(team, lookback_days, now)?;
        let age = self.last_cached_at(team)?.map(|at| now - at);
        let stale = cached.is_empty()
            || age.is_none_or(|a| a > self.cfg.max_age)
            || cached.len() < self.cfg.min_rows;
        if !stale {
            debug!(team, rows = cached.len(), "serving cached team data");
            return Ok(cached);
        }

        info!(
            team,
            cached = cached.len(),
            age_hours = age.map(|a| a.num_minutes() as f64 / 60.0),
            "refreshing team data"
        );
        let fetched = match self.source.fetch_team_matches(team, lookback_days) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(team, error = %err, "upstream fetch failed; serving cache");
                return Ok(cached);
            }
        };
        if fetched.is_empty() {
            warn!(team, "upstream returned no maps");
            return Ok(cached);
        }

        let fresh = to_cache_records(team, &fetched, now);
        if let Err(err) = self.upsert(&fresh) {
            warn!(team, error = %err, "failed to persist fresh rows");
        }

        let since = lookback_start(now, lookback_days);
        let mut merged: BTreeMap<(NaiveDate, String, String), CacheRecord> = BTreeMap::new();
        for row in cached.into_iter().chain(fresh) {
            if row.match_date >= since {
                merged.insert(row.key(), row);
            }
        }
        let mut out: Vec<CacheRecord> = merged.into_values().collect();
        out.sort_by(|a, b| b.match_date.cmp(&a.match_date));
        Ok(out)
    }

    /// Upserts rows in one transaction. Returns the number written.
    pub fn upsert(&self, rows: &[CacheRecord]) -> Result<usize> {
        let mut conn = self.connect()?;
        // Take the write lock up front so competing writers wait on the busy timeout.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin cache transaction")?;
        for row in rows {
            upsert_row(&tx, row)?;
        }
        tx.commit().context("commit cache transaction")?;
        Ok(rows.len())
    }

    pub fn cached_rows(
        &self,
        team: &str,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CacheRecord>> {
        let conn = self.connect()?;
        let since = lookback_start(now, lookback_days).to_string();
        let mut stmt = conn
            .prepare(
                "SELECT team_name, match_date, opponent, map_name, result, tournament, region, cached_at, raw_data
                 FROM team_matches
                 WHERE team_name = ?1 AND match_date >= ?2
                 ORDER BY match_date DESC",
            )
            .context("prepare cached rows query")?;
        let rows = stmt
            .query_map(params![team, since], decode_row)
            .context("query cached rows")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("decode cached row")?);
        }
        Ok(out)
    }

    pub fn last_cached_at(&self, team: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connect()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT MAX(cached_at) FROM team_matches WHERE team_name = ?1",
                params![team],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .context("query cache age")?
            .flatten();
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Deletes rows whose last cache write is older than `retention_days`.
    pub fn prune(&self, retention_days: i64, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let cutoff = timestamp(now - TimeDelta::days(retention_days));
        let deleted = conn
            .execute(
                "DELETE FROM team_matches WHERE cached_at < ?1",
                params![cutoff],
            )
            .context("prune cache")?;
        if deleted > 0 {
            info!(deleted, retention_days, "pruned old cache rows");
        }
        Ok(deleted)
    }

    /// Probabilistic retention pass; errors are logged, never returned.
    pub fn maybe_prune(&self, now: DateTime<Utc>) {
        if self.cfg.prune_one_in == 0 {
            return;
        }
        if rand::thread_rng().gen_ratio(1, self.cfg.prune_one_in) {
            if let Err(err) = self.prune(self.cfg.retention_days, now) {
                warn!(error = %err, "cache prune failed");
            }
        }
    }

    /// Refreshes both teams concurrently and returns their combined history
    /// as a store, with mirrored rows collapsed to one record per map.
    pub fn history_for_pair(
        &self,
        team_a: &str,
        team_b: &str,
        lookback_days: i64,
    ) -> Result<HistoricalMatchStore> {
        let now = Utc::now();
        let (rows_a, rows_b) = rayon::join(
            || self.team_data_at(team_a, lookback_days, now),
            || self.team_data_at(team_b, lookback_days, now),
        );
        let (rows_a, rows_b) = (rows_a?, rows_b?);
        self.maybe_prune(now);
        info!(team_a, maps_a = rows_a.len(), team_b, maps_b = rows_b.len(), "pair history");
        Ok(HistoricalMatchStore::new(decode_unique(
            rows_a.iter().chain(rows_b.iter()),
        )))
    }

    /// Pair history restricted to the population training saw: the same map
    /// pool and tier filter, and the per-region allow-list ranked over the
    /// whole cache.
    pub fn history_for_pair_filtered(
        &self,
        team_a: &str,
        team_b: &str,
        lookback_days: i64,
        filter: &DatasetFilter,
    ) -> Result<HistoricalMatchStore> {
        let pair = self.history_for_pair(team_a, team_b, lookback_days)?;
        let records = pair.records().to_vec();
        let kept = if filter.top_teams_per_region.is_some() {
            filter.apply_ranked_by(records, &self.all_records()?)
        } else {
            filter.apply(records)
        };
        Ok(HistoricalMatchStore::new(kept))
    }

    /// Every cached map, decoded and deduplicated. Used for live-mode training.
    pub fn all_records(&self) -> Result<Vec<MatchRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT team_name, match_date, opponent, map_name, result, tournament, region, cached_at, raw_data
                 FROM team_matches
                 ORDER BY match_date ASC",
            )
            .context("prepare cache scan")?;
        let rows = stmt.query_map([], decode_row).context("scan cache")?;
        let mut cached = Vec::new();
        for row in rows {
            cached.push(row.context("decode cached row")?);
        }
        Ok(decode_unique(cached.iter()))
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats> {
        let conn = self.connect()?;
        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<usize> {
            let n: i64 = conn.query_row(sql, p, |row| row.get(0)).context("cache stats")?;
            Ok(n.max(0) as usize)
        };
        let recent_cutoff = timestamp(now - TimeDelta::hours(24));
        let oldest_cache: Option<String> = conn
            .query_row("SELECT MIN(cached_at) FROM team_matches", [], |row| row.get(0))
            .context("cache stats")?;
        Ok(CacheStats {
            total_records: count("SELECT COUNT(*) FROM team_matches", &[])?,
            unique_teams: count("SELECT COUNT(DISTINCT team_name) FROM team_matches", &[])?,
            recent_records_24h: count(
                "SELECT COUNT(*) FROM team_matches WHERE cached_at >= ?1",
                &[&recent_cutoff],
            )?,
            oldest_cache,
            database_size_bytes: std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0),
        })
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("open sqlite db {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("set sqlite busy timeout")?;
        Ok(conn)
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS team_matches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_name TEXT NOT NULL,
            match_date TEXT NOT NULL,
            opponent TEXT NOT NULL,
            map_name TEXT NOT NULL,
            result TEXT NOT NULL,
            tournament TEXT NULL,
            region TEXT NULL,
            cached_at TEXT NOT NULL,
            raw_data TEXT NULL,
            UNIQUE(team_name, match_date, opponent, map_name)
        );
        CREATE INDEX IF NOT EXISTS idx_team_date ON team_matches(team_name, match_date);
        CREATE INDEX IF NOT EXISTS idx_cached_at ON team_matches(cached_at);
        "#,
    )
    .context("create cache schema")?;
    Ok(())
}

fn upsert_row(tx: &rusqlite::Transaction<'_>, row: &CacheRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO team_matches (
            team_name, match_date, opponent, map_name, result, tournament, region, cached_at, raw_data
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(team_name, match_date, opponent, map_name) DO UPDATE SET
            result = excluded.result,
            tournament = excluded.tournament,
            region = excluded.region,
            cached_at = excluded.cached_at,
            raw_data = excluded.raw_data",
        params![
            row.team,
            row.match_date.to_string(),
            row.opponent,
            row.map,
            row.result.as_str(),
            row.tournament,
            row.region,
            row.cached_at,
            row.raw_payload,
        ],
    )
    .with_context(|| format!("upsert cache row for {}", row.team))?;
    Ok(())
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheRecord> {
    let date_raw: String = row.get(1)?;
    let match_date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let result: String = row.get(4)?;
    Ok(CacheRecord {
        team: row.get(0)?,
        match_date,
        opponent: row.get(2)?,
        map: row.get(3)?,
        result: MatchResult::parse(&result),
        tournament: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        region: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        cached_at: row.get(7)?,
        raw_payload: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
    })
}

fn to_cache_records(team: &str, fetched: &[FetchedMatch], now: DateTime<Utc>) -> Vec<CacheRecord> {
    let cached_at = timestamp(now);
    fetched
        .iter()
        .filter_map(|m| {
            let opponent = m.record.opponent_of(team)?;
            let raw_payload = serde_json::to_string(m).ok()?;
            Some(CacheRecord {
                team: team.to_string(),
                match_date: m.record.date,
                opponent: opponent.to_string(),
                map: m.record.map.clone(),
                result: if m.record.won_by(team) {
                    MatchResult::Win
                } else {
                    MatchResult::Loss
                },
                tournament: m.tournament.clone(),
                region: m.record.region.clone(),
                cached_at: cached_at.clone(),
                raw_payload,
            })
        })
        .collect()
}

// Both teams cache the same map; keep one record per canonical key.
fn decode_unique<'a>(rows: impl Iterator<Item = &'a CacheRecord>) -> Vec<MatchRecord> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        match row.decode() {
            Ok(record) => {
                if seen.insert(record.canonical_key()) {
                    out.push(record);
                }
            }
            Err(err) => debug!(team = %row.team, error = %err, "skipping undecodable cache row"),
        }
    }
    out
}

fn lookback_start(now: DateTime<Utc>, lookback_days: i64) -> NaiveDate {
    (now - TimeDelta::days(lookback_days)).date_naive()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
