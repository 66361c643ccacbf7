use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::http_cache::HttpBodyCache;
use crate::match_record::{MatchRecord, TeamPerf, Tier};

const TIER1_MARKERS: [&str; 3] = ["champions", "masters", "vct"];

/// A map result as delivered by an upstream feed, plus the event it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedMatch {
    pub record: MatchRecord,
    pub tournament: String,
}

/// Anything that can supply recent map results for a team.
pub trait MatchSource: Send + Sync {
    fn fetch_team_matches(&self, team: &str, lookback_days: i64) -> Result<Vec<FetchedMatch>>;
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    data: ResultsData,
}

#[derive(Debug, Deserialize)]
struct ResultsData {
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    team1: String,
    #[serde(default)]
    team2: String,
    #[serde(default)]
    tournament_name: Option<String>,
    #[serde(default)]
    time_completed: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    maps: Vec<SegmentMap>,
}

#[derive(Debug, Deserialize)]
struct SegmentMap {
    map: String,
    #[serde(default, deserialize_with = "lenient_score")]
    score1: Option<u32>,
    #[serde(default, deserialize_with = "lenient_score")]
    score2: Option<u32>,
    #[serde(default)]
    acs1: Option<f64>,
    #[serde(default)]
    acs2: Option<f64>,
    #[serde(default)]
    kd1: Option<f64>,
    #[serde(default)]
    kd2: Option<f64>,
}

/// Blocking client for the public vlr.gg results API.
pub struct VlrClient {
    client: Client,
    base_url: String,
    retry_attempts: u32,
    backoff_base: Duration,
    body_cache: HttpBodyCache,
}

impl VlrClient {
    pub fn new(base_url: &str, timeout: Duration, retry_attempts: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_attempts: retry_attempts.max(1),
            backoff_base: Duration::from_secs(1),
            body_cache: HttpBodyCache::in_memory(),
        })
    }

    pub fn from_config(cfg: &ForecastConfig) -> Result<Self> {
        let mut client = Self::new(
            &cfg.vlr_base_url,
            Duration::from_secs(cfg.vlr_timeout_secs),
            cfg.vlr_retry_attempts,
        )?;
        if let Some(dir) = cfg.cache_db_path.parent() {
            client.body_cache = HttpBodyCache::at_path(dir.join(crate::http_cache::CACHE_FILE));
        }
        Ok(client)
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn results_url(&self) -> String {
        format!("{}/match?q=results", self.base_url)
    }

    /// GET with retries; waits `backoff_base * 2^attempt` between tries.
    fn get_with_retry(&self, url: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..self.retry_attempts {
            match self.body_cache.fetch_text(&self.client, url) {
                Ok(body) => return Ok(body),
                Err(err) => {
                    warn!(url, attempt = attempt + 1, error = %err, "upstream request failed");
                    last_err = Some(err);
                    if attempt + 1 < self.retry_attempts {
                        thread::sleep(self.backoff_base * 2u32.pow(attempt));
                    }
                }
            }
        }
        let reason = last_err
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(ForecastError::UpstreamFetch(format!("{url}: {reason}")).into())
    }
}

impl MatchSource for VlrClient {
    fn fetch_team_matches(&self, team: &str, lookback_days: i64) -> Result<Vec<FetchedMatch>> {
        let now = Utc::now();
        let body = self.get_with_retry(&self.results_url())?;
        let all = parse_results(&body, now)?;
        let since = (now - TimeDelta::days(lookback_days)).date_naive();
        let out: Vec<FetchedMatch> = all
            .into_iter()
            .filter(|m| m.record.involves(team) && m.record.date >= since)
            .collect();
        info!(team, maps = out.len(), "fetched upstream results");
        Ok(out)
    }
}

/// Decodes a results payload into one record per played map.
/// Series without per-map detail and drawn maps are skipped.
pub fn parse_results(body: &str, now: DateTime<Utc>) -> Result<Vec<FetchedMatch>> {
    let resp: ResultsResponse = serde_json::from_str(body).context("parse results payload")?;
    let mut out = Vec::new();
    let mut skipped = 0usize;

    for seg in resp.data.segments {
        let (team1, team2) = (seg.team1.trim(), seg.team2.trim());
        if team1.is_empty() || team2.is_empty() || team1 == team2 || seg.maps.is_empty() {
            skipped += 1;
            continue;
        }
        let tournament = seg
            .tournament_name
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Unknown")
            .to_string();
        let date = seg
            .time_completed
            .as_deref()
            .map(|t| parse_relative_time(t, now))
            .unwrap_or(now)
            .date_naive();
        let region = seg.region.clone().unwrap_or_else(|| "Unknown".to_string());
        let tier = tier_for_tournament(&tournament);

        for m in &seg.maps {
            // Unplayed or unreported maps carry no score; drop just that map.
            let (Some(score1), Some(score2)) = (m.score1, m.score2) else {
                skipped += 1;
                continue;
            };
            let winner = match score1.cmp(&score2) {
                std::cmp::Ordering::Greater => team1,
                std::cmp::Ordering::Less => team2,
                std::cmp::Ordering::Equal => {
                    skipped += 1;
                    continue;
                }
            };
            let record = MatchRecord::new(
                date,
                team1,
                team2,
                winner,
                m.map.trim(),
                region.as_str(),
                tier,
                TeamPerf {
                    acs: m.acs1,
                    kd: m.kd1,
                },
                TeamPerf {
                    acs: m.acs2,
                    kd: m.kd2,
                },
            )?;
            out.push(FetchedMatch {
                record,
                tournament: tournament.clone(),
            });
        }
    }

    if skipped > 0 {
        debug!(skipped, "skipped segments or maps without usable detail");
    }
    Ok(out)
}

pub fn tier_for_tournament(name: &str) -> Tier {
    let lower = name.to_ascii_lowercase();
    if TIER1_MARKERS.iter().any(|m| lower.contains(m)) {
        Tier::One
    } else {
        Tier::Two
    }
}

/// Resolves strings like `"1d 7h ago"`, `"2h 58m ago"`, `"8d ago"`, `"2w ago"`.
/// Anything unreadable resolves to `now`.
pub fn parse_relative_time(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut total = TimeDelta::zero();
    for token in raw.split_whitespace() {
        if token.eq_ignore_ascii_case("ago") {
            continue;
        }
        let split = token.find(|c: char| !c.is_ascii_digit()).unwrap_or(token.len());
        let (digits, unit) = token.split_at(split);
        let Ok(n) = digits.parse::<i64>() else {
            debug!(raw, "unreadable relative time");
            return now;
        };
        let delta = match unit {
            "w" => TimeDelta::try_weeks(n),
            "d" => TimeDelta::try_days(n),
            "h" => TimeDelta::try_hours(n),
            "m" => TimeDelta::try_minutes(n),
            "s" => TimeDelta::try_seconds(n),
            _ => None,
        };
        let Some(delta) = delta else {
            debug!(raw, "unreadable relative time");
            return now;
        };
        total += delta;
    }
    now - total
}

/// Scores arrive as numbers or strings; blanks, `null` and placeholders become `None`.
fn lenient_score<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<u32>, D::Error> {
    let v = Value::deserialize(de)?;
    Ok(match &v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{parse_relative_time, parse_results, tier_for_tournament};
    use crate::match_record::Tier;

    #[test]
    fn relative_times_resolve_against_now() {
        let now = Utc.with_ymd_and_hms(2024, 8, 20, 12, 0, 0).unwrap();
        let d = |raw: &str| parse_relative_time(raw, now).date_naive();
        assert_eq!(d("1d 7h ago"), NaiveDate::from_ymd_opt(2024, 8, 19).unwrap());
        assert_eq!(d("2h 58m ago"), NaiveDate::from_ymd_opt(2024, 8, 20).unwrap());
        assert_eq!(d("8d ago"), NaiveDate::from_ymd_opt(2024, 8, 12).unwrap());
        assert_eq!(d("2w ago"), NaiveDate::from_ymd_opt(2024, 8, 6).unwrap());
        assert_eq!(d("yesterday"), NaiveDate::from_ymd_opt(2024, 8, 20).unwrap());
    }

    #[test]
    fn tier_follows_tournament_name() {
        assert_eq!(tier_for_tournament("VCT 2024: Masters Shanghai"), Tier::One);
        assert_eq!(tier_for_tournament("Challengers League NA"), Tier::Two);
    }

    #[test]
    fn segments_expand_to_one_record_per_map() {
        let body = r#"{"data":{"status":200,"segments":[
            {"team1":"Sentinels","team2":"LOUD","score1":"2","score2":"1",
             "tournament_name":"Champions Tour Americas","time_completed":"3d ago",
             "region":"Americas",
             "maps":[{"map":"Lotus","score1":13,"score2":9,"acs1":231.5,"acs2":201.0},
                     {"map":"Bind","score1":"10","score2":"13"},
                     {"map":"Split","score1":13,"score2":11}]},
            {"team1":"FNATIC","team2":"Team Heretics","score1":"2","score2":"0",
             "tournament_name":"Challengers","time_completed":"1d 2h ago"}
        ]}}"#;
        let now = Utc.with_ymd_and_hms(2024, 8, 20, 12, 0, 0).unwrap();
        let maps = parse_results(body, now).unwrap();
        assert_eq!(maps.len(), 3);
        assert_eq!(maps[0].record.winner, "Sentinels");
        assert_eq!(maps[1].record.winner, "LOUD");
        assert_eq!(maps[0].record.tier, Tier::One);
        assert_eq!(maps[0].record.team_a_perf.acs, Some(231.5));
        assert_eq!(maps[1].record.team_a_perf.acs, None);
        assert_eq!(maps[2].record.date, NaiveDate::from_ymd_opt(2024, 8, 17).unwrap());
        assert_eq!(maps[0].tournament, "Champions Tour Americas");
    }

    #[test]
    fn unscored_maps_are_dropped_without_losing_the_payload() {
        let body = r#"{"data":{"segments":[
            {"team1":"Sentinels","team2":"LOUD","tournament_name":"VCT Americas",
             "time_completed":"2d ago",
             "maps":[{"map":"Lotus","score1":13,"score2":9},
                     {"map":"Bind","score1":"10","score2":"13"},
                     {"map":"Split","score1":"","score2":""},
                     {"map":"Haven","score1":null,"score2":null},
                     {"map":"Icebox","score1":"N/A","score2":"N/A"},
                     {"map":"Sunset"}]}
        ]}}"#;
        let now = Utc.with_ymd_and_hms(2024, 8, 20, 12, 0, 0).unwrap();
        let maps = parse_results(body, now).unwrap();
        let names: Vec<&str> = maps.iter().map(|m| m.record.map.as_str()).collect();
        assert_eq!(names, vec!["Lotus", "Bind"]);
    }

    #[test]
    fn retries_back_off_then_report_upstream_failure() {
        use std::time::{Duration, Instant};

        use super::VlrClient;
        use crate::error::ForecastError;

        // Nothing listens on the discard port, so every attempt fails fast.
        let client = VlrClient::new("http://127.0.0.1:9", Duration::from_millis(200), 3)
            .unwrap()
            .with_backoff_base(Duration::from_millis(10));
        let started = Instant::now();
        let err = client.get_with_retry(&client.results_url()).unwrap_err();
        // Two waits between three attempts: 10ms + 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(matches!(
            err.downcast_ref::<ForecastError>(),
            Some(ForecastError::UpstreamFetch(_))
        ));
    }
}
