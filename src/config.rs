use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::recency::RecencyConfig;

/// Static map inclusion set used when `MAP_POOL` is not set.
pub static DEFAULT_MAP_POOL: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "Ascent", "Bind", "Breeze", "Haven", "Lotus", "Split", "Sunset", "Icebox", "Abyss",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Bulk,
    Live,
}

impl FromStr for DataSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bulk" | "csv" | "file" => Ok(DataSource::Bulk),
            "live" | "vlrgg" => Ok(DataSource::Live),
            other => Err(format!("unknown data source {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForecastConfig {
    pub data_source: DataSource,
    pub data_csv: PathBuf,
    pub lookback_days: i64,
    pub only_tier1: bool,
    pub filter_top_teams: bool,
    pub top_teams_per_region: usize,
    pub map_pool: Vec<String>,
    pub tournament_mode: bool,
    pub artifact_dir: PathBuf,
    pub cache_db_path: PathBuf,
    pub vlr_base_url: String,
    pub vlr_timeout_secs: u64,
    pub vlr_retry_attempts: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            data_source: DataSource::Bulk,
            data_csv: PathBuf::from("data/map_matches.csv"),
            lookback_days: 100,
            only_tier1: false,
            filter_top_teams: false,
            top_teams_per_region: 100,
            map_pool: DEFAULT_MAP_POOL.clone(),
            tournament_mode: false,
            artifact_dir: PathBuf::from("artifacts"),
            cache_db_path: PathBuf::from("data/live_cache.sqlite"),
            vlr_base_url: "https://vlrggapi.vercel.app".to_string(),
            vlr_timeout_secs: 30,
            vlr_retry_attempts: 3,
        }
    }
}

impl ForecastConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let map_pool = get("MAP_POOL")
            .map(|raw| {
                raw.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|pool| !pool.is_empty())
            .unwrap_or(d.map_pool);

        Self {
            data_source: parsed(&get, "DATA_SOURCE", d.data_source),
            data_csv: get("DATA_CSV").map(PathBuf::from).unwrap_or(d.data_csv),
            lookback_days: parsed(&get, "LOOKBACK_DAYS", d.lookback_days).max(1),
            only_tier1: flag(&get, "ONLY_TIER1", d.only_tier1),
            filter_top_teams: flag(&get, "FILTER_TOP_TEAMS", d.filter_top_teams),
            top_teams_per_region: parsed(&get, "TOP_TEAMS_PER_REGION", d.top_teams_per_region)
                .max(1),
            map_pool,
            tournament_mode: flag(&get, "TOURNAMENT_MODE", d.tournament_mode),
            artifact_dir: get("ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.artifact_dir),
            cache_db_path: get("CACHE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.cache_db_path),
            vlr_base_url: get("VLR_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.vlr_base_url),
            vlr_timeout_secs: parsed(&get, "VLR_TIMEOUT_SECS", d.vlr_timeout_secs).max(1),
            vlr_retry_attempts: parsed(&get, "VLR_RETRY_ATTEMPTS", d.vlr_retry_attempts).max(1),
        }
    }

    pub fn recency(&self) -> RecencyConfig {
        if self.tournament_mode {
            RecencyConfig::tournament()
        } else {
            RecencyConfig::default()
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable config value");
            default
        }
    }
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    let Some(raw) = get(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = %raw, "ignoring unparseable boolean config value");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{DataSource, ForecastConfig};

    fn from_pairs(pairs: &[(&str, &str)]) -> ForecastConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ForecastConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = from_pairs(&[]);
        assert_eq!(cfg.data_source, DataSource::Bulk);
        assert_eq!(cfg.lookback_days, 100);
        assert_eq!(cfg.map_pool.len(), 9);
        assert!(!cfg.only_tier1);
    }

    #[test]
    fn env_values_override_and_bad_values_fall_back() {
        let cfg = from_pairs(&[
            ("DATA_SOURCE", "live"),
            ("ONLY_TIER1", "true"),
            ("TOP_TEAMS_PER_REGION", "twelve"),
            ("MAP_POOL", "Ascent, Bind"),
            ("VLR_BASE_URL", "http://localhost:8080/"),
        ]);
        assert_eq!(cfg.data_source, DataSource::Live);
        assert!(cfg.only_tier1);
        assert_eq!(cfg.top_teams_per_region, 100);
        assert_eq!(cfg.map_pool, vec!["Ascent".to_string(), "Bind".to_string()]);
        assert_eq!(cfg.vlr_base_url, "http://localhost:8080");
    }
}
