use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{
    ETAG, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, USER_AGENT,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CACHE_VERSION: u32 = 1;
pub const CACHE_FILE: &str = "http_cache.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HttpCacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    body: String,
    etag: Option<String>,
    last_modified: Option<String>,
    fetched_at: u64,
}

/// Conditional-GET body cache. Revalidates with ETag / Last-Modified and
/// serves the stored body on 304. `path = None` keeps it in memory only.
#[derive(Debug, Default)]
pub struct HttpBodyCache {
    path: Option<PathBuf>,
    state: Mutex<HttpCacheFile>,
}

impl HttpBodyCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_cache_file(&path);
        Self {
            path: Some(path),
            state: Mutex::new(state),
        }
    }

    pub fn fetch_text(&self, client: &Client, url: &str) -> Result<String> {
        let cached_entry = self.lock().entries.get(url).cloned();

        let mut req = client.get(url).header(USER_AGENT, "vlr_forecast/0.1");
        if let Some(entry) = cached_entry.as_ref() {
            if let Some(etag) = entry.etag.as_ref() {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = entry.last_modified.as_ref() {
                req = req.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let resp = req.send().context("request failed")?;
        let status = resp.status();
        let headers = resp.headers().clone();
        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached_entry {
                debug!(url, "upstream body not modified");
                return Ok(entry.body);
            }
            return Err(anyhow!("received 304 without cache body"));
        }

        let body = resp.text().context("failed reading body")?;
        if !status.is_success() {
            return Err(anyhow!("http {}: {}", status, body));
        }

        let header_str = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        let entry = CacheEntry {
            body: body.clone(),
            etag: header_str(ETAG),
            last_modified: header_str(LAST_MODIFIED),
            fetched_at: system_time_to_secs(SystemTime::now()).unwrap_or_default(),
        };
        self.store(url, entry);
        Ok(body)
    }

    fn store(&self, key: &str, entry: CacheEntry) {
        let mut cache = self.lock();
        cache.version = CACHE_VERSION;
        cache.entries.insert(key.to_string(), entry);
        if let Some(path) = self.path.as_deref() {
            if let Err(err) = save_cache_file(path, &cache) {
                warn!(error = %err, "failed to persist http cache");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HttpCacheFile> {
        // A panic mid-insert leaves at worst one stale entry.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_cache_file(path: &Path) -> HttpCacheFile {
    let Ok(raw) = fs::read_to_string(path) else {
        return HttpCacheFile::default();
    };
    let cache = serde_json::from_str::<HttpCacheFile>(&raw).unwrap_or_default();
    if cache.version != CACHE_VERSION {
        return HttpCacheFile::default();
    }
    cache
}

fn save_cache_file(path: &Path, cache: &HttpCacheFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).ok();
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(cache).context("serialize http cache")?;
    fs::write(&tmp, json).context("write http cache")?;
    fs::rename(&tmp, path).context("swap http cache")?;
    Ok(())
}

fn system_time_to_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::{CacheEntry, HttpBodyCache, load_cache_file};

    #[test]
    fn persisted_entries_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("http_cache.json");
        let cache = HttpBodyCache::at_path(&path);
        cache.store(
            "https://example.test/a",
            CacheEntry {
                body: "{}".to_string(),
                etag: Some("\"v1\"".to_string()),
                last_modified: None,
                fetched_at: 1,
            },
        );
        let reloaded = load_cache_file(&path);
        assert_eq!(reloaded.entries.len(), 1);
        assert_eq!(
            reloaded.entries["https://example.test/a"].etag.as_deref(),
            Some("\"v1\"")
        );
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("http_cache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_cache_file(&path).entries.is_empty());
    }
}
