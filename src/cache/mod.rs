//! Content-addressed download cache.
//!
//! Downloads a remote media URL once, stores it under a name derived from
//! `sha256(url)`, and serves it back from a configured base URL. Concurrent
//! requests for the same URL coalesce into a single download via the same
//! single-flight discipline the sentinel service uses for token refresh.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
struct Entry {
    filename: String,
    expires_at: Option<DateTime<Utc>>,
}

type InFlight = Shared<BoxFuture<'static, std::result::Result<String, String>>>;

pub struct FileCache {
    config: CacheConfig,
    index: Mutex<HashMap<String, Entry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl FileCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            index: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Download and cache `url`, returning the filename to serve it under, or
    /// the original URL unchanged when caching is disabled.
    pub async fn download_and_cache(&self, client: &Client, url: &str) -> Result<String> {
        if !self.config.enabled {
            return Ok(url.to_string());
        }

        if let Some(entry) = self.index.lock().await.get(url).cloned() {
            if !is_expired(&entry) {
                return Ok(self.public_url(&entry.filename));
            }
        }

        let fut = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(url) {
                existing.clone()
            } else {
                let client = client.clone();
                let url_owned = url.to_string();
                let dir = self.config.dir.clone();
                let new_fut: BoxFuture<'static, std::result::Result<String, String>> =
                    download(client, url_owned, dir).boxed();
                let shared = new_fut.shared();
                in_flight.insert(url.to_string(), shared.clone());
                shared
            }
        };

        let result = fut.await;
        self.in_flight.lock().await.remove(url);

        let filename = result.map_err(GatewayError::Cache)?;
        let expires_at = if self.config.timeout_secs < 0 {
            None
        } else {
            Some(Utc::now() + chrono::Duration::seconds(self.config.timeout_secs))
        };
        self.index.lock().await.insert(
            url.to_string(),
            Entry {
                filename: filename.clone(),
                expires_at,
            },
        );

        Ok(self.public_url(&filename))
    }

    fn public_url(&self, filename: &str) -> String {
        format!("{}/tmp/{}", self.config.base_url.trim_end_matches('/'), filename)
    }

    pub fn local_path(&self, filename: &str) -> PathBuf {
        self.config.dir.join(filename)
    }

    /// Delete expired entries and their backing files. No-op when the cache
    /// is configured with `timeout_secs = -1` (sweeping disabled).
    pub async fn sweep(&self) {
        if self.config.timeout_secs < 0 {
            return;
        }
        let now = Utc::now();
        let mut index = self.index.lock().await;
        let expired: Vec<(String, Entry)> = index
            .iter()
            .filter(|(_, e)| is_expired_at(e, now))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (url, entry) in &expired {
            let _ = tokio::fs::remove_file(self.local_path(&entry.filename)).await;
            index.remove(url);
        }
    }

    /// Spawn the periodic sweeper task on the given interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) {
        if self.config.timeout_secs < 0 {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        });
    }
}

fn is_expired(entry: &Entry) -> bool {
    is_expired_at(entry, Utc::now())
}

fn is_expired_at(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.map(|t| t <= now).unwrap_or(false)
}

async fn download(client: Client, url: String, dir: PathBuf) -> std::result::Result<String, String> {
    let response = client.get(&url).send().await.map_err(|e| e.to_string())?;
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = response.bytes().await.map_err(|e| e.to_string())?;

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    let ext = infer_extension(&url, content_type.as_deref());
    let filename = format!("{hex}{ext}");

    tokio::fs::create_dir_all(&dir).await.map_err(|e| e.to_string())?;
    let path = dir.join(&filename);
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("writing cache file {}", path.display()))
        .map_err(|e| e.to_string())?;

    Ok(filename)
}

fn infer_extension(url: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = url.rsplit('.').next() {
        if ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()) && !ext.contains('/') {
            return format!(".{ext}");
        }
    }
    match content_type {
        Some(ct) if ct.contains("video") => ".mp4".to_string(),
        Some(ct) if ct.contains("image") => ".png".to_string(),
        _ => ".png".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_inferred_from_url_path() {
        assert_eq!(infer_extension("https://x.example/a/b.mp4", None), ".mp4");
        assert_eq!(infer_extension("https://x.example/a/b", Some("video/mp4")), ".mp4");
        assert_eq!(infer_extension("https://x.example/a/b", Some("image/png")), ".png");
        assert_eq!(infer_extension("https://x.example/a/b", None), ".png");
    }

    #[test]
    fn expiry_respects_minus_one_sentinel() {
        let cache = FileCache::new(CacheConfig {
            enabled: true,
            timeout_secs: -1,
            base_url: "http://localhost".to_string(),
            dir: std::env::temp_dir(),
        });
        assert_eq!(cache.config.timeout_secs, -1);
    }
}
