//! On-disk cache of stream metadata, one JSON file per entry named
//! `<expires-at>~<key>.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Result, RewindError};
use crate::stream::{Anchor, StreamDescriptor};

const SEPARATOR: char = '~';

/// Lifetime of an entry whose URLs carry no `expire` parameter.
const DEFAULT_TTL: TimeDelta = TimeDelta::hours(6);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedStreams {
    pub head: Anchor,
    /// Segment base URL per stream id.
    pub base_urls: BTreeMap<String, Url>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MetadataCache {
    dir: PathBuf,
}

impl MetadataCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache key of a set of streams.
    pub fn key_for(descriptors: &[StreamDescriptor]) -> String {
        let mut ids: Vec<String> = descriptors
            .iter()
            .map(|d| format!("{}/{}", d.base_url.host_str().unwrap_or_default(), d.id))
            .collect();
        ids.sort_unstable();
        let digest = Sha256::digest(ids.join("\n").as_bytes());
        hex::encode(&digest[..12])
    }

    /// Earliest `expire` path parameter of the base URLs, or a default TTL.
    pub fn expiry_of(descriptors: &[StreamDescriptor]) -> DateTime<Utc> {
        descriptors
            .iter()
            .filter_map(|d| {
                let segments: Vec<&str> = d.base_url.path_segments()?.collect();
                let position = segments.iter().position(|s| *s == "expire")?;
                let secs = segments.get(position + 1)?.parse::<i64>().ok()?;
                DateTime::from_timestamp(secs, 0)
            })
            .min()
            .unwrap_or_else(|| Utc::now() + DEFAULT_TTL)
    }

    /// Fresh entry for `key`; expired and unreadable entries count as absent.
    pub async fn get(&self, key: &str) -> Option<CachedStreams> {
        let now = Utc::now();
        for (expires_at, path) in self.entries_for(key).await {
            if expires_at <= now {
                trace!(path = %path.display(), "Removing expired cache entry");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            let Ok(content) = tokio::fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<CachedStreams>(&content) {
                Ok(entry) => {
                    debug!(key, head = entry.head.sequence, "Cache hit");
                    return Some(entry);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                }
            }
        }
        None
    }

    /// Store `entry` under `key`, replacing older entries.
    pub async fn put(&self, key: &str, entry: &CachedStreams) -> Result<()> {
        if key.is_empty() || key.contains([SEPARATOR, '/', '\\']) {
            return Err(RewindError::Cache {
                reason: format!("invalid cache key `{key}`"),
            });
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        for (_, stale) in self.entries_for(key).await {
            let _ = tokio::fs::remove_file(stale).await;
        }

        let content = serde_json::to_vec(entry).map_err(|e| RewindError::Cache {
            reason: e.to_string(),
        })?;
        let path = self
            .dir
            .join(format!("{}{SEPARATOR}{key}.json", entry.expires_at.timestamp()));
        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Delete every expired entry; returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut removed = 0;
        let now = Utc::now();
        for (expires_at, path) in self.all_entries().await {
            if expires_at <= now {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn entries_for(&self, key: &str) -> Vec<(DateTime<Utc>, PathBuf)> {
        let suffix = format!("{SEPARATOR}{key}.json");
        self.all_entries()
            .await
            .into_iter()
            .filter(|(_, path)| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix))
            })
            .collect()
    }

    async fn all_entries(&self) -> Vec<(DateTime<Utc>, PathBuf)> {
        let mut entries = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return entries;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Some((expires, _)) = stem.split_once(SEPARATOR) else {
                continue;
            };
            if let Some(expires_at) = expires
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
            {
                entries.push((expires_at, path));
            }
        }
        entries
    }
}
