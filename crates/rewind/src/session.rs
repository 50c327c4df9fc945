use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CachedStreams, MetadataCache};
use crate::config::RewindConfig;
use crate::error::Result;
use crate::fetch::FetchPipeline;
use crate::locate::SegmentLocator;
use crate::probe::HttpStream;
use crate::resolve::IntervalResolver;
use crate::stream::{Anchor, StreamDescriptor};

/// Moments located earlier in a session, per stream.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct RewindHistory {
    inner: Arc<Mutex<HashMap<String, BTreeMap<DateTime<Utc>, u64>>>>,
}

impl RewindHistory {
    pub fn record(&self, stream: &str, anchor: Anchor) {
        self.inner
            .lock()
            .entry(stream.to_owned())
            .or_default()
            .insert(anchor.ingestion_time, anchor.sequence);
    }

    /// Recorded anchor with the ingestion time closest to `time`.
    pub fn closest(&self, stream: &str, time: DateTime<Utc>) -> Option<Anchor> {
        let inner = self.inner.lock();
        let entries = inner.get(stream)?;
        let before = entries.range(..=time).next_back();
        let after = entries.range(time..).next();
        let pick = match (before, after) {
            (Some(b), Some(a)) => {
                if time - *b.0 <= *a.0 - time {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some(Anchor::new(*pick.1, *pick.0))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything shared by the components of one rewind: configuration, the HTTP
/// client, the rewind history and the cancellation token.
#[derive(Clone)]
pub struct RewindSession {
    config: Arc<RewindConfig>,
    client: Client,
    history: RewindHistory,
    token: CancellationToken,
}

impl RewindSession {
    pub fn new(config: RewindConfig) -> Result<Self> {
        config.validate()?;
        let client = config.http.build_client()?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: RewindConfig, client: Client) -> Self {
        Self {
            config: Arc::new(config),
            client,
            history: RewindHistory::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RewindConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn history(&self) -> &RewindHistory {
        &self.history
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn http_stream(&self, descriptor: StreamDescriptor) -> HttpStream {
        HttpStream::new(
            descriptor,
            self.client.clone(),
            self.config.probe.clone(),
            self.config.general.retention_window,
            self.token.child_token(),
        )
    }

    pub fn locator(&self) -> SegmentLocator {
        SegmentLocator::new(self.config.locate.clone())
    }

    pub fn resolver(&self) -> IntervalResolver {
        IntervalResolver::new(self.locator(), self.history.clone())
            .with_preview_duration(self.config.general.preview_duration)
    }

    pub fn pipeline(&self) -> FetchPipeline {
        FetchPipeline::new(self.config.fetch.clone(), self.token.child_token())
    }

    /// Metadata cache, when a cache directory is configured.
    pub fn cache(&self) -> Option<MetadataCache> {
        self.config.general.cache_dir.clone().map(MetadataCache::new)
    }

    /// Seed the history with the head cached for `descriptors`. Returns the
    /// cached anchor, if any.
    pub async fn seed_from_cache(&self, descriptors: &[StreamDescriptor]) -> Option<Anchor> {
        let cache = self.cache()?;
        let entry = cache.get(&MetadataCache::key_for(descriptors)).await?;
        for descriptor in descriptors {
            self.history.record(&descriptor.id, entry.head);
        }
        Some(entry.head)
    }

    /// Store the current head of `descriptors` in the cache. Failures are
    /// logged and otherwise ignored.
    pub async fn update_cache(&self, descriptors: &[StreamDescriptor], head: Anchor) {
        let Some(cache) = self.cache() else {
            return;
        };
        match cache.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Purged expired cache entries"),
            Err(e) => debug!(error = %e, "Failed to purge metadata cache"),
        }
        let entry = CachedStreams {
            head,
            base_urls: descriptors
                .iter()
                .map(|d| (d.id.clone(), d.base_url.clone()))
                .collect(),
            expires_at: MetadataCache::expiry_of(descriptors),
        };
        if let Err(e) = cache.put(&MetadataCache::key_for(descriptors), &entry).await {
            debug!(error = %e, "Failed to update metadata cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn cached_head_seeds_history() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = RewindConfig::default();
        config.general.cache_dir = Some(dir.path().to_path_buf());
        let session = RewindSession::new(config).unwrap();
        let descriptors = [StreamDescriptor::from_base_url(
            "https://example.com/videoplayback/itag/140/mime/audio%2Fmp4/dur/5.000",
        )
        .unwrap()];

        assert!(session.seed_from_cache(&descriptors).await.is_none());
        let head = Anchor::new(500, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        session.update_cache(&descriptors, head).await;

        let fresh = RewindSession::new(session.config().clone()).unwrap();
        assert_eq!(fresh.seed_from_cache(&descriptors).await, Some(head));
        assert_eq!(fresh.history().closest("140", head.ingestion_time), Some(head));
    }

    #[tokio::test]
    async fn updating_cache_drops_expired_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let stale = dir.path().join(format!("{}~0123abcd.json", Utc::now().timestamp() - 60));
        std::fs::write(&stale, b"{}").unwrap();
        let mut config = RewindConfig::default();
        config.general.cache_dir = Some(dir.path().to_path_buf());
        let session = RewindSession::new(config).unwrap();
        let descriptors = [StreamDescriptor::from_base_url(
            "https://example.com/videoplayback/itag/140/mime/audio%2Fmp4/dur/5.000",
        )
        .unwrap()];

        let head = Anchor::new(500, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        session.update_cache(&descriptors, head).await;
        assert!(!stale.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn closest_prefers_nearest_neighbour() {
        let history = RewindHistory::default();
        let t = |s: i64| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap();
        history.record("140", Anchor::new(10, t(0)));
        history.record("140", Anchor::new(20, t(100)));

        assert_eq!(history.closest("140", t(30)).unwrap().sequence, 10);
        assert_eq!(history.closest("140", t(70)).unwrap().sequence, 20);
        assert_eq!(history.closest("140", t(500)).unwrap().sequence, 20);
        assert!(history.closest("248", t(30)).is_none());
        assert_eq!(history.len(), 2);
    }
}
