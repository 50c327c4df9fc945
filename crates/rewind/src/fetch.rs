// Segment Fetch Pipeline: downloads a sequence range per stream into a run
// directory, concurrently, with retries and crash-safe progress.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::future::try_join_all;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::FetchConfig;
use crate::error::{Result, RewindError};
use crate::interval::RewindInterval;
use crate::resume::{Fingerprint, ResumeState, ResumeStore, ResumeTracker, RunLock};
use crate::retry::retry_transient;
use crate::stream::SegmentStream;

/// Receives fetch progress; every method defaults to a no-op.
pub trait ProgressReporter: Send + Sync {
    fn stream_started(&self, _stream: &str, _total: u64) {}
    fn segment_done(&self, _stream: &str, _sequence: u64, _bytes: u64, _skipped: bool) {}
    fn stream_finished(&self, _stream: &str) {}
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// What to fetch and where.
#[derive(Clone)]
pub struct FetchPlan {
    pub streams: Vec<Arc<dyn SegmentStream>>,
    pub sequences: RangeInclusive<u64>,
    pub destination: PathBuf,
}

impl FetchPlan {
    pub fn new(
        interval: &RewindInterval,
        streams: Vec<Arc<dyn SegmentStream>>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            streams,
            sequences: interval.sequences(),
            destination: destination.into(),
        }
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let ids: Vec<&str> = self
            .streams
            .iter()
            .map(|s| s.descriptor().id.as_str())
            .collect();
        Fingerprint::compute(
            *self.sequences.start(),
            *self.sequences.end(),
            &ids,
            &self.destination,
        )
    }
}

/// Local files of one stream's range.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RangeFetch {
    pub paths: BTreeMap<u64, PathBuf>,
    pub fetched: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub fingerprint: Fingerprint,
    /// Segment files per stream id, in sequence order.
    pub paths: BTreeMap<String, BTreeMap<u64, PathBuf>>,
    pub fetched: u64,
    pub skipped: u64,
}

pub struct FetchPipeline {
    config: FetchConfig,
    token: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl FetchPipeline {
    pub fn new(config: FetchConfig, token: CancellationToken) -> Self {
        Self {
            config,
            token,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fetch every stream of `plan` into its destination, resuming a previous
    /// run of the same request.
    #[instrument(skip_all, fields(destination = %plan.destination.display()))]
    pub async fn run(&self, plan: &FetchPlan) -> Result<FetchReport> {
        if plan.streams.is_empty() {
            return Err(RewindError::invalid_interval("no streams to fetch"));
        }
        tokio::fs::create_dir_all(&plan.destination).await?;

        let fingerprint = plan.fingerprint()?;
        let _lock = RunLock::acquire(&plan.destination, self.config.force_unlock)?;
        let store = ResumeStore::new(&plan.destination);
        let state = store.load(&fingerprint).await;
        let tracker = ResumeTracker::new(store, state);
        tracker.persist().await?;

        info!(
            %fingerprint,
            streams = plan.streams.len(),
            start = *plan.sequences.start(),
            end = *plan.sequences.end(),
            "Starting fetch run"
        );

        let outcomes = try_join_all(plan.streams.iter().map(|stream| {
            self.fetch_range(
                stream.as_ref(),
                plan.sequences.clone(),
                &plan.destination,
                &tracker,
            )
        }))
        .await?;

        let mut report = FetchReport {
            fingerprint,
            paths: BTreeMap::new(),
            fetched: 0,
            skipped: 0,
        };
        for (stream, outcome) in plan.streams.iter().zip(outcomes) {
            report.fetched += outcome.fetched;
            report.skipped += outcome.skipped;
            report
                .paths
                .insert(stream.descriptor().id.clone(), outcome.paths);
        }

        if self.config.retain_state {
            debug!(path = %tracker.store().path().display(), "Keeping resume state");
        } else {
            tracker.store().remove().await?;
        }
        info!(
            fetched = report.fetched,
            skipped = report.skipped,
            "Fetch run complete"
        );
        Ok(report)
    }

    /// Fetch `sequences` of one stream into `destination`, skipping segments
    /// the tracker already holds.
    #[instrument(skip_all, fields(stream = %stream.descriptor().id))]
    pub async fn fetch_range(
        &self,
        stream: &dyn SegmentStream,
        sequences: RangeInclusive<u64>,
        destination: &Path,
        tracker: &ResumeTracker,
    ) -> Result<RangeFetch> {
        let id = stream.descriptor().id.clone();
        let total = sequences.end().saturating_sub(*sequences.start()) + 1;
        self.progress.stream_started(&id, total);

        let mut results = futures::stream::iter(sequences)
            .map(|sequence| self.fetch_one(stream, sequence, destination, tracker))
            .buffer_unordered(self.config.max_concurrent_fetches.max(1));

        let mut outcome = RangeFetch::default();
        while let Some(result) = results.next().await {
            let (sequence, path, fetched) = result?;
            if fetched {
                outcome.fetched += 1;
            } else {
                outcome.skipped += 1;
            }
            outcome.paths.insert(sequence, path);
        }

        self.progress.stream_finished(&id);
        debug!(
            fetched = outcome.fetched,
            skipped = outcome.skipped,
            "Stream range complete"
        );
        Ok(outcome)
    }

    async fn fetch_one(
        &self,
        stream: &dyn SegmentStream,
        sequence: u64,
        destination: &Path,
        tracker: &ResumeTracker,
    ) -> Result<(u64, PathBuf, bool)> {
        let descriptor = stream.descriptor();
        let path = destination.join(descriptor.segment_file_name(sequence));

        if tracker.is_complete(&descriptor.id, sequence).await {
            if is_non_empty(&path).await {
                self.progress.segment_done(&descriptor.id, sequence, 0, true);
                return Ok((sequence, path, false));
            }
            warn!(sequence, path = %path.display(), "Completed segment is missing on disk, fetching again");
        }

        let bytes = retry_transient(&self.config.retry, &self.token, |_| stream.fetch(sequence))
            .await
            .map_err(|e| match e {
                e if e.is_segment_missing() => RewindError::SegmentGone {
                    stream: descriptor.id.clone(),
                    sequence,
                },
                e => e,
            })?;

        let part = PartFile::new(&path);
        tokio::select! {
            _ = self.token.cancelled() => return Err(RewindError::Cancelled),
            written = write_synced(part.path(), &bytes) => written?,
        }
        tokio::fs::rename(part.path(), &path).await?;
        part.disarm();

        tracker.mark_complete(&descriptor.id, sequence).await?;
        self.progress
            .segment_done(&descriptor.id, sequence, bytes.len() as u64, false);
        Ok((sequence, path, true))
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}

async fn write_synced(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}

/// `<name>.part` sibling of a segment file, removed on drop unless disarmed.
struct PartFile {
    path: Option<PathBuf>,
}

impl PartFile {
    fn new(target: &Path) -> Self {
        let mut name = OsString::from(target.as_os_str());
        name.push(".part");
        Self {
            path: Some(PathBuf::from(name)),
        }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Completed segments of a run directory's resume state, if any.
pub async fn inspect_state(destination: &Path, fingerprint: &Fingerprint) -> ResumeState {
    ResumeStore::new(destination).load(fingerprint).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticStream;
    use tempfile::TempDir;

    fn pipeline(config: FetchConfig) -> FetchPipeline {
        FetchPipeline::new(config, CancellationToken::new())
    }

    fn quick_config() -> FetchConfig {
        let mut config = FetchConfig::default();
        config.retry.base_delay = std::time::Duration::from_millis(1);
        config.retry.jitter = false;
        config
    }

    #[tokio::test]
    async fn writes_one_file_per_sequence() {
        let dir = TempDir::new().unwrap();
        let stream: Arc<dyn SegmentStream> = Arc::new(SyntheticStream::builder("140").segments(50).build());
        let plan = FetchPlan {
            streams: vec![stream],
            sequences: 10..=19,
            destination: dir.path().to_path_buf(),
        };
        let report = pipeline(quick_config()).run(&plan).await.unwrap();
        assert_eq!(report.fetched, 10);
        let paths = &report.paths["140"];
        assert_eq!(paths.len(), 10);
        assert_eq!(paths[&10], dir.path().join("10.140.m4a"));
        assert!(std::fs::metadata(&paths[&19]).unwrap().len() > 0);
        // State and lock are gone after a clean run.
        assert!(!dir.path().join(crate::resume::STATE_FILE_NAME).exists());
        assert!(!dir.path().join("resume.lock").exists());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let synthetic = Arc::new(SyntheticStream::builder("140").segments(50).build());
        synthetic.fail_fetch_transiently(12, 2);
        let plan = FetchPlan {
            streams: vec![synthetic.clone() as Arc<dyn SegmentStream>],
            sequences: 10..=14,
            destination: dir.path().to_path_buf(),
        };
        let report = pipeline(quick_config()).run(&plan).await.unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(synthetic.fetch_count(), 7);
    }

    #[tokio::test]
    async fn missing_segment_is_fatal_and_keeps_progress() {
        let dir = TempDir::new().unwrap();
        let synthetic = Arc::new(SyntheticStream::builder("140").segments(50).build());
        synthetic.remove_segment(13);
        let mut config = quick_config();
        config.max_concurrent_fetches = 1;
        let plan = FetchPlan {
            streams: vec![synthetic.clone() as Arc<dyn SegmentStream>],
            sequences: 10..=14,
            destination: dir.path().to_path_buf(),
        };
        let err = pipeline(config).run(&plan).await.unwrap_err();
        assert!(matches!(err, RewindError::SegmentGone { sequence: 13, .. }));

        let state = inspect_state(dir.path(), &plan.fingerprint().unwrap()).await;
        assert_eq!(state.completed("140"), 3);
        assert!(!dir.path().join("13.140.m4a.part").exists());
        assert!(!dir.path().join("resume.lock").exists());
    }

    #[tokio::test]
    async fn run_lock_blocks_concurrent_run() {
        let dir = TempDir::new().unwrap();
        let _lock = RunLock::acquire(dir.path(), false).unwrap();
        let stream: Arc<dyn SegmentStream> = Arc::new(SyntheticStream::builder("140").segments(5).build());
        let plan = FetchPlan {
            streams: vec![stream],
            sequences: 0..=4,
            destination: dir.path().to_path_buf(),
        };
        let err = pipeline(quick_config()).run(&plan).await.unwrap_err();
        assert!(matches!(err, RewindError::RunLocked { .. }));
    }

    #[tokio::test]
    async fn completed_but_missing_file_is_fetched_again() {
        let dir = TempDir::new().unwrap();
        let synthetic = Arc::new(SyntheticStream::builder("140").segments(10).build());
        let mut config = quick_config();
        config.retain_state = true;
        let plan = FetchPlan {
            streams: vec![synthetic.clone() as Arc<dyn SegmentStream>],
            sequences: 0..=4,
            destination: dir.path().to_path_buf(),
        };
        pipeline(config.clone()).run(&plan).await.unwrap();
        std::fs::remove_file(dir.path().join("2.140.m4a")).unwrap();

        synthetic.reset_counters();
        let report = pipeline(config).run(&plan).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.skipped, 4);
        assert_eq!(synthetic.fetch_count(), 1);
    }
}
