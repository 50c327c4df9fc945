// HTTP origin client: head discovery, cheap ingestion-time probes and segment downloads.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::ProbeConfig;
use crate::error::{Result, RewindError};
use crate::metadata::SegmentMetadata;
use crate::retry::retry_transient;
use crate::stream::{Anchor, SegmentStream, StreamDescriptor};

/// Response header carrying the sequence number of the segment being produced.
pub const HEAD_SEQNUM_HEADER: &str = "X-Head-Seqnum";

/// A stream variant served over HTTP at `<base>/sq/<sequence>`.
pub struct HttpStream {
    descriptor: StreamDescriptor,
    client: Client,
    config: ProbeConfig,
    retention_window: Duration,
    token: CancellationToken,
    /// Observed segments never change, so probe results are kept.
    times: Cache<u64, DateTime<Utc>>,
    head: Mutex<Option<(Instant, Anchor)>>,
}

impl HttpStream {
    pub fn new(
        descriptor: StreamDescriptor,
        client: Client,
        config: ProbeConfig,
        retention_window: Duration,
        token: CancellationToken,
    ) -> Self {
        let times = Cache::builder()
            .max_capacity(config.cache_capacity)
            .build();
        Self {
            descriptor,
            client,
            config,
            retention_window,
            token,
            times,
            head: Mutex::new(None),
        }
    }

    /// Sequence number announced by the origin as being produced right now.
    async fn request_head_seqnum(&self) -> Result<u64> {
        let url = self.descriptor.base_url.clone();
        let response = self.client.head(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RewindError::http_status(status, url.as_str(), "head"));
        }
        response
            .headers()
            .get(HEAD_SEQNUM_HEADER)
            .ok_or_else(|| RewindError::metadata(format!("`{HEAD_SEQNUM_HEADER}` header is missing")))?
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| RewindError::metadata(format!("`{HEAD_SEQNUM_HEADER}` is not a number")))
    }

    /// Read the metadata header of a segment from its first bytes.
    pub async fn probe_metadata(&self, sequence: u64) -> Result<SegmentMetadata> {
        retry_transient(&self.config.retry, &self.token, |_| {
            self.request_partial(sequence)
        })
        .await
    }

    /// Probe `sequence` and remember its ingestion time.
    async fn observe(&self, sequence: u64) -> Result<SegmentMetadata> {
        let metadata = self.probe_metadata(sequence).await?;
        if metadata.sequence_number != sequence {
            return Err(RewindError::metadata(format!(
                "requested segment {sequence}, origin returned {}",
                metadata.sequence_number
            )));
        }
        let time = metadata.ingestion_walltime;
        self.times.insert(sequence, time).await;
        trace!(sequence, %time, "Probed segment");
        Ok(metadata)
    }

    async fn request_partial(&self, sequence: u64) -> Result<SegmentMetadata> {
        let url = self.descriptor.segment_url(sequence)?;
        let range = format!("bytes=0-{}", self.config.partial_size - 1);
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::RANGE, range)
            .send()
            .await?;
        let response = self.check_status(response, sequence, "probe")?;
        if response.status() == StatusCode::OK {
            trace!(sequence, "Range header ignored by origin");
        }
        let content = response.bytes().await?;
        SegmentMetadata::parse(&content)
    }

    fn check_status(
        &self,
        response: reqwest::Response,
        sequence: u64,
        operation: &'static str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let err = RewindError::http_status(status, response.url().as_str(), operation);
        if err.is_segment_missing() {
            return Err(RewindError::SegmentGone {
                stream: self.descriptor.id.clone(),
                sequence,
            });
        }
        Err(err)
    }
}

#[async_trait]
impl SegmentStream for HttpStream {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn retention_window(&self) -> Duration {
        self.retention_window
    }

    #[instrument(skip(self), fields(stream = %self.descriptor.id))]
    async fn head(&self) -> Result<Anchor> {
        if let Some((fetched_at, anchor)) = *self.head.lock()
            && fetched_at.elapsed() < self.config.head_ttl
        {
            return Ok(anchor);
        }

        let seqnum = retry_transient(&self.config.retry, &self.token, |_| {
            self.request_head_seqnum()
        })
        .await?;
        // The announced segment is still being written.
        let sequence = seqnum.saturating_sub(1);
        let anchor = Anchor::new(sequence, self.probe_time(sequence).await?);
        debug!(sequence, time = %anchor.ingestion_time, "Fetched stream head");

        *self.head.lock() = Some((Instant::now(), anchor));
        Ok(anchor)
    }

    async fn probe_time(&self, sequence: u64) -> Result<DateTime<Utc>> {
        if let Some(time) = self.times.get(&sequence).await {
            return Ok(time);
        }
        Ok(self.observe(sequence).await?.ingestion_walltime)
    }

    async fn fetch(&self, sequence: u64) -> Result<Bytes> {
        let url = self.descriptor.segment_url(sequence)?;
        let response = self.client.get(url).send().await?;
        let response = self.check_status(response, sequence, "fetch")?;
        Ok(response.bytes().await?)
    }
}
