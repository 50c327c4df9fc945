//! In-memory stream with a deterministic segment timeline, for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, RewindError};
use crate::metadata::render_header;
use crate::stream::{Anchor, SegmentStream, StreamDescriptor, StreamKind};

const DEFAULT_START: i64 = 1_704_067_200;

pub struct SyntheticStreamBuilder {
    id: String,
    kind: StreamKind,
    segments: u64,
    earliest: u64,
    reported_earliest: Option<u64>,
    segment_duration: Duration,
    start: DateTime<Utc>,
    jitter: Duration,
    gaps: BTreeMap<u64, Duration>,
}

impl SyntheticStreamBuilder {
    /// Number of segments; the head is the last one.
    pub fn segments(mut self, segments: u64) -> Self {
        self.segments = segments.max(1);
        self
    }

    pub fn earliest(mut self, sequence: u64) -> Self {
        self.earliest = sequence;
        self
    }

    /// Estimate returned by `earliest()` when it differs from what the origin retains.
    pub fn reported_earliest(mut self, sequence: u64) -> Self {
        self.reported_earliest = Some(sequence);
        self
    }

    pub fn segment_duration(mut self, duration: Duration) -> Self {
        self.segment_duration = duration;
        self
    }

    pub fn kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Shift every ingestion time by a deterministic amount in `[-jitter, jitter]`.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Extra silence between `sequence` and `sequence + 1`.
    pub fn gap_after(mut self, sequence: u64, gap: Duration) -> Self {
        *self.gaps.entry(sequence).or_default() += gap;
        self
    }

    pub fn build(self) -> SyntheticStream {
        let (mime, mime_type) = match self.kind {
            StreamKind::Audio => ("audio%2Fmp4", "audio/mp4"),
            StreamKind::Video => ("video%2Fwebm", "video/webm"),
        };
        let base_url = Url::parse(&format!(
            "https://synthetic.invalid/videoplayback/itag/{}/mime/{mime}/dur/{:.3}",
            self.id,
            self.segment_duration.as_secs_f64()
        ))
        .expect("synthetic base url");
        let descriptor = StreamDescriptor {
            id: self.id,
            kind: self.kind,
            mime_type: mime_type.to_owned(),
            base_url,
            segment_duration: self.segment_duration,
        };

        SyntheticStream {
            descriptor,
            head: self.segments - 1,
            earliest: self.earliest,
            reported_earliest: self.reported_earliest.unwrap_or(self.earliest),
            start: self.start,
            jitter: self.jitter,
            gaps: self.gaps,
            probes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }
}

#[derive(Default)]
struct Faults {
    probes_before_failure: Option<usize>,
    transient_fetches: HashMap<u64, u32>,
    removed: HashSet<u64>,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// A stream whose segment `n` is ingested at
/// `start + n * duration + gaps before n + jitter(n)`.
pub struct SyntheticStream {
    descriptor: StreamDescriptor,
    head: u64,
    earliest: u64,
    reported_earliest: u64,
    start: DateTime<Utc>,
    jitter: Duration,
    gaps: BTreeMap<u64, Duration>,
    probes: AtomicUsize,
    fetches: AtomicUsize,
    faults: Mutex<Faults>,
}

impl SyntheticStream {
    pub fn builder(id: &str) -> SyntheticStreamBuilder {
        SyntheticStreamBuilder {
            id: id.to_owned(),
            kind: StreamKind::Audio,
            segments: 100,
            earliest: 0,
            reported_earliest: None,
            segment_duration: Duration::from_secs(5),
            start: DateTime::from_timestamp(DEFAULT_START, 0).unwrap_or_default(),
            jitter: Duration::ZERO,
            gaps: BTreeMap::new(),
        }
    }

    /// Ingestion time of `sequence`.
    pub fn time_of(&self, sequence: u64) -> DateTime<Utc> {
        let nominal = self.descriptor.segment_duration.as_micros() as i64 * sequence as i64;
        let gaps: Duration = self.gaps.range(..sequence).map(|(_, gap)| *gap).sum();
        self.start
            + TimeDelta::microseconds(nominal)
            + TimeDelta::microseconds(gaps.as_micros() as i64)
            + TimeDelta::microseconds(self.jitter_of(sequence))
    }

    fn jitter_of(&self, sequence: u64) -> i64 {
        let bound = self.jitter.as_micros() as i64;
        if bound == 0 {
            return 0;
        }
        // splitmix64
        let mut z = sequence.wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        (z % (2 * bound as u64 + 1)) as i64 - bound
    }

    /// Number of `probe_time` calls.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Number of `fetch` calls, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.probes.store(0, Ordering::SeqCst);
        self.fetches.store(0, Ordering::SeqCst);
    }

    /// Let `probes` probes succeed, then fail every later one.
    pub fn fail_probes_from(&self, probes: usize) {
        self.faults.lock().probes_before_failure = Some(probes);
    }

    /// Fail the next `times` fetches of `sequence` with a retryable error.
    pub fn fail_fetch_transiently(&self, sequence: u64, times: u32) {
        self.faults.lock().transient_fetches.insert(sequence, times);
    }

    /// Make `sequence` unavailable at the origin.
    pub fn remove_segment(&self, sequence: u64) {
        self.faults.lock().removed.insert(sequence);
    }

    /// Cancel `token` when fetch number `fetches + 1` starts.
    pub fn cancel_after_fetches(&self, fetches: usize, token: CancellationToken) {
        self.faults.lock().cancel_after = Some((fetches, token));
    }

    fn gone(&self, sequence: u64) -> RewindError {
        RewindError::SegmentGone {
            stream: self.descriptor.id.clone(),
            sequence,
        }
    }

    fn is_available(&self, sequence: u64) -> bool {
        (self.earliest..=self.head).contains(&sequence)
            && !self.faults.lock().removed.contains(&sequence)
    }
}

#[async_trait]
impl SegmentStream for SyntheticStream {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    async fn head(&self) -> Result<Anchor> {
        Ok(Anchor::new(self.head, self.time_of(self.head)))
    }

    async fn probe_time(&self, sequence: u64) -> Result<DateTime<Utc>> {
        let count = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.faults.lock().probes_before_failure
            && count > limit
        {
            return Err(RewindError::transient(format!("probe of {sequence} failed")));
        }
        if !self.is_available(sequence) {
            return Err(self.gone(sequence));
        }
        Ok(self.time_of(sequence))
    }

    async fn fetch(&self, sequence: u64) -> Result<Bytes> {
        let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut faults = self.faults.lock();
            if let Some((limit, token)) = &faults.cancel_after
                && count > *limit
            {
                token.cancel();
                return Err(RewindError::Cancelled);
            }
            if let Some(remaining) = faults.transient_fetches.get_mut(&sequence)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(RewindError::transient(format!("fetch of {sequence} failed")));
            }
        }
        if !self.is_available(sequence) {
            return Err(self.gone(sequence));
        }

        let mut content = render_header(sequence, self.time_of(sequence), self.duration());
        content.extend_from_slice(format!("payload {} {sequence}\n", self.descriptor.id).as_bytes());
        Ok(Bytes::from(content))
    }

    async fn earliest(&self) -> Result<u64> {
        Ok(self.reported_earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaps_shift_later_segments() {
        let stream = SyntheticStream::builder("140")
            .segments(10)
            .gap_after(3, Duration::from_secs(60))
            .build();
        assert_eq!(stream.time_of(3) - stream.time_of(2), TimeDelta::seconds(5));
        assert_eq!(stream.time_of(4) - stream.time_of(3), TimeDelta::seconds(65));
    }

    #[test]
    fn jitter_is_bounded_and_stable() {
        let stream = SyntheticStream::builder("140")
            .segments(1_000)
            .jitter(Duration::from_millis(900))
            .build();
        for sequence in 0..1_000u64 {
            let offset = stream.time_of(sequence)
                - (stream.start + TimeDelta::seconds(5 * sequence as i64));
            assert!(offset.num_milliseconds().abs() <= 900);
            assert_eq!(stream.time_of(sequence), stream.time_of(sequence));
        }
    }

    #[tokio::test]
    async fn removed_segments_are_gone() {
        let stream = SyntheticStream::builder("140").segments(10).earliest(2).build();
        stream.remove_segment(5);
        assert!(stream.fetch(5).await.unwrap_err().is_segment_missing());
        assert!(stream.probe_time(1).await.unwrap_err().is_segment_missing());
        assert!(stream.fetch(4).await.is_ok());
        assert_eq!(stream.head().await.unwrap().sequence, 9);
    }
}
