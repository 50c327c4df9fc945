//! Adaptive search mapping a wall-clock time to a segment sequence.
//!
//! The search interpolates from the most recent anchors using an estimated
//! seconds-per-sequence rate, narrows a bracket around the target and returns
//! the floor segment: the last one ingested at (start) or before (end) the
//! target. Irregular cadence and gaps only cost extra probes; once both sides
//! of the target are known every candidate stays strictly inside the bracket,
//! and two stalled steps in a row are followed by a bisection. A step stalls
//! when it neither halves the bracket nor lands within one nominal duration
//! of the target.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::config::LocateConfig;
use crate::error::{Result, RewindError};
use crate::stream::{Anchor, SegmentStream};

/// One probe of a search: the sequence and `target - ingestion_time` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub sequence: u64,
    pub time_difference: f64,
}

/// The target lies outside the part of the stream that can be searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boundary {
    /// Older than the earliest retained segment.
    BeforeWindow,
    /// At or after the ingestion of the head segment.
    AtHead,
}

#[derive(Debug, Clone)]
pub struct LocateResult {
    pub sequence: u64,
    pub ingestion_time: DateTime<Utc>,
    /// `target - ingestion_time` of the located segment, in seconds.
    pub time_difference: f64,
    pub falls_in_gap: bool,
    /// First segment ingested after the target, when the search observed it.
    pub following: Option<Anchor>,
    pub boundary: Option<Boundary>,
    pub track: Vec<TrackPoint>,
}

impl LocateResult {
    pub fn anchor(&self) -> Anchor {
        Anchor::new(self.sequence, self.ingestion_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Start,
    End,
}

impl Edge {
    /// Whether a segment ingested at `time` lies at or before the target.
    fn is_floor(self, time: DateTime<Utc>, target: DateTime<Utc>) -> bool {
        match self {
            Edge::Start => time <= target,
            // An end exactly on a boundary belongs to the preceding segment.
            Edge::End => time < target,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegmentLocator {
    config: LocateConfig,
}

impl SegmentLocator {
    pub fn new(config: LocateConfig) -> Self {
        Self { config }
    }

    /// Locate the segment containing `target` as a start moment.
    pub async fn locate(
        &self,
        stream: &dyn SegmentStream,
        target: DateTime<Utc>,
        hint: Option<Anchor>,
    ) -> Result<LocateResult> {
        self.search(stream, target, hint, Edge::Start).await
    }

    /// Locate the segment containing `target` as an end moment.
    pub async fn locate_end(
        &self,
        stream: &dyn SegmentStream,
        target: DateTime<Utc>,
        hint: Option<Anchor>,
    ) -> Result<LocateResult> {
        self.search(stream, target, hint, Edge::End).await
    }

    /// First segment still retained by the origin.
    ///
    /// Checks the stream's estimate first, then bisects towards the head
    /// while the origin reports segments gone.
    #[instrument(skip_all, fields(stream = %stream.descriptor().id))]
    pub async fn earliest_retained(&self, stream: &dyn SegmentStream) -> Result<Anchor> {
        let head = stream.head().await?;
        let mut low = stream.earliest().await?.min(head.sequence);
        let mut found = head;
        let mut candidate = low;
        while low < found.sequence {
            match stream.probe_time(candidate).await {
                Ok(time) => found = Anchor::new(candidate, time),
                Err(err) if err.is_segment_missing() => low = candidate + 1,
                Err(err) => return Err(err),
            }
            candidate = low + (found.sequence - low) / 2;
        }
        debug!(sequence = found.sequence, "Earliest retained segment");
        Ok(found)
    }

    #[instrument(skip_all, fields(stream = %stream.descriptor().id, %target, ?edge))]
    async fn search(
        &self,
        stream: &dyn SegmentStream,
        target: DateTime<Utc>,
        hint: Option<Anchor>,
        edge: Edge,
    ) -> Result<LocateResult> {
        let mut track = Vec::new();
        let failed = |track: &Vec<TrackPoint>, err: RewindError| match err {
            RewindError::Cancelled => err,
            err => RewindError::LocateFailed {
                target,
                track: track.clone(),
                source: Box::new(err),
            },
        };

        let head = stream.head().await.map_err(|e| failed(&track, e))?;
        let mut earliest = stream
            .earliest()
            .await
            .map_err(|e| failed(&track, e))?
            .min(head.sequence);
        let nominal = stream.duration().as_secs_f64();

        if edge.is_floor(head.ingestion_time, target) {
            debug!(sequence = head.sequence, "Target at or after head");
            return Ok(LocateResult {
                sequence: head.sequence,
                ingestion_time: head.ingestion_time,
                time_difference: seconds(target - head.ingestion_time),
                falls_in_gap: false,
                following: None,
                boundary: Some(Boundary::AtHead),
                track,
            });
        }

        let mut floor: Option<Anchor> = None;
        let mut ceiling = head;
        let mut previous: Option<Anchor> = None;
        let mut latest = head;
        if let Some(hint) = hint.filter(|h| h.sequence >= earliest && h.sequence < head.sequence) {
            if edge.is_floor(hint.ingestion_time, target) {
                floor = Some(hint);
            } else {
                ceiling = hint;
            }
            previous = Some(head);
            latest = hint;
        }

        let cap = self
            .config
            .max_iterations
            .unwrap_or_else(|| default_iteration_cap(head.sequence - earliest));
        let tolerance = self.config.gap_tolerance.as_secs_f64();
        let mut probes = 0u32;
        // Consecutive probes that made little progress.
        let mut stalls = 0u32;
        // Set once a probe found the window shorter than estimated.
        let mut window_shrunk = false;

        loop {
            match floor {
                Some(floor) if floor.sequence + 1 == ceiling.sequence => {
                    let offset = seconds(target - floor.ingestion_time);
                    let falls_in_gap = offset > nominal + tolerance;
                    debug!(
                        sequence = floor.sequence,
                        offset,
                        falls_in_gap,
                        probes = track.len(),
                        "Located segment"
                    );
                    return Ok(LocateResult {
                        sequence: floor.sequence,
                        ingestion_time: floor.ingestion_time,
                        time_difference: offset,
                        falls_in_gap,
                        following: Some(ceiling),
                        boundary: None,
                        track,
                    });
                }
                None if ceiling.sequence <= earliest => {
                    debug!(sequence = ceiling.sequence, "Target before the retained window");
                    return Ok(LocateResult {
                        sequence: ceiling.sequence,
                        ingestion_time: ceiling.ingestion_time,
                        time_difference: seconds(target - ceiling.ingestion_time),
                        falls_in_gap: true,
                        following: Some(ceiling),
                        boundary: Some(Boundary::BeforeWindow),
                        track,
                    });
                }
                _ => {}
            }

            if probes >= cap {
                return Err(RewindError::NotConverged {
                    target,
                    iterations: probes,
                    track,
                });
            }

            let low = floor.map_or(earliest, |a| a.sequence + 1);
            let high = ceiling.sequence - 1;
            let bisect = stalls >= 2 || (window_shrunk && floor.is_none());
            let candidate = if bisect {
                low + (high - low) / 2
            } else {
                estimate(previous, latest, target, nominal).clamp(low, high)
            };
            let width_before = ceiling.sequence - floor.map_or(earliest, |a| a.sequence);

            probes += 1;
            let time = match stream.probe_time(candidate).await {
                Ok(time) => time,
                Err(err) if floor.is_none() && err.is_segment_missing() => {
                    debug!(sequence = candidate, "Segment no longer retained, moving window start");
                    earliest = candidate + 1;
                    window_shrunk = true;
                    continue;
                }
                Err(err) => return Err(failed(&track, err)),
            };

            let anchor = Anchor::new(candidate, time);
            let point = TrackPoint {
                sequence: candidate,
                time_difference: seconds(target - time),
            };
            trace!(sequence = candidate, diff = point.time_difference, bisect, "Probe");
            track.push(point);

            if edge.is_floor(time, target) {
                floor = Some(anchor);
            } else {
                ceiling = anchor;
            }
            previous = Some(latest);
            latest = anchor;

            let width_after = ceiling.sequence - floor.map_or(earliest, |a| a.sequence);
            stalls = if bisect
                || width_after * 2 <= width_before
                || point.time_difference.abs() <= nominal
            {
                0
            } else {
                stalls + 1
            };
        }
    }
}

/// `3 * ceil(log2(span + 2)) + 8` probes for a window of `span` sequences.
pub fn default_iteration_cap(span: u64) -> u32 {
    let n = span.saturating_add(2);
    let log2_ceil = u64::BITS - (n - 1).leading_zeros();
    3 * log2_ceil + 8
}

/// Interpolated candidate from the latest anchor.
fn estimate(previous: Option<Anchor>, latest: Anchor, target: DateTime<Utc>, nominal: f64) -> u64 {
    let rate = previous
        .filter(|p| p.sequence != latest.sequence)
        .map(|p| {
            seconds(latest.ingestion_time - p.ingestion_time)
                / (latest.sequence as f64 - p.sequence as f64)
        })
        .filter(|rate| rate.is_finite() && *rate > 0.0)
        .unwrap_or(nominal)
        .clamp(nominal / 2.0, nominal * 2.0);

    let steps = (seconds(target - latest.ingestion_time) / rate).round();
    let candidate = latest.sequence as f64 + steps;
    if candidate <= 0.0 {
        0
    } else {
        candidate as u64
    }
}

pub(crate) fn seconds(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}
