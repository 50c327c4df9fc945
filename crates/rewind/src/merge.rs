//! Hand-off of fetched segments to an external merge tool.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Result, RewindError};
use crate::fetch::FetchReport;
use crate::interval::RewindInterval;
use crate::locate::seconds;
use crate::stream::{SegmentStream, StreamKind};

/// Segments of one stream, in playback order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeInput {
    pub stream: String,
    pub kind: StreamKind,
    pub paths: Vec<PathBuf>,
    /// Seconds to drop from the start of the first segment.
    pub cut_start: Option<f64>,
    /// Seconds to keep of the last segment.
    pub cut_end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRequest {
    pub inputs: Vec<MergeInput>,
    /// Length of the excerpt in seconds, from the start cut to the end cut.
    pub duration: f64,
    pub output: PathBuf,
}

impl MergeRequest {
    /// Build the request for a fetched interval. Boundaries in a gap are not
    /// trimmed.
    pub fn new(
        interval: &RewindInterval,
        report: &FetchReport,
        streams: &[Arc<dyn SegmentStream>],
        output: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut inputs = Vec::with_capacity(streams.len());
        for stream in streams {
            let descriptor = stream.descriptor();
            let files = report.paths.get(&descriptor.id).ok_or_else(|| RewindError::Internal {
                reason: format!("no fetched segments for stream {}", descriptor.id),
            })?;

            let paths = interval
                .sequences()
                .map(|sequence| {
                    files.get(&sequence).cloned().ok_or_else(|| RewindError::Internal {
                        reason: format!("segment {sequence} of stream {} was not fetched", descriptor.id),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let duration = stream.duration();
            let cut_start = interval
                .start
                .needs_trim(duration)
                .then(|| interval.start.cut_at.as_secs_f64());
            let cut_end = interval
                .end
                .needs_trim(duration)
                .then(|| interval.end.cut_at.as_secs_f64());

            inputs.push(MergeInput {
                stream: descriptor.id.clone(),
                kind: descriptor.kind,
                paths,
                cut_start,
                cut_end,
            });
        }

        Ok(Self {
            inputs,
            duration: seconds(interval.duration()),
            output: output.into(),
        })
    }

    pub fn needs_trim(&self) -> bool {
        self.inputs
            .iter()
            .any(|input| input.cut_start.is_some() || input.cut_end.is_some())
    }
}

/// External tool that muxes segments into one container.
#[async_trait]
pub trait Merger: Send + Sync {
    /// Merge and return the path of the written file.
    async fn merge(&self, request: &MergeRequest) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::RewindMoment;
    use crate::resume::Fingerprint;
    use crate::test_support::SyntheticStream;
    use chrono::TimeDelta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn report(streams: &[&str], sequences: std::ops::RangeInclusive<u64>) -> FetchReport {
        let paths = streams
            .iter()
            .map(|id| {
                let files: BTreeMap<u64, PathBuf> = sequences
                    .clone()
                    .map(|seq| (seq, PathBuf::from(format!("/tmp/run/{seq}.{id}.m4a"))))
                    .collect();
                (id.to_string(), files)
            })
            .collect();
        FetchReport {
            fingerprint: Fingerprint::compute(10, 12, streams, std::path::Path::new("/tmp/run"))
                .unwrap(),
            paths,
            fetched: 3,
            skipped: 0,
        }
    }

    fn moment(sequence: u64, cut_at: Duration, is_end: bool, falls_in_gap: bool) -> RewindMoment {
        RewindMoment {
            date: chrono::DateTime::UNIX_EPOCH + TimeDelta::seconds(sequence as i64 * 5),
            target_time: None,
            sequence,
            cut_at,
            is_end,
            falls_in_gap,
        }
    }

    #[test]
    fn cuts_follow_interval_boundaries() {
        let stream: Arc<dyn SegmentStream> =
            Arc::new(SyntheticStream::builder("140").segments(50).build());
        let interval = RewindInterval::new(
            moment(10, Duration::from_millis(1_500), false, false),
            moment(12, Duration::from_secs(2), true, false),
        )
        .unwrap();
        let request =
            MergeRequest::new(&interval, &report(&["140"], 10..=12), &[stream], "/tmp/out.mp4")
                .unwrap();

        let input = &request.inputs[0];
        assert_eq!(input.paths.len(), 3);
        assert!(input.paths[0].ends_with("10.140.m4a"));
        assert_eq!(input.cut_start, Some(1.5));
        assert_eq!(input.cut_end, Some(2.0));
        assert!(request.needs_trim());
        assert_eq!(request.duration, 10.0);
    }

    #[test]
    fn gap_boundaries_are_not_trimmed() {
        let stream: Arc<dyn SegmentStream> =
            Arc::new(SyntheticStream::builder("140").segments(50).build());
        let interval = RewindInterval::new(
            moment(10, Duration::ZERO, false, true),
            moment(12, Duration::from_secs(5), true, false),
        )
        .unwrap();
        let request =
            MergeRequest::new(&interval, &report(&["140"], 10..=12), &[stream], "/tmp/out.mp4")
                .unwrap();
        assert_eq!(request.inputs[0].cut_start, None);
        assert_eq!(request.inputs[0].cut_end, None);
        assert!(!request.needs_trim());
    }

    #[test]
    fn missing_segment_is_reported() {
        let stream: Arc<dyn SegmentStream> =
            Arc::new(SyntheticStream::builder("140").segments(50).build());
        let interval = RewindInterval::new(
            moment(10, Duration::ZERO, false, false),
            moment(13, Duration::ZERO, true, false),
        )
        .unwrap();
        let err = MergeRequest::new(&interval, &report(&["140"], 10..=12), &[stream], "/tmp/o")
            .unwrap_err();
        assert!(matches!(err, RewindError::Internal { .. }));
    }
}
