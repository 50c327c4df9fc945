//! Resolution of a pair of endpoint specifications into a concrete interval.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::{Result, RewindError};
use crate::interval::{PointSpec, RewindInterval, RewindMoment};
use crate::locate::{Boundary, LocateResult, SegmentLocator};
use crate::session::RewindHistory;
use crate::stream::SegmentStream;

/// Non-fatal adjustments made while resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// Preview mode replaced a concrete endpoint.
    PreviewDiscarded { is_end: bool, spec: String },
    /// The start fell into a gap and moved to the next available segment.
    StartInGap { located: u64, moved_to: u64 },
    /// The end fell into a gap and stays on the last segment before it.
    EndInGap { sequence: u64 },
    /// The start is older than the retained window.
    StartBeforeWindow { earliest: u64 },
    /// The requested end is not ingested yet.
    EndAtHead { head: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    pub preview: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInterval {
    pub interval: RewindInterval,
    pub notices: Vec<Notice>,
}

type Resolution = (RewindMoment, Option<Notice>);

pub struct IntervalResolver {
    locator: SegmentLocator,
    history: RewindHistory,
    preview_duration: Duration,
}

impl IntervalResolver {
    pub fn new(locator: SegmentLocator, history: RewindHistory) -> Self {
        Self {
            locator,
            history,
            preview_duration: Duration::from_secs(10),
        }
    }

    pub fn with_preview_duration(mut self, preview_duration: Duration) -> Self {
        self.preview_duration = preview_duration;
        self
    }

    #[instrument(skip_all, fields(stream = %stream.descriptor().id, %start, %end, preview = options.preview))]
    pub async fn resolve(
        &self,
        stream: &dyn SegmentStream,
        start: PointSpec,
        end: PointSpec,
        options: ResolveOptions,
    ) -> Result<ResolvedInterval> {
        let mut notices = Vec::new();
        let (start, end) = self.prepare(start, end, options, &mut notices)?;
        for spec in [&start, &end] {
            if let PointSpec::Sequence(sequence) = spec {
                self.check_window(stream, *sequence).await?;
            }
        }
        let duration = stream.duration();

        let (start, end) = match (&start, &end) {
            (PointSpec::Open, end) => {
                let (end, end_notice) = self.absolute(stream, end, true).await?;
                let span = self.preview_span(duration);
                let target = shift(end.date, span, false)?;
                let (start, start_notice) = self.at_time(stream, target, false).await?;
                notices.extend(start_notice);
                notices.extend(end_notice);
                (start, end)
            }
            (start, PointSpec::Open) => {
                let (start, start_notice) = self.absolute(stream, start, false).await?;
                let span = self.preview_span(duration);
                let target = shift(start.date, span, true)?;
                let (end, end_notice) = self.at_time(stream, target, true).await?;
                notices.extend(start_notice);
                notices.extend(end_notice);
                (start, end)
            }
            (start, end) if start.is_relative() => {
                let (end, end_notice) = self.absolute(stream, end, true).await?;
                let (start, start_notice) = self.relative(stream, start, &end, false).await?;
                notices.extend(start_notice);
                notices.extend(end_notice);
                (start, end)
            }
            (start, end) if end.is_relative() => {
                let (start, start_notice) = self.absolute(stream, start, false).await?;
                let (end, end_notice) = self.relative(stream, end, &start, true).await?;
                notices.extend(start_notice);
                notices.extend(end_notice);
                (start, end)
            }
            (start, end) => {
                let ((start, start_notice), (end, end_notice)) = tokio::try_join!(
                    self.absolute(stream, start, false),
                    self.absolute(stream, end, true)
                )?;
                notices.extend(start_notice);
                notices.extend(end_notice);
                (start, end)
            }
        };

        let interval = RewindInterval::new(start, end)?;
        info!(
            start = interval.start.sequence,
            end = interval.end.sequence,
            segments = interval.segment_count(),
            "Resolved interval"
        );
        Ok(ResolvedInterval { interval, notices })
    }

    /// Validate the pair and apply everything that needs no stream access.
    fn prepare(
        &self,
        start: PointSpec,
        end: PointSpec,
        options: ResolveOptions,
        notices: &mut Vec<Notice>,
    ) -> Result<(PointSpec, PointSpec)> {
        let (start, end) = if options.preview {
            match (start, end) {
                (PointSpec::Open, PointSpec::Open) => {
                    return Err(RewindError::invalid_interval("both endpoints are open"));
                }
                (PointSpec::Open, end) => (PointSpec::Open, end),
                (start, end) => {
                    if end != PointSpec::Open {
                        notices.push(Notice::PreviewDiscarded {
                            is_end: true,
                            spec: end.to_string(),
                        });
                    }
                    (start, PointSpec::Open)
                }
            }
        } else {
            if start == PointSpec::Open || end == PointSpec::Open {
                return Err(RewindError::invalid_interval(
                    "an open endpoint is only allowed in preview mode",
                ));
            }
            (start, end)
        };

        if start.is_relative() && end.is_relative() {
            return Err(RewindError::invalid_interval("both endpoints are relative"));
        }
        if (start == PointSpec::Open && end.is_relative())
            || (end == PointSpec::Open && start.is_relative())
        {
            return Err(RewindError::invalid_interval(
                "an open endpoint needs an absolute other endpoint",
            ));
        }
        if start == PointSpec::Now {
            return Err(RewindError::invalid_interval("`now` is only allowed for the end"));
        }
        if end == PointSpec::Earliest {
            return Err(RewindError::invalid_interval(
                "`earliest` is only allowed for the start",
            ));
        }

        // Replacements only make sense next to a concrete date.
        match (&start, &end) {
            (PointSpec::Replace(replace), PointSpec::Time(date)) => {
                Ok((PointSpec::Time(replace.apply(*date)?), end))
            }
            (PointSpec::Time(date), PointSpec::Replace(replace)) => {
                let end = PointSpec::Time(replace.apply(*date)?);
                Ok((start, end))
            }
            (PointSpec::Replace(_), _) | (_, PointSpec::Replace(_)) => Err(
                RewindError::invalid_interval("replacement components need a date as the other endpoint"),
            ),
            _ => Ok((start, end)),
        }
    }

    fn preview_span(&self, segment_duration: Duration) -> TimeDelta {
        let span = self.preview_duration.max(segment_duration);
        TimeDelta::from_std(span).unwrap_or(TimeDelta::MAX)
    }

    async fn absolute(
        &self,
        stream: &dyn SegmentStream,
        spec: &PointSpec,
        is_end: bool,
    ) -> Result<Resolution> {
        match spec {
            PointSpec::Time(target) => self.at_time(stream, *target, is_end).await,
            PointSpec::Sequence(sequence) => {
                Ok((self.at_sequence(stream, *sequence, is_end).await?, None))
            }
            PointSpec::Now => {
                let head = stream.head().await?;
                let date = head.ingestion_time + segment_span(stream);
                Ok((RewindMoment::on_boundary(head.sequence, date, is_end), None))
            }
            PointSpec::Earliest => {
                let earliest = self.locator.earliest_retained(stream).await?;
                let date = if is_end {
                    earliest.ingestion_time + segment_span(stream)
                } else {
                    earliest.ingestion_time
                };
                Ok((RewindMoment::on_boundary(earliest.sequence, date, is_end), None))
            }
            PointSpec::Duration(_) | PointSpec::Segments(_) | PointSpec::Replace(_) | PointSpec::Open => {
                Err(RewindError::Internal {
                    reason: format!("`{spec}` is not an absolute endpoint"),
                })
            }
        }
    }

    async fn relative(
        &self,
        stream: &dyn SegmentStream,
        spec: &PointSpec,
        other: &RewindMoment,
        is_end: bool,
    ) -> Result<Resolution> {
        match spec {
            PointSpec::Duration(delta) => {
                let delta = TimeDelta::from_std(*delta)
                    .map_err(|_| RewindError::invalid_interval("duration is too large"))?;
                let target = shift(other.date, delta, is_end)?;
                self.at_time(stream, target, is_end).await
            }
            PointSpec::Segments(count) => {
                let sequence = if is_end {
                    other.sequence.checked_add(*count)
                } else {
                    other.sequence.checked_sub(*count)
                }
                .ok_or_else(|| RewindError::invalid_interval("segment count leaves the stream"))?;
                self.check_window(stream, sequence).await?;
                Ok((self.at_sequence(stream, sequence, is_end).await?, None))
            }
            _ => Err(RewindError::Internal {
                reason: format!("`{spec}` is not a relative endpoint"),
            }),
        }
    }

    async fn check_window(&self, stream: &dyn SegmentStream, sequence: u64) -> Result<()> {
        let head = stream.head().await?;
        let earliest = stream.earliest().await?;
        if sequence > head.sequence || sequence < earliest {
            return Err(RewindError::SequenceOutOfWindow {
                sequence,
                earliest,
                head: head.sequence,
            });
        }
        Ok(())
    }

    async fn at_sequence(
        &self,
        stream: &dyn SegmentStream,
        sequence: u64,
        is_end: bool,
    ) -> Result<RewindMoment> {
        let time = match stream.probe_time(sequence).await {
            Ok(time) => time,
            // The estimated window was too generous.
            Err(err) if err.is_segment_missing() => {
                let earliest = self.locator.earliest_retained(stream).await?;
                let head = stream.head().await?;
                return Err(RewindError::SequenceOutOfWindow {
                    sequence,
                    earliest: earliest.sequence,
                    head: head.sequence,
                });
            }
            Err(err) => return Err(err),
        };
        let date = if is_end {
            time + segment_span(stream)
        } else {
            time
        };
        Ok(RewindMoment::on_boundary(sequence, date, is_end))
    }

    async fn at_time(
        &self,
        stream: &dyn SegmentStream,
        target: DateTime<Utc>,
        is_end: bool,
    ) -> Result<Resolution> {
        let id = &stream.descriptor().id;
        let hint = self.history.closest(id, target);
        let result = if is_end {
            self.locator.locate_end(stream, target, hint).await?
        } else {
            self.locator.locate(stream, target, hint).await?
        };
        self.remember(id, &result);

        let resolution = if is_end {
            self.end_moment(stream, target, result)?
        } else {
            self.start_moment(stream, target, result)?
        };
        debug!(
            sequence = resolution.0.sequence,
            cut_at = resolution.0.cut_at.as_secs_f64(),
            falls_in_gap = resolution.0.falls_in_gap,
            is_end,
            "Located moment"
        );
        Ok(resolution)
    }

    fn start_moment(
        &self,
        stream: &dyn SegmentStream,
        target: DateTime<Utc>,
        result: LocateResult,
    ) -> Result<Resolution> {
        if result.boundary == Some(Boundary::BeforeWindow) {
            let moment = RewindMoment {
                target_time: Some(target),
                falls_in_gap: true,
                ..RewindMoment::on_boundary(result.sequence, result.ingestion_time, false)
            };
            let notice = Notice::StartBeforeWindow {
                earliest: result.sequence,
            };
            return Ok((moment, Some(notice)));
        }

        if result.falls_in_gap {
            let next = result.following.ok_or_else(|| RewindError::Internal {
                reason: "gap located without the following segment".into(),
            })?;
            let moment = RewindMoment {
                target_time: Some(target),
                falls_in_gap: true,
                ..RewindMoment::on_boundary(next.sequence, next.ingestion_time, false)
            };
            let notice = Notice::StartInGap {
                located: result.sequence,
                moved_to: next.sequence,
            };
            return Ok((moment, Some(notice)));
        }

        // Bounded by the segment; a start past the end of the head keeps the head.
        let cut_at = cut_offset(result.time_difference, stream.duration());
        let moment = RewindMoment {
            date: target,
            target_time: Some(target),
            sequence: result.sequence,
            cut_at: if cut_at >= stream.duration() {
                Duration::ZERO
            } else {
                cut_at
            },
            is_end: false,
            falls_in_gap: false,
        };
        Ok((moment, None))
    }

    fn end_moment(
        &self,
        stream: &dyn SegmentStream,
        target: DateTime<Utc>,
        result: LocateResult,
    ) -> Result<Resolution> {
        let span = segment_span(stream);
        match result.boundary {
            Some(Boundary::BeforeWindow) => {
                return Err(RewindError::invalid_interval(format!(
                    "end {target} lies before the earliest retained segment {}",
                    result.sequence
                )));
            }
            Some(Boundary::AtHead) if target > result.ingestion_time + span => {
                let moment = RewindMoment {
                    target_time: Some(target),
                    ..RewindMoment::on_boundary(result.sequence, result.ingestion_time + span, true)
                };
                let notice = Notice::EndAtHead {
                    head: result.sequence,
                };
                return Ok((moment, Some(notice)));
            }
            _ => {}
        }

        if result.falls_in_gap {
            let moment = RewindMoment {
                target_time: Some(target),
                falls_in_gap: true,
                ..RewindMoment::on_boundary(result.sequence, result.ingestion_time + span, true)
            };
            let notice = Notice::EndInGap {
                sequence: result.sequence,
            };
            return Ok((moment, Some(notice)));
        }

        let moment = RewindMoment {
            date: target,
            target_time: Some(target),
            sequence: result.sequence,
            cut_at: cut_offset(result.time_difference, stream.duration()),
            is_end: true,
            falls_in_gap: false,
        };
        Ok((moment, None))
    }

    fn remember(&self, stream: &str, result: &LocateResult) {
        self.history.record(stream, result.anchor());
        if let Some(next) = result.following {
            self.history.record(stream, next);
        }
    }
}

/// Move `date` by `delta`, forwards for an end and backwards for a start.
fn shift(date: DateTime<Utc>, delta: TimeDelta, forwards: bool) -> Result<DateTime<Utc>> {
    if forwards {
        date.checked_add_signed(delta)
    } else {
        date.checked_sub_signed(delta)
    }
    .ok_or_else(|| RewindError::invalid_interval("duration leaves the representable time range"))
}

fn segment_span(stream: &dyn SegmentStream) -> TimeDelta {
    TimeDelta::from_std(stream.duration()).unwrap_or(TimeDelta::zero())
}

/// Offset into a segment, clamped to `[0, duration]`.
fn cut_offset(time_difference: f64, duration: Duration) -> Duration {
    Duration::try_from_secs_f64(time_difference.max(0.0))
        .unwrap_or(Duration::ZERO)
        .min(duration)
}
