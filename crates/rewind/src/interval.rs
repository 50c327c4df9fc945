//! Rewind moments, intervals and the endpoint specifications they are resolved from.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RewindError};

/// A located boundary of an excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewindMoment {
    /// Wall-clock time of the boundary. For a time-based moment this is the
    /// requested time; otherwise the start (or end) of the boundary segment.
    pub date: DateTime<Utc>,
    /// The requested wall-clock time, when the moment was located by time.
    pub target_time: Option<DateTime<Utc>>,
    pub sequence: u64,
    /// Offset into the boundary segment. A start drops everything before it;
    /// an end keeps everything before it. Zero means no trimming.
    pub cut_at: Duration,
    pub is_end: bool,
    pub falls_in_gap: bool,
}

impl RewindMoment {
    /// Moment on a segment boundary; nothing to trim.
    pub fn on_boundary(sequence: u64, date: DateTime<Utc>, is_end: bool) -> Self {
        Self {
            date,
            target_time: None,
            sequence,
            cut_at: Duration::ZERO,
            is_end,
            falls_in_gap: false,
        }
    }

    /// Whether the boundary segment has to be trimmed at `cut_at`.
    pub fn needs_trim(&self, segment_duration: Duration) -> bool {
        !self.falls_in_gap && !self.cut_at.is_zero() && !(self.is_end && self.cut_at >= segment_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewindInterval {
    pub start: RewindMoment,
    pub end: RewindMoment,
}

impl RewindInterval {
    pub fn new(start: RewindMoment, end: RewindMoment) -> Result<Self> {
        if start.sequence > end.sequence {
            return Err(RewindError::EmptyInterval {
                start: start.sequence,
                end: end.sequence,
            });
        }
        Ok(Self { start, end })
    }

    pub fn sequences(&self) -> RangeInclusive<u64> {
        self.start.sequence..=self.end.sequence
    }

    pub fn segment_count(&self) -> u64 {
        self.end.sequence - self.start.sequence + 1
    }

    pub fn duration(&self) -> TimeDelta {
        self.end.date - self.start.date
    }
}

/// Components of a date and time that replace those of the other endpoint,
/// written as `2024Y3M1D`, `T12H30M` or both (`1DT6H`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateReplacement {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
}

impl DateReplacement {
    pub fn apply(&self, date: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let day = NaiveDate::from_ymd_opt(
            self.year.unwrap_or(date.year()),
            self.month.unwrap_or(date.month()),
            self.day.unwrap_or(date.day()),
        );
        let time = NaiveTime::from_hms_nano_opt(
            self.hour.unwrap_or(date.hour()),
            self.minute.unwrap_or(date.minute()),
            self.second.unwrap_or(date.second()),
            date.nanosecond(),
        );
        match (day, time) {
            (Some(day), Some(time)) => Ok(NaiveDateTime::new(day, time).and_utc()),
            _ => Err(RewindError::invalid_interval(format!(
                "replacing components of {date} gives an invalid date"
            ))),
        }
    }

    fn parse(input: &str) -> Option<Self> {
        let (date_part, time_part) = match input.split_once('T') {
            Some((date, time)) => (date, time),
            None => (input, ""),
        };
        let mut replacement = Self::default();
        let mut any = false;

        for (part, is_time) in [(date_part, false), (time_part, true)] {
            let mut digits = String::new();
            for c in part.chars() {
                if c.is_ascii_digit() {
                    digits.push(c);
                    continue;
                }
                if digits.is_empty() {
                    return None;
                }
                let value: u32 = digits.parse().ok()?;
                match (is_time, c) {
                    (false, 'Y') => replacement.year = Some(i32::try_from(value).ok()?),
                    (false, 'M') => replacement.month = Some(value),
                    (false, 'D') => replacement.day = Some(value),
                    (true, 'H') => replacement.hour = Some(value),
                    (true, 'M') => replacement.minute = Some(value),
                    (true, 'S') => replacement.second = Some(value),
                    _ => return None,
                }
                digits.clear();
                any = true;
            }
            if !digits.is_empty() {
                return None;
            }
        }
        any.then_some(replacement)
    }
}

/// One endpoint of a requested interval.
#[derive(Debug, Clone, PartialEq)]
pub enum PointSpec {
    Time(DateTime<Utc>),
    Sequence(u64),
    /// Duration away from the other endpoint.
    Duration(Duration),
    /// Number of segments away from the other endpoint.
    Segments(u64),
    Replace(DateReplacement),
    Now,
    Earliest,
    /// Left open; filled in by preview mode.
    Open,
}

impl PointSpec {
    /// Needs the other endpoint to be resolved first.
    pub fn is_relative(&self) -> bool {
        matches!(
            self,
            PointSpec::Duration(_) | PointSpec::Segments(_) | PointSpec::Replace(_)
        )
    }
}

impl fmt::Display for PointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointSpec::Time(t) => write!(f, "{}", t.to_rfc3339()),
            PointSpec::Sequence(s) => write!(f, "{s}"),
            PointSpec::Duration(d) => write!(f, "PT{}S", d.as_secs_f64()),
            PointSpec::Segments(n) => write!(f, "{n} segments"),
            PointSpec::Replace(r) => write!(f, "{r:?}"),
            PointSpec::Now => f.write_str("now"),
            PointSpec::Earliest => f.write_str("earliest"),
            PointSpec::Open => f.write_str(".."),
        }
    }
}

impl FromStr for PointSpec {
    type Err = RewindError;

    fn from_str(input: &str) -> Result<Self> {
        let part = input.trim();
        let invalid = || RewindError::invalid_interval(format!("unrecognized interval part `{part}`"));

        match part {
            "" => Err(invalid()),
            "now" => Ok(PointSpec::Now),
            "earliest" => Ok(PointSpec::Earliest),
            ".." => Ok(PointSpec::Open),
            p if p.bytes().all(|b| b.is_ascii_digit()) => {
                p.parse().map(PointSpec::Sequence).map_err(|_| invalid())
            }
            p if p.starts_with('+') => match p[1..].parse() {
                Ok(count) if count > 0 => Ok(PointSpec::Segments(count)),
                _ => Err(invalid()),
            },
            p if p.starts_with('@') => {
                let secs: f64 = p[1..].parse().map_err(|_| invalid())?;
                let micros = (secs * 1_000_000.0).round() as i64;
                DateTime::from_timestamp_micros(micros)
                    .map(PointSpec::Time)
                    .ok_or_else(invalid)
            }
            p if p.starts_with('P') => parse_iso_duration(p).map(PointSpec::Duration).ok_or_else(invalid),
            p if p.bytes().all(|b| b.is_ascii_digit() || b"YMDHST".contains(&b)) => {
                DateReplacement::parse(p).map(PointSpec::Replace).ok_or_else(invalid)
            }
            p => parse_date_time(p).map(PointSpec::Time).ok_or_else(invalid),
        }
    }
}

/// Parse `<start>/<end>` and reject combinations that cannot be resolved.
pub fn parse_interval(input: &str) -> Result<(PointSpec, PointSpec)> {
    let (start, end) = input
        .split_once('/')
        .filter(|(_, end)| !end.contains('/'))
        .ok_or_else(|| RewindError::invalid_interval("interval must be formatted as `<start>/<end>`"))?;
    let start: PointSpec = start.parse()?;
    let end: PointSpec = end.parse()?;

    match (&start, &end) {
        (s, e) if s.is_relative() && e.is_relative() => {
            return Err(RewindError::invalid_interval("both endpoints are relative"));
        }
        (PointSpec::Open, PointSpec::Open) => {
            return Err(RewindError::invalid_interval("two `..` are ambiguous"));
        }
        (PointSpec::Time(s), PointSpec::Time(e)) if s >= e => {
            return Err(RewindError::invalid_interval(format!(
                "start is ahead of or equal to end: {s} >= {e}"
            )));
        }
        (PointSpec::Sequence(s), PointSpec::Sequence(e)) if s > e => {
            return Err(RewindError::EmptyInterval { start: *s, end: *e });
        }
        _ => {}
    }
    Ok((start, end))
}

fn parse_date_time(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(input) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M%:z", "%Y%m%dT%H%M%S%z"] {
        if let Ok(date) = DateTime::parse_from_str(input, format) {
            return Some(date.with_timezone(&Utc));
        }
    }
    // Naive date times are taken as UTC.
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y%m%dT%H%M%S",
    ] {
        if let Ok(date) = NaiveDateTime::parse_from_str(input, format) {
            return Some(date.and_utc());
        }
    }
    None
}

/// ISO 8601 duration: `P[nW][nD][T[nH][nM][nS]]`, seconds may be fractional.
fn parse_iso_duration(input: &str) -> Option<Duration> {
    let body = input.strip_prefix('P')?;
    if body.is_empty() {
        return None;
    }
    let (date_part, time_part) = match body.split_once('T') {
        Some((_, "")) => return None,
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut total = 0f64;
    for (part, units) in [
        (date_part, &[('W', 604_800.0), ('D', 86_400.0)][..]),
        (time_part.unwrap_or(""), &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)][..]),
    ] {
        let mut number = String::new();
        let mut next_unit = 0;
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let position = units[next_unit..].iter().position(|(unit, _)| *unit == c)?;
            let (_, scale) = units[next_unit + position];
            next_unit += position + 1;
            total += number.parse::<f64>().ok()? * scale;
            number.clear();
        }
        if !number.is_empty() {
            return None;
        }
    }
    Duration::try_from_secs_f64(total).ok()
}
