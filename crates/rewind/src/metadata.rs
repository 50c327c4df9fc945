//! Text header embedded at the start of every segment.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RewindError};

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)(Sequence-Number|Ingestion-Walltime-Us|Ingestion-Uncertainty-Us|Target-Duration-Us|First-Frame-Time-Us|First-Frame-Uncertainty-Us|Stream-Duration-Us|Max-Dvr-Duration-Us|Streamable|Encoding-Alias):\s(.+)\r\n",
    )
    .unwrap()
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub sequence_number: u64,
    pub ingestion_walltime: DateTime<Utc>,
    pub ingestion_uncertainty: Duration,
    pub target_duration: Duration,
    pub first_frame_time: DateTime<Utc>,
    pub first_frame_uncertainty: Duration,
    pub stream_duration: Option<Duration>,
    pub max_dvr_duration: Option<Duration>,
    pub streamable: Option<String>,
    pub encoding_alias: Option<String>,
}

impl SegmentMetadata {
    /// Parse the header from the full or partial content of a segment.
    pub fn parse(content: &[u8]) -> Result<Self> {
        let mut fields = Fields::default();
        for caps in FIELD_RE.captures_iter(content) {
            let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let value = std::str::from_utf8(value.as_bytes())
                .map_err(|_| RewindError::metadata("field value is not UTF-8"))?
                .trim();
            fields.set(name.as_bytes(), value);
        }

        Ok(Self {
            sequence_number: parse_int(fields.require("Sequence-Number", fields.sequence_number)?)?,
            ingestion_walltime: timestamp_us(
                fields.require("Ingestion-Walltime-Us", fields.ingestion_walltime)?,
            )?,
            ingestion_uncertainty: duration_us(
                fields.require("Ingestion-Uncertainty-Us", fields.ingestion_uncertainty)?,
            )?,
            target_duration: duration_us(
                fields.require("Target-Duration-Us", fields.target_duration)?,
            )?,
            first_frame_time: timestamp_us(
                fields.require("First-Frame-Time-Us", fields.first_frame_time)?,
            )?,
            first_frame_uncertainty: duration_us(
                fields.require("First-Frame-Uncertainty-Us", fields.first_frame_uncertainty)?,
            )?,
            stream_duration: fields.stream_duration.map(duration_us).transpose()?,
            max_dvr_duration: fields.max_dvr_duration.map(duration_us).transpose()?,
            streamable: fields.streamable.map(str::to_owned),
            encoding_alias: fields.encoding_alias.map(str::to_owned),
        })
    }
}

/// First occurrence of every known field.
#[derive(Default)]
struct Fields<'a> {
    sequence_number: Option<&'a str>,
    ingestion_walltime: Option<&'a str>,
    ingestion_uncertainty: Option<&'a str>,
    target_duration: Option<&'a str>,
    first_frame_time: Option<&'a str>,
    first_frame_uncertainty: Option<&'a str>,
    stream_duration: Option<&'a str>,
    max_dvr_duration: Option<&'a str>,
    streamable: Option<&'a str>,
    encoding_alias: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn set(&mut self, name: &[u8], value: &'a str) {
        let slot = match name {
            b"Sequence-Number" => &mut self.sequence_number,
            b"Ingestion-Walltime-Us" => &mut self.ingestion_walltime,
            b"Ingestion-Uncertainty-Us" => &mut self.ingestion_uncertainty,
            b"Target-Duration-Us" => &mut self.target_duration,
            b"First-Frame-Time-Us" => &mut self.first_frame_time,
            b"First-Frame-Uncertainty-Us" => &mut self.first_frame_uncertainty,
            b"Stream-Duration-Us" => &mut self.stream_duration,
            b"Max-Dvr-Duration-Us" => &mut self.max_dvr_duration,
            b"Streamable" => &mut self.streamable,
            b"Encoding-Alias" => &mut self.encoding_alias,
            _ => return,
        };
        slot.get_or_insert(value);
    }

    fn require(&self, name: &str, value: Option<&'a str>) -> Result<&'a str> {
        value.ok_or_else(|| RewindError::metadata(format!("missing field `{name}`")))
    }
}

fn parse_int(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|e| RewindError::metadata(format!("bad integer `{value}`: {e}")))
}

fn micros(value: &str) -> Result<i64> {
    // Some encoders write fractional microseconds.
    if let Ok(us) = value.parse::<i64>() {
        return Ok(us);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|us| us.is_finite())
        .map(|us| us.round() as i64)
        .ok_or_else(|| RewindError::metadata(format!("bad microsecond value `{value}`")))
}

fn timestamp_us(value: &str) -> Result<DateTime<Utc>> {
    let us = micros(value)?;
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| RewindError::metadata(format!("timestamp out of range: {us}")))
}

fn duration_us(value: &str) -> Result<Duration> {
    let us = micros(value)?;
    u64::try_from(us)
        .map(Duration::from_micros)
        .map_err(|_| RewindError::metadata(format!("negative duration: {us}")))
}

/// Render a header the way the origin does; used by test origins.
#[cfg(any(test, feature = "test-utils"))]
pub fn render_header(sequence: u64, ingestion_time: DateTime<Utc>, duration: Duration) -> Vec<u8> {
    let walltime = ingestion_time.timestamp_micros();
    let target = duration.as_micros();
    format!(
        "Sequence-Number: {sequence}\r\n\
         Ingestion-Walltime-Us: {walltime}\r\n\
         Ingestion-Uncertainty-Us: 57\r\n\
         Capture-Walltime-Us: {walltime}\r\n\
         Stream-Duration-Us: {stream}\r\n\
         Max-Dvr-Duration-Us: 14400000000\r\n\
         Target-Duration-Us: {target}\r\n\
         First-Frame-Time-Us: {walltime}\r\n\
         First-Frame-Uncertainty-Us: 62\r\n\
         Streamable: True\r\n\
         Encoding-Alias: L1_BA\r\n",
        stream = u128::from(sequence) * target,
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_embedded_header() {
        let t = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let mut content = vec![0u8, 0, 0, 0x1c, b'f', b't', b'y', b'p'];
        content.extend(render_header(7959120, t, Duration::from_secs(5)));
        content.extend([0xffu8; 64]);

        let meta = SegmentMetadata::parse(&content).unwrap();
        assert_eq!(meta.sequence_number, 7959120);
        assert_eq!(meta.ingestion_walltime, t);
        assert_eq!(meta.target_duration, Duration::from_secs(5));
        assert_eq!(meta.max_dvr_duration, Some(Duration::from_secs(14400)));
        assert_eq!(meta.streamable.as_deref(), Some("True"));
        assert_eq!(meta.encoding_alias.as_deref(), Some("L1_BA"));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let content = b"Sequence-Number: 3\r\nIngestion-Walltime-Us: 1000000\r\n\
            Ingestion-Uncertainty-Us: 1\r\nTarget-Duration-Us: 2000000\r\n\
            First-Frame-Time-Us: 1000000\r\nFirst-Frame-Uncertainty-Us: 1\r\n";
        let meta = SegmentMetadata::parse(content).unwrap();
        assert_eq!(meta.sequence_number, 3);
        assert!(meta.stream_duration.is_none());
        assert!(meta.encoding_alias.is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let err = SegmentMetadata::parse(b"Sequence-Number: 3\r\nIngestion-Walltime").unwrap_err();
        assert!(matches!(err, RewindError::Metadata { .. }));
    }
}
