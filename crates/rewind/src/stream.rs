//! Stream variants and the capability the engine needs from them.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::DEFAULT_RETENTION_WINDOW;
use crate::error::{Result, RewindError};

/// A known `(sequence, ingestion time)` point of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub sequence: u64,
    pub ingestion_time: DateTime<Utc>,
}

impl Anchor {
    pub fn new(sequence: u64, ingestion_time: DateTime<Utc>) -> Self {
        Self {
            sequence,
            ingestion_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum StreamKind {
    Audio,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => f.write_str("audio"),
            StreamKind::Video => f.write_str("video"),
        }
    }
}

/// One media variant of a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Variant identifier, unique within a stream (an itag for the HTTP origin).
    pub id: String,
    pub kind: StreamKind,
    pub mime_type: String,
    pub base_url: Url,
    /// Nominal segment duration.
    pub segment_duration: Duration,
}

impl StreamDescriptor {
    /// Build a descriptor from a segment base URL carrying path parameters,
    /// e.g. `https://host/videoplayback/itag/140/mime/audio%2Fmp4/dur/5.000`.
    pub fn from_base_url(input: &str) -> Result<Self> {
        let base_url =
            Url::parse(input).map_err(|e| RewindError::invalid_url(input, e.to_string()))?;

        let segments: Vec<&str> = base_url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let param = |name: &str| {
            segments
                .windows(2)
                .find(|pair| pair[0] == name)
                .map(|pair| pair[1])
        };

        let id = param("itag")
            .ok_or_else(|| RewindError::invalid_url(input, "missing `itag` path parameter"))?
            .to_owned();
        let mime_type = param("mime")
            .map(|raw| {
                urlencoding::decode(raw)
                    .map(|decoded| decoded.into_owned())
                    .map_err(|e| RewindError::invalid_url(input, format!("bad `mime`: {e}")))
            })
            .transpose()?
            .ok_or_else(|| RewindError::invalid_url(input, "missing `mime` path parameter"))?;
        let kind = kind_from_mime(&mime_type)
            .ok_or_else(|| RewindError::invalid_url(input, format!("unsupported mime `{mime_type}`")))?;
        let segment_duration = param("dur")
            .ok_or_else(|| RewindError::invalid_url(input, "missing `dur` path parameter"))?
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .ok_or_else(|| RewindError::invalid_url(input, "`dur` is not a positive number"))?;

        Ok(Self {
            id,
            kind,
            mime_type,
            base_url,
            segment_duration,
        })
    }

    /// File extension of the segments of this variant.
    pub fn extension(&self) -> &str {
        let subtype = self
            .mime_type
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .unwrap_or(self.mime_type.as_str());
        match (self.kind, subtype) {
            (StreamKind::Audio, "mp4") => "m4a",
            (_, subtype) => subtype,
        }
    }

    /// Local file name of a segment: `<sequence>.<id>.<extension>`.
    pub fn segment_file_name(&self, sequence: u64) -> String {
        format!("{sequence}.{}.{}", self.id, self.extension())
    }

    /// Absolute URL of a segment: `<base>/sq/<sequence>`.
    pub fn segment_url(&self, sequence: u64) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RewindError::invalid_url(self.base_url.as_str(), "cannot be a base"))?
            .pop_if_empty()
            .push("sq")
            .push(&sequence.to_string());
        Ok(url)
    }
}

fn kind_from_mime(mime_type: &str) -> Option<StreamKind> {
    match mime_type.split_once('/')?.0 {
        "audio" => Some(StreamKind::Audio),
        "video" => Some(StreamKind::Video),
        _ => None,
    }
}

/// Read access to one variant of a live stream.
///
/// Implementations are shared between concurrent locates and fetches, so every
/// method takes `&self`.
#[async_trait]
pub trait SegmentStream: Send + Sync {
    fn descriptor(&self) -> &StreamDescriptor;

    /// Latest complete segment and its ingestion time.
    async fn head(&self) -> Result<Anchor>;

    /// Ingestion time of a segment, read without downloading its payload.
    async fn probe_time(&self, sequence: u64) -> Result<DateTime<Utc>>;

    /// Full payload of a segment. A single attempt; callers own retries.
    async fn fetch(&self, sequence: u64) -> Result<Bytes>;

    fn duration(&self) -> Duration {
        self.descriptor().segment_duration
    }

    fn retention_window(&self) -> Duration {
        DEFAULT_RETENTION_WINDOW
    }

    /// Earliest sequence still retained by the origin, estimated from the
    /// head and the retention window.
    async fn earliest(&self) -> Result<u64> {
        let head = self.head().await?;
        let per_segment = self.duration().as_secs_f64();
        let window = (self.retention_window().as_secs_f64() / per_segment).floor() as u64;
        Ok(head.sequence.saturating_sub(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://rr1.example.com/videoplayback/expire/1700000000/itag/140/mime/audio%2Fmp4/dur/5.000/";

    #[test]
    fn descriptor_from_base_url() {
        let descriptor = StreamDescriptor::from_base_url(BASE).unwrap();
        assert_eq!(descriptor.id, "140");
        assert_eq!(descriptor.kind, StreamKind::Audio);
        assert_eq!(descriptor.mime_type, "audio/mp4");
        assert_eq!(descriptor.segment_duration, Duration::from_secs(5));
        assert_eq!(descriptor.extension(), "m4a");
        assert_eq!(descriptor.segment_file_name(7959120), "7959120.140.m4a");
    }

    #[test]
    fn segment_url_appends_sequence() {
        let descriptor = StreamDescriptor::from_base_url(BASE).unwrap();
        let url = descriptor.segment_url(42).unwrap();
        assert!(url.as_str().ends_with("/dur/5.000/sq/42"), "{url}");
    }

    #[test]
    fn missing_itag_is_rejected() {
        let err = StreamDescriptor::from_base_url(
            "https://example.com/videoplayback/mime/video%2Fwebm/dur/2.000",
        )
        .unwrap_err();
        assert!(matches!(err, RewindError::InvalidUrl { .. }));
    }

    #[test]
    fn oversized_duration_is_rejected() {
        for dur in ["1e30", "0", "-5", "inf"] {
            let err = StreamDescriptor::from_base_url(&format!(
                "https://example.com/videoplayback/itag/140/mime/audio%2Fmp4/dur/{dur}"
            ))
            .unwrap_err();
            assert!(matches!(err, RewindError::InvalidUrl { .. }), "{dur}: {err:?}");
        }
    }

    #[test]
    fn video_webm_keeps_subtype_extension() {
        let descriptor = StreamDescriptor::from_base_url(
            "https://example.com/videoplayback/itag/248/mime/video%2Fwebm/dur/2.000",
        )
        .unwrap();
        assert_eq!(descriptor.kind, StreamKind::Video);
        assert_eq!(descriptor.segment_file_name(3), "3.248.webm");
    }
}
