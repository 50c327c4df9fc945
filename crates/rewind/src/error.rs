use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use crate::locate::TrackPoint;

pub type Result<T, E = RewindError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RewindError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("segment metadata error: {reason}")]
    Metadata { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error(
        "requested interval is no longer within the stream's retained window \
         (stream {stream}, sequence {sequence})"
    )]
    SegmentGone { stream: String, sequence: u64 },

    #[error("failed to locate {target}: {source} (after {} probes)", track.len())]
    LocateFailed {
        target: DateTime<Utc>,
        track: Vec<TrackPoint>,
        #[source]
        source: Box<RewindError>,
    },

    #[error("locating {target} did not converge after {iterations} probes")]
    NotConverged {
        target: DateTime<Utc>,
        iterations: u32,
        track: Vec<TrackPoint>,
    },

    #[error("interval is empty: start sequence {start} is ahead of end sequence {end}")]
    EmptyInterval { start: u64, end: u64 },

    #[error("invalid interval: {reason}")]
    InvalidInterval { reason: String },

    #[error("sequence {sequence} is outside the retained window [{earliest}, {head}]")]
    SequenceOutOfWindow {
        sequence: u64,
        earliest: u64,
        head: u64,
    },

    #[error("run directory {} is locked by another fetch run", path.display())]
    RunLocked { path: PathBuf },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("cache error: {reason}")]
    Cache { reason: String },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RewindError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn metadata(reason: impl Into<String>) -> Self {
        Self::Metadata {
            reason: reason.into(),
        }
    }

    pub fn invalid_interval(reason: impl Into<String>) -> Self {
        Self::InvalidInterval {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Transient failures are retried at the point of use; everything else
    /// is surfaced to the caller as is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Io { .. }
            | Self::Metadata { .. }
            | Self::SegmentGone { .. }
            | Self::LocateFailed { .. }
            | Self::NotConverged { .. }
            | Self::EmptyInterval { .. }
            | Self::InvalidInterval { .. }
            | Self::SequenceOutOfWindow { .. }
            | Self::RunLocked { .. }
            | Self::Configuration { .. }
            | Self::Cache { .. }
            | Self::Merge { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// A chunk that is missing at the origin will not come back.
    pub fn is_segment_missing(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::NOT_FOUND || *status == StatusCode::GONE
            }
            Self::SegmentGone { .. } => true,
            _ => false,
        }
    }

    /// The probe track gathered before the failure, if any.
    pub fn track(&self) -> Option<&[TrackPoint]> {
        match self {
            Self::LocateFailed { track, .. } | Self::NotConverged { track, .. } => Some(track),
            _ => None,
        }
    }
}
