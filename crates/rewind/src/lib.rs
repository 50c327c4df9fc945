//! Locate, resolve and resumably fetch excerpts of live segmented streams.
//!
//! A stream is a growing run of fixed-nominal-length segments numbered by a
//! sequence. [`SegmentLocator`] maps wall-clock times to sequences by probing
//! segment headers, [`IntervalResolver`] turns loose interval endpoints into a
//! validated [`RewindInterval`], and [`FetchPipeline`] downloads the range with
//! crash-safe resume state.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod interval;
pub mod locate;
pub mod merge;
pub mod metadata;
pub mod probe;
pub mod resolve;
pub mod resume;
pub mod retry;
pub mod session;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use cache::{CachedStreams, MetadataCache};
pub use config::RewindConfig;
pub use error::{Result, RewindError};
pub use fetch::{FetchPipeline, FetchPlan, FetchReport, ProgressReporter};
pub use interval::{PointSpec, RewindInterval, RewindMoment, parse_interval};
pub use locate::{Boundary, LocateResult, SegmentLocator};
pub use merge::{MergeInput, MergeRequest, Merger};
pub use probe::HttpStream;
pub use resolve::{IntervalResolver, Notice, ResolveOptions, ResolvedInterval};
pub use resume::Fingerprint;
pub use retry::RetryPolicy;
pub use session::{RewindHistory, RewindSession};
pub use stream::{Anchor, SegmentStream, StreamDescriptor, StreamKind};
