use std::path::PathBuf;

use clap::Parser;
use rewind_engine::StreamKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Segment base URLs, one per stream variant
    /// (e.g. `https://host/videoplayback/.../itag/140/mime/audio%2Fmp4/dur/5.000`)
    #[arg(required = true, num_args = 1..)]
    pub streams: Vec<String>,

    /// Interval as `<start>/<end>`. Each side is a date time, a sequence
    /// number, `@<unix time>`, an ISO 8601 duration (`PT30M`), a segment
    /// count (`+10`), `now`, `earliest`, or `..` in preview mode
    #[arg(short, long)]
    pub interval: String,

    /// Fetch only a short excerpt starting (or ending) at the given point
    #[arg(long)]
    pub preview: bool,

    /// Only fetch streams of this kind
    #[arg(long, value_enum)]
    pub only: Option<StreamKind>,

    /// Run directory for the fetched segments [default: ./rewind-<start>-<end>]
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Merge the fetched segments into this file with ffmpeg
    #[arg(short, long)]
    pub merge: Option<PathBuf>,

    /// ffmpeg binary used for merging
    #[arg(long, env = "REWIND_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Resolve the interval and print it without fetching
    #[arg(long)]
    pub dry_run: bool,

    /// Concurrent downloads per stream
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Keep the resume state after a successful run
    #[arg(long)]
    pub retain_state: bool,

    /// Remove a leftover lock of a crashed run
    #[arg(long)]
    pub force_unlock: bool,

    /// Do not read or write the metadata cache
    #[arg(long)]
    pub no_cache: bool,

    /// HTTP(S) proxy for every request
    #[arg(long)]
    pub proxy: Option<String>,

    /// Configuration file [default: <config dir>/rewind/config.toml]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}
