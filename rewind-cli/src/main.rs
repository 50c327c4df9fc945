mod cli;
mod config;
mod error;
mod merge;
mod progress;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use rewind_engine::{
    FetchPlan, FetchReport, MergeRequest, Merger, Notice, ResolveOptions, ResolvedInterval,
    RewindSession, SegmentStream, StreamDescriptor, parse_interval,
};
use serde::Serialize;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::merge::FfmpegMerger;
use crate::progress::BarProgress;

#[derive(Serialize)]
struct Summary<'a> {
    #[serde(flatten)]
    resolved: &'a ResolvedInterval,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a FetchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merged: Option<&'a PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose, args.quiet) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = config::load(args.config.as_deref())?;
    config::apply_overrides(&mut config, &args);
    let session = RewindSession::new(config)?;

    let descriptors = args
        .streams
        .iter()
        .map(|url| StreamDescriptor::from_base_url(url))
        .collect::<rewind_engine::Result<Vec<_>>>()?
        .into_iter()
        .filter(|d| args.only.is_none_or(|kind| d.kind == kind))
        .collect::<Vec<_>>();
    if descriptors.is_empty() {
        return Err(AppError::Input("no stream matches the selection".to_owned()));
    }
    let streams: Vec<Arc<dyn SegmentStream>> = descriptors
        .iter()
        .map(|d| Arc::new(session.http_stream(d.clone())) as Arc<dyn SegmentStream>)
        .collect();

    let token = session.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight writes");
            token.cancel();
        }
    });

    if let Some(head) = session.seed_from_cache(&descriptors).await {
        debug!(sequence = head.sequence, "Seeded locate from cached head");
    }

    // Variants of one stream share sequence numbers; the first one is probed.
    let reference = streams[0].as_ref();
    let (start, end) = parse_interval(&args.interval)?;
    let resolved = session
        .resolver()
        .resolve(
            reference,
            start,
            end,
            ResolveOptions {
                preview: args.preview,
            },
        )
        .await?;
    for notice in &resolved.notices {
        warn!("{}", describe(notice));
    }
    session.update_cache(&descriptors, reference.head().await?).await;

    let interval = &resolved.interval;
    info!(
        start = interval.start.sequence,
        end = interval.end.sequence,
        from = %interval.start.date,
        to = %interval.end.date,
        "Resolved interval"
    );

    if args.dry_run {
        return print_summary(&args, &resolved, None, None);
    }

    let destination = args.output_dir.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "rewind-{}-{}",
            interval.start.sequence, interval.end.sequence
        ))
    });
    let plan = FetchPlan::new(interval, streams.clone(), destination);
    let pipeline = session
        .pipeline()
        .with_progress(Arc::new(BarProgress::new(args.quiet || args.json)));
    let report = pipeline.run(&plan).await?;

    let merged = match &args.merge {
        Some(output) => {
            let request = MergeRequest::new(interval, &report, &streams, output)?;
            Some(FfmpegMerger::new(&args.ffmpeg).merge(&request).await?)
        }
        None => None,
    };

    print_summary(&args, &resolved, Some(&report), merged.as_ref())
}

fn describe(notice: &Notice) -> String {
    match notice {
        Notice::PreviewDiscarded { is_end, spec } => format!(
            "Preview mode: ignoring the {} `{spec}`",
            if *is_end { "end" } else { "start" }
        ),
        Notice::StartInGap { located, moved_to } => format!(
            "Start falls into a gap after segment {located}, starting at {moved_to}"
        ),
        Notice::EndInGap { sequence } => {
            format!("End falls into a gap, ending with segment {sequence}")
        }
        Notice::StartBeforeWindow { earliest } => format!(
            "Start is older than the retained window, starting at earliest segment {earliest}"
        ),
        Notice::EndAtHead { head } => {
            format!("End is ahead of the stream, ending at head segment {head}")
        }
    }
}

fn print_summary(
    args: &Args,
    resolved: &ResolvedInterval,
    report: Option<&FetchReport>,
    merged: Option<&PathBuf>,
) -> Result<()> {
    if args.json {
        let summary = Summary {
            resolved,
            report,
            merged,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let interval = &resolved.interval;
    println!(
        "Interval: {} .. {} ({} segments, {}s)",
        interval.start.sequence,
        interval.end.sequence,
        interval.segment_count(),
        interval.duration().num_milliseconds() as f64 / 1000.0
    );
    println!("  from {}", interval.start.date);
    println!("  to   {}", interval.end.date);
    if let Some(report) = report {
        println!(
            "Fetched {} segments, {} already present",
            report.fetched, report.skipped
        );
    }
    if let Some(merged) = merged {
        println!("Merged into {}", merged.display());
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| AppError::Input(format!("failed to install logger: {e}")))
}
