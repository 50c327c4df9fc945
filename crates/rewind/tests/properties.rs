//! End-to-end behaviour of locate, resolve and fetch on synthetic streams.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use rewind_engine::config::FetchConfig;
use rewind_engine::fetch::inspect_state;
use rewind_engine::test_support::SyntheticStream;
use rewind_engine::{
    FetchPipeline, FetchPlan, IntervalResolver, PointSpec, ResolveOptions, RewindError,
    RewindHistory, SegmentLocator, SegmentStream,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn fetch_config() -> FetchConfig {
    let mut config = FetchConfig::default();
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.jitter = false;
    config
}

fn resolver() -> IntervalResolver {
    IntervalResolver::new(SegmentLocator::default(), RewindHistory::default())
}

mod locate {
    use super::*;

    #[tokio::test]
    async fn converges_to_floor_segment_without_gaps() {
        let stream = SyntheticStream::builder("140").segments(50_000).build();
        let locator = SegmentLocator::default();
        for sequence in [0, 1, 777, 25_000, 49_998] {
            for offset in [0, 1_000, 4_999] {
                let target = stream.time_of(sequence) + TimeDelta::milliseconds(offset);
                let result = locator.locate(&stream, target, None).await.unwrap();
                assert_eq!(result.sequence, sequence, "target {target}");
                assert!(!result.falls_in_gap);
                assert!((result.time_difference - offset as f64 / 1_000.0).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn target_inside_gap_returns_segment_before_it() {
        let stream = SyntheticStream::builder("140")
            .segments(10_000)
            .gap_after(4_321, Duration::from_secs(60))
            .build();
        // The gap opens when segment 4321 ends.
        let gap_start = stream.time_of(4_321) + TimeDelta::seconds(5);
        let result = SegmentLocator::default()
            .locate(&stream, gap_start + TimeDelta::seconds(30), None)
            .await
            .unwrap();
        assert_eq!(result.sequence, 4_321);
        assert!(result.falls_in_gap);
        assert_eq!(result.following.map(|a| a.sequence), Some(4_322));
    }
}

mod resolve {
    use super::*;

    #[tokio::test]
    async fn earliest_plus_thirty_seconds_spans_six_segments() {
        let stream = SyntheticStream::builder("140")
            .segments(100_000)
            .earliest(60_000)
            .build();
        let resolved = resolver()
            .resolve(
                &stream,
                PointSpec::Earliest,
                PointSpec::Duration(Duration::from_secs(30)),
                ResolveOptions::default(),
            )
            .await
            .unwrap();
        let interval = resolved.interval;
        assert_eq!(interval.start.sequence, 60_000);
        assert_eq!(interval.end.sequence - interval.start.sequence, 5);
    }

    #[tokio::test]
    async fn explicit_sequences_are_kept_exactly() {
        let stream = SyntheticStream::builder("140").segments(1_000).build();
        let resolved = resolver()
            .resolve(
                &stream,
                PointSpec::Sequence(0),
                PointSpec::Sequence(100),
                ResolveOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(resolved.interval.sequences(), 0..=100);
        assert!(resolved.notices.is_empty());
    }

    #[tokio::test]
    async fn parsed_interval_resolves() {
        let stream = SyntheticStream::builder("140").segments(1_000).build();
        let (start, end) = rewind_engine::parse_interval("200/PT1M").unwrap();
        let resolved = resolver()
            .resolve(&stream, start, end, ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.interval.sequences(), 200..=211);
    }
}

mod fetch {
    use super::*;

    #[tokio::test]
    async fn rerun_with_retained_state_issues_no_requests() {
        let dir = TempDir::new().unwrap();
        let synthetic = Arc::new(SyntheticStream::builder("140").segments(100).build());
        let mut config = fetch_config();
        config.retain_state = true;
        let plan = FetchPlan {
            streams: vec![synthetic.clone() as Arc<dyn SegmentStream>],
            sequences: 20..=39,
            destination: dir.path().to_path_buf(),
        };

        let first = FetchPipeline::new(config.clone(), CancellationToken::new())
            .run(&plan)
            .await
            .unwrap();
        assert_eq!(first.fetched, 20);

        synthetic.reset_counters();
        let second = FetchPipeline::new(config, CancellationToken::new())
            .run(&plan)
            .await
            .unwrap();
        assert_eq!(synthetic.fetch_count(), 0);
        assert_eq!(second.fetched, 0);
        assert_eq!(second.skipped, 20);
        assert_eq!(second.paths, first.paths);
    }

    #[tokio::test]
    async fn interrupted_run_resumes_with_remainder_only() {
        let dir = TempDir::new().unwrap();
        let synthetic = Arc::new(SyntheticStream::builder("140").segments(100).build());
        let mut config = fetch_config();
        config.max_concurrent_fetches = 1;
        let plan = FetchPlan {
            streams: vec![synthetic.clone() as Arc<dyn SegmentStream>],
            sequences: 0..=9,
            destination: dir.path().to_path_buf(),
        };

        let token = CancellationToken::new();
        synthetic.cancel_after_fetches(5, token.clone());
        let err = FetchPipeline::new(config.clone(), token)
            .run(&plan)
            .await
            .unwrap_err();
        assert!(matches!(err, RewindError::Cancelled));

        let state = inspect_state(dir.path(), &plan.fingerprint().unwrap()).await;
        assert_eq!(state.completed("140"), 5);
        let parts = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .count();
        assert_eq!(parts, 0);

        synthetic.reset_counters();
        let report = FetchPipeline::new(config, CancellationToken::new())
            .run(&plan)
            .await
            .unwrap();
        assert_eq!(synthetic.fetch_count(), 5);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.skipped, 5);
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let audio: Arc<dyn SegmentStream> = Arc::new(SyntheticStream::builder("140").segments(200).build());
        let video: Arc<dyn SegmentStream> = Arc::new(
            SyntheticStream::builder("248")
                .kind(rewind_engine::StreamKind::Video)
                .segments(200)
                .build(),
        );
        let plan = FetchPlan {
            streams: vec![audio, video],
            sequences: 100..=129,
            destination: dir.path().to_path_buf(),
        };

        let report = FetchPipeline::new(fetch_config(), CancellationToken::new())
            .run(&plan)
            .await
            .unwrap();

        for id in ["140", "248"] {
            assert_eq!(report.paths[id].len(), 30);
        }
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 60);
        assert!(dir.path().join("100.140.m4a").exists());
        assert!(dir.path().join("100.248.webm").exists());
    }
}
