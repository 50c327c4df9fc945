use std::collections::HashMap;

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use rewind_engine::ProgressReporter;

struct StreamBar {
    bar: ProgressBar,
    bytes: u64,
    resumed: u64,
}

/// One progress bar per stream.
pub struct BarProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, StreamBar>>,
    style: ProgressStyle,
}

impl BarProgress {
    pub fn new(hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        let style = ProgressStyle::with_template(
            "{prefix:>6} [{bar:30.cyan/white}] {pos}/{len} segments {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            style,
        }
    }
}

impl ProgressReporter for BarProgress {
    fn stream_started(&self, stream: &str, total: u64) {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(self.style.clone());
        bar.set_prefix(stream.to_owned());
        self.bars.lock().insert(
            stream.to_owned(),
            StreamBar {
                bar,
                bytes: 0,
                resumed: 0,
            },
        );
    }

    fn segment_done(&self, stream: &str, _sequence: u64, bytes: u64, skipped: bool) {
        let mut bars = self.bars.lock();
        let Some(entry) = bars.get_mut(stream) else {
            return;
        };
        entry.bytes += bytes;
        if skipped {
            entry.resumed += 1;
        }
        entry.bar.inc(1);
        if entry.resumed > 0 {
            entry.bar.set_message(format!(
                "{} ({} resumed)",
                HumanBytes(entry.bytes),
                entry.resumed
            ));
        } else {
            entry.bar.set_message(HumanBytes(entry.bytes).to_string());
        }
    }

    fn stream_finished(&self, stream: &str) {
        if let Some(entry) = self.bars.lock().get(stream) {
            entry.bar.finish();
        }
    }
}
