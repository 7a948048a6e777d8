use std::sync::Arc;
use std::time::Duration;

use ferry_engine::{Progress, ProgressSink};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

fn download_style() -> Option<ProgressStyle> {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .ok()
        .map(|style| style.progress_chars("=> "))
}

/// One progress bar per artifact, drawn together.
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            disabled: true,
        }
    }

    /// Add a bar for `url` and return it with a sink that drives it.
    pub fn track(&self, url: &str) -> Option<(ProgressBar, ProgressSink)> {
        if self.disabled {
            return None;
        }

        let bar = self.multi.add(ProgressBar::new(0));
        if let Some(style) = download_style() {
            bar.set_style(style);
        }
        bar.set_message(url.to_string());
        bar.enable_steady_tick(Duration::from_millis(500));

        let sink_bar = bar.clone();
        let sink: ProgressSink = Arc::new(move |progress: Progress| {
            sink_bar.set_length(progress.total);
            sink_bar.set_position(progress.loaded);
        });
        Some((bar, sink))
    }
}
