//! Terminal progress reporting. Not part of the pipeline's control flow; the collector (C6) and
//! coordinator (C7) call into this as a side effect when the `Reporter` is a terminal sink.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use once_cell::sync::Lazy;

const TEMPLATE: &str = if cfg!(target_os = "windows") {
    // No spinner glyph on Windows consoles.
    "[{elapsed_precise}] [{wide_bar}] {percent:>3}% {pos}/{len} chunks (eta {eta})"
} else {
    "{spinner} [{elapsed_precise}] [{wide_bar}] {percent:>3}% {pos}/{len} chunks (eta {eta})"
};

static BAR: Lazy<ProgressBar> = Lazy::new(|| {
    let pb = ProgressBar::hidden();
    pb.set_style(
        ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
});

pub fn init(total_chunks: u64, already_done: u64) {
    BAR.enable_steady_tick(std::time::Duration::from_millis(100));
    BAR.reset_elapsed();
    BAR.reset_eta();
    BAR.set_length(total_chunks);
    BAR.set_position(already_done);
}

pub fn inc(by: u64) {
    BAR.inc(by);
}

pub fn finish() {
    BAR.finish();
}

pub fn suspend<F: FnOnce() -> R, R>(f: F) -> R {
    BAR.suspend(f)
}
