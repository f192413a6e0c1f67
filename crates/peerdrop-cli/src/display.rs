//! Terminal presentation helpers.

use indicatif::{ProgressBar, ProgressStyle};

use peerdrop_core::ChunkReport;

/// Progress bar for an outgoing transfer.
pub fn transfer_bar(total_bytes: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_bytes);
    let style =
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

/// Print one chunk's encryption record as JSON without clobbering the bar.
pub fn print_report(bar: &ProgressBar, report: &ChunkReport) {
    if let Ok(json) = serde_json::to_string(report) {
        bar.println(json);
    }
}
