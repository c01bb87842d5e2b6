use futures::StreamExt;
use hoard_engine::{DownloadHandle, DownloadProgress, Phase};
use indicatif::ProgressStyle;
use tracing::{Instrument, Span, debug, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{AppError, Result};

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Discovering => "discovering",
        Phase::Downloading => "downloading",
        Phase::Stalled => "stalled",
        Phase::Finished => "finished",
        Phase::Cancelled => "cancelled",
        Phase::Aborted => "aborted",
    }
}

/// Nothing more will happen without outside action.
fn is_at_rest(progress: &DownloadProgress) -> bool {
    progress.phase.is_terminal()
        || (progress.phase == Phase::Stalled && progress.completed == progress.total)
}

/// Render a progress bar for `handle` until the download comes to rest.
///
/// Ctrl-C stops following; the download stays resumable.
pub async fn follow(handle: &DownloadHandle) -> Result<DownloadProgress> {
    let span = info_span!("download", url = %handle.url());
    span.pb_set_style(&bar_style());
    watch(handle).instrument(span).await
}

async fn watch(handle: &DownloadHandle) -> Result<DownloadProgress> {
    let span = Span::current();
    let mut updates = handle.progress_stream();
    let mut last = handle.progress();

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(progress) = update else {
                    return Ok(last);
                };
                span.pb_set_length(progress.total);
                span.pb_set_position(progress.completed);
                span.pb_set_message(phase_label(progress.phase));
                last = progress;
                if is_at_rest(&progress) {
                    debug!(phase = ?progress.phase, "Download at rest");
                    return Ok(progress);
                }
            }
            _ = tokio::signal::ctrl_c() => return Err(AppError::Interrupted),
        }
    }
}
