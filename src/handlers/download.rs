use anyhow::{Result, anyhow};
use console::{Term, style};
use fetchcache::download::progress::{format_bytes, format_duration, format_speed};
use fetchcache::{CallbackContext, DownloadError, DownloadRequest, Downloader, Progress};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cli::parse_header;

pub async fn handle_get(
    downloader: &Downloader,
    context: Arc<dyn CallbackContext>,
    url: String,
    dest: PathBuf,
    headers: Vec<String>,
    no_cache: bool,
) -> Result<()> {
    let term = Term::stdout();
    term.write_line(&format!(
        "{} Fetching {}",
        style("⬇️").cyan(),
        style(&url).cyan().bold()
    ))?;

    let mut request = DownloadRequest::new(url.clone(), dest.clone());
    for raw in &headers {
        let (name, value) = parse_header(raw).map_err(|e| anyhow!(e))?;
        request = request.with_header(name, value);
    }
    if no_cache {
        request = request.remove_cached_response();
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let on_progress = Arc::new(move |progress: Progress| {
        if let Some(total) = progress.bytes_expected {
            bar.set_length(total);
        }
        bar.set_position(progress.bytes_received);
    });

    let (done_tx, done_rx) = oneshot::channel();
    let started = Instant::now();
    let receipt = downloader.download(
        request,
        context,
        Some(on_progress),
        Some(Box::new(move |result: Result<(), DownloadError>| {
            let _ = done_tx.send(result);
        })),
    );

    let Some(receipt) = receipt else {
        pb.finish_and_clear();
        let error = done_rx.await.map_err(|_| anyhow!("Download was dropped"))?;
        return error.map_err(Into::into);
    };
    debug!(receipt = %receipt.id(), "download accepted");

    let mut done_rx = done_rx;
    let result = tokio::select! {
        result = &mut done_rx => result,
        _ = tokio::signal::ctrl_c() => {
            pb.suspend(|| {
                let _ = term.write_line(&format!("{} Interrupted, cancelling...", style("⏹").yellow()));
            });
            downloader.cancel(&receipt);
            done_rx.await
        }
    }
    .map_err(|_| anyhow!("Download was dropped"))?;

    match result {
        Ok(()) => {
            let elapsed = started.elapsed();
            let bytes = pb.position();
            pb.finish_and_clear();
            let speed = if elapsed.as_secs_f64() > 0.0 {
                (bytes as f64 / elapsed.as_secs_f64()) as u64
            } else {
                0
            };
            term.write_line(&format!(
                "{} Saved {} ({} in {}, {})",
                style("✅").green(),
                style(dest.display()).cyan(),
                format_bytes(bytes),
                format_duration(elapsed),
                format_speed(speed)
            ))?;
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            term.write_line(&format!("{} {}", style("❌").red(), e))?;
            Err(e.into())
        }
    }
}
