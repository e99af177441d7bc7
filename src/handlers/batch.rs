use anyhow::{Context, Result, anyhow, bail};
use console::{Term, style};
use fetchcache::{CallbackContext, DownloadError, DownloadRequest, Downloader};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cli::parse_batch;

pub async fn handle_batch(
    downloader: &Downloader,
    context: Arc<dyn CallbackContext>,
    file: PathBuf,
) -> Result<()> {
    let term = Term::stdout();
    let content = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read batch file: {:?}", file))?;
    let pairs = parse_batch(&content).map_err(|e| anyhow!("{}: {}", file.display(), e))?;

    if pairs.is_empty() {
        term.write_line(&format!("{} Nothing to download", style("ℹ").blue()))?;
        return Ok(());
    }

    term.write_line(&format!(
        "{} {} files, up to {} transfers at once",
        style("📋").cyan(),
        pairs.len(),
        downloader.max_concurrent()
    ))?;

    let pb = ProgressBar::new(pairs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut expected = 0;
    for (url, dest) in pairs {
        let done_tx = done_tx.clone();
        let label = url.clone();
        // Rejected requests still report through the completion callback.
        downloader.download(
            DownloadRequest::new(url, dest),
            Arc::clone(&context),
            None,
            Some(Box::new(move |result: Result<(), DownloadError>| {
                let _ = done_tx.send((label, result));
            })),
        );
        expected += 1;
    }
    drop(done_tx);

    let mut failures = Vec::new();
    while expected > 0 {
        let Some((url, result)) = done_rx.recv().await else {
            break;
        };
        expected -= 1;
        pb.inc(1);
        match result {
            Ok(()) => pb.set_message(format!("done {}", url)),
            Err(e) => {
                pb.set_message(format!("failed {}", url));
                failures.push(e);
            }
        }
    }
    pb.finish_and_clear();

    if failures.is_empty() {
        term.write_line(&format!("{} All downloads complete", style("✅").green()))?;
        return Ok(());
    }

    for e in &failures {
        term.write_line(&format!("{} {}", style("❌").red(), e))?;
    }
    bail!("{} download(s) failed", failures.len());
}
