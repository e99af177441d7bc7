use anyhow::Result;
use console::{Term, style};
use fetchcache::Downloader;

pub async fn handle_clean(downloader: &Downloader) -> Result<()> {
    let term = Term::stdout();
    let cache_root = downloader.options().cache_root.clone();

    term.write_line(&format!(
        "{} Clearing cache at {}",
        style("🧹").cyan(),
        style(cache_root.display()).cyan()
    ))?;

    downloader.clear_cache(None).await?;

    term.write_line(&format!(
        "{} Cache cleared, resume data discarded",
        style("✅").green()
    ))?;
    Ok(())
}
