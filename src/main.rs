mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use fetchcache::{CallbackContext, ConfigManager, DispatchQueue, Downloader};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let config_manager = match &args.config {
        Some(path) => ConfigManager::from_file(path)?,
        None => ConfigManager::new()?,
    };

    if !handlers::should_skip_config_validation(&args.command) {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!(
                "Fix the file at {:?} or run 'fetchcache config show'",
                config_manager.config_file()
            );
            process::exit(1);
        }
    }

    if !args.needs_downloader() {
        if let Commands::Config { action } = args.command {
            handlers::handle_config(&config_manager, action).await?;
        }
        return Ok(());
    }

    let config = config_manager.config();
    let mut options = config.downloader_options();
    if let Commands::Batch {
        max_concurrent: Some(n),
        ..
    } = &args.command
    {
        options.max_concurrent = *n;
    }
    let downloader = Downloader::with_http(options, config.transport_options())?;
    let context: Arc<dyn CallbackContext> = Arc::new(DispatchQueue::new("fetchcache-callbacks")?);

    match args.command {
        Commands::Get {
            url,
            dest,
            headers,
            no_cache,
        } => {
            handlers::handle_get(&downloader, context, url, dest, headers, no_cache).await?;
        }
        Commands::Batch { file, .. } => {
            handlers::handle_batch(&downloader, context, file).await?;
        }
        Commands::Clean => {
            handlers::handle_clean(&downloader).await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&config_manager, action).await?;
        }
    }

    Ok(())
}
