pub mod config;
pub mod download;

// Re-export commonly used types for easier access in tests
pub use config::ConfigManager;
pub use download::{
    CallbackContext, DispatchQueue, DownloadError, DownloadRequest, Downloader, DownloaderOptions,
    InlineContext, Progress, Receipt,
};
