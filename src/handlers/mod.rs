pub mod batch;
pub mod clean;
pub mod config;
pub mod download;

use crate::cli::Commands;

pub use batch::handle_batch;
pub use clean::handle_clean;
pub use config::handle_config;
pub use download::handle_get;

/// `config` must stay usable while the config file is invalid.
pub fn should_skip_config_validation(command: &Commands) -> bool {
    matches!(command, Commands::Config { .. })
}
