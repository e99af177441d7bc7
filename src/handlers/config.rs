use crate::cli::ConfigAction;
use anyhow::Result;
use console::{Term, style};
use fetchcache::ConfigManager;

pub async fn handle_config(config_manager: &ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show => {
            term.write_line(&format!("{} Current configuration:", style("⚙️").cyan()))?;
            term.write_line("")?;
            term.write_line(&config_manager.to_toml()?)?;

            if let Err(e) = config_manager.validate() {
                term.write_line(&format!("{} {}", style("⚠️").yellow(), e))?;
            }
        }
        ConfigAction::Path => {
            term.write_line(&config_manager.config_file().display().to_string())?;
        }
    }

    Ok(())
}
