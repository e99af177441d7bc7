use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fetchcache")]
#[command(about = "Download files once, resume them when interrupted, reuse them afterwards")]
#[command(long_about = "
fetchcache downloads files over HTTP(S) into a destination path. A file already
present at the destination counts as downloaded and is never fetched again.
Identical requests share one transfer, at most a fixed number of transfers run
at once, and cancelled transfers resume where they stopped.

Examples:
  fetchcache get https://example.com/f.bin /tmp/f.bin
  fetchcache get https://example.com/f.bin /tmp/f.bin -H 'Authorization: Bearer t'
  fetchcache batch downloads.txt          # one 'URL DEST' pair per line
  fetchcache clean                        # wipe the whole cache root
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a single file
    #[command(visible_alias = "g")]
    Get {
        /// File URL
        url: String,

        /// Absolute destination path
        dest: PathBuf,

        /// Extra request header, as 'Name: value'
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,

        /// Bypass cached responses (ignored when resuming)
        #[arg(long)]
        no_cache: bool,
    },

    /// Download every 'URL DEST' pair listed in a file
    Batch {
        /// File with one 'URL DEST' pair per line; '#' starts a comment
        file: PathBuf,

        /// Override the concurrent transfer limit
        #[arg(short = 'j', long, value_name = "N")]
        max_concurrent: Option<usize>,
    },

    /// Remove every file under the configured cache root
    Clean,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
}

/// Split a 'Name: value' header argument.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("Header '{}' must look like 'Name: value'", raw))?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(format!("Header '{}' has an invalid name", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse a batch file into (url, dest) pairs.
pub fn parse_batch(content: &str) -> Result<Vec<(String, PathBuf)>, String> {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(url), Some(dest), None) => Ok((url.to_string(), PathBuf::from(dest))),
                _ => Err(format!("line {}: expected 'URL DEST'", number)),
            }
        })
        .collect()
}

impl Cli {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Commands::Get {
                url, dest, headers, ..
            } => {
                if url.trim().is_empty() {
                    return Err("URL cannot be empty".to_string());
                }
                if !dest.is_absolute() {
                    return Err("Destination must be an absolute path".to_string());
                }
                for header in headers {
                    parse_header(header)?;
                }
            }
            Commands::Batch { max_concurrent, .. } => {
                if let Some(n) = max_concurrent {
                    if *n == 0 || *n > 64 {
                        return Err("Max concurrent downloads must be between 1 and 64".to_string());
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Check if the command needs a downloader instance
    pub fn needs_downloader(&self) -> bool {
        matches!(
            self.command,
            Commands::Get { .. } | Commands::Batch { .. } | Commands::Clean
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_get_parsing() {
        let cli = Cli::try_parse_from([
            "fetchcache",
            "get",
            "https://example.com/f.bin",
            "/tmp/f.bin",
            "-H",
            "Accept: application/octet-stream",
            "--no-cache",
        ])
        .unwrap();

        if let Commands::Get {
            url,
            dest,
            headers,
            no_cache,
        } = &cli.command
        {
            assert_eq!(url, "https://example.com/f.bin");
            assert_eq!(dest, &PathBuf::from("/tmp/f.bin"));
            assert_eq!(headers.len(), 1);
            assert!(no_cache);
        } else {
            panic!("Expected Get command");
        }
        assert!(cli.validate().is_ok());
        assert!(cli.needs_downloader());
    }

    #[test]
    fn test_validation() {
        let cli =
            Cli::try_parse_from(["fetchcache", "get", "https://example.com/f", "relative/f"])
                .unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["fetchcache", "batch", "list.txt", "-j", "0"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["fetchcache", "config", "show"]).unwrap();
        assert!(cli.validate().is_ok());
        assert!(!cli.needs_downloader());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Authorization: Bearer abc").unwrap(),
            ("Authorization".to_string(), "Bearer abc".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
        assert!(parse_header("Bad Name: value").is_err());
    }

    #[test]
    fn test_parse_batch() {
        let pairs = parse_batch(
            "# comment\nhttps://a/x /tmp/x\n\n  https://b/y   /tmp/y  \n",
        )
        .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].0, "https://b/y");
        assert_eq!(pairs[1].1, PathBuf::from("/tmp/y"));

        let err = parse_batch("https://a/x\n").unwrap_err();
        assert!(err.contains("line 1"));
    }
}
