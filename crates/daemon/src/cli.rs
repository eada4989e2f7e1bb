//! Command-line interface for the daemon binary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use hearth_domain::config::Config;

#[derive(Parser)]
#[command(name = "hearthd", about = "Home-automation adapter substrate daemon")]
pub struct Cli {
    /// Path to the TOML config file. A missing file yields defaults.
    #[arg(long, global = true, default_value = "hearth.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (the default).
    Serve,
    /// Inspect or validate the configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Check the config file for problems.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(data) => {
            toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.supervisor.ping_interval_secs, 30);
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.toml");
        std::fs::write(&path, "supervisor = 12").unwrap();
        assert!(load_config(&path).is_err());
    }
}
