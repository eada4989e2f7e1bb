use clap::Parser;
use tracing_subscriber::EnvFilter;

use hearth_daemon::bootstrap;
use hearth_daemon::cli::{Cli, Command, ConfigCommand};
use hearth_domain::config::ConfigSeverity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = hearth_daemon::cli::load_config(&cli.config)?;

            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                    ConfigSeverity::Error => tracing::error!("config: {issue}"),
                }
            }
            let errors = issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count();
            if errors > 0 {
                anyhow::bail!("config validation failed with {errors} error(s)");
            }

            bootstrap::run(config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = hearth_daemon::cli::load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                println!("{tag}: {issue}");
            }
            if issues
                .iter()
                .any(|i| i.severity == ConfigSeverity::Error)
            {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = hearth_daemon::cli::load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("hearthd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hearth_daemon=debug")),
        )
        .json()
        .init();
}
