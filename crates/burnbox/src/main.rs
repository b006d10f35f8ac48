use std::path::PathBuf;

use anyhow::{Context, Result};
use burnbox_server::Config;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnbox", about = "Burnbox: burn-after-reading secret sharing", version)]
struct Cli {
    /// Config file (default: ./burnbox.toml if present, or $BURNBOX_CONFIG)
    #[arg(long, global = true, env = "BURNBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Host to bind (overrides config and $BURNBOX_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config and $BURNBOX_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Delete expired secrets once and exit
    Sweep,
    /// Validate the effective configuration and print it with credentials masked
    CheckConfig,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.as_deref())?;
    let env_warnings = cfg.apply_env()?;
    init_tracing(&cfg);
    for warning in &env_warnings {
        tracing::warn!("{warning}");
    }

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            let validated = cfg.validate().context("invalid configuration")?;
            tracing::debug!(config = ?validated, "effective configuration");
            burnbox_server::run(validated).await
        }

        Commands::Sweep => {
            let validated = cfg.validate().context("invalid configuration")?;
            let stats = burnbox_server::sweep_once(&validated)?;
            println!(
                "swept {}: {} deleted, {} errors",
                validated.storage_path.display(),
                stats.deleted,
                stats.errors
            );
            Ok(())
        }

        Commands::CheckConfig => {
            let shown = toml::to_string_pretty(&cfg.redacted()).context("render config")?;
            cfg.validate().context("invalid configuration")?;
            print!("{shown}");
            println!("# configuration OK");
            Ok(())
        }
    }
}

fn init_tracing(cfg: &Config) {
    let filter = EnvFilter::try_from_env("BURNBOX_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new(&cfg.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from(["burnbox", "serve", "--port", "9090", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(
            cli.command,
            Commands::Serve { port: Some(9090), host: None }
        ));
    }

    #[test]
    fn check_config_subcommand() {
        let cli = Cli::try_parse_from(["burnbox", "check-config"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
    }
}
