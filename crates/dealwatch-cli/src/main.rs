use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealwatch_scrape::SelectorConfig;
use dealwatch_sync::{run_cycle_once_from_env, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealwatch")]
#[command(about = "Forum deal watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle and print its report.
    Sync,
    /// Serve the HTTP trigger endpoint.
    Serve {
        /// Overrides DEALWATCH_BIND.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Load and compile a selector file, reporting the first problem found.
    CheckSelectors {
        /// Defaults to DEALWATCH_SELECTORS, then the built-in selectors.
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dealwatch=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = run_cycle_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            dealwatch_web::serve(&config).await?;
        }
        Commands::CheckSelectors { path } => {
            let path = path.or(config.selectors_path);
            SelectorConfig::load(path.as_deref())
                .with_context(|| match &path {
                    Some(p) => format!("selector file {} is invalid", p.display()),
                    None => "built-in selectors are invalid".to_string(),
                })?;
            match path {
                Some(p) => println!("selectors ok: {}", p.display()),
                None => println!("selectors ok: built-in defaults"),
            }
        }
    }

    Ok(())
}
