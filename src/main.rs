//! Trapline command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use trapline::scripter::{ScripterRegistry, ScripterSettings};
use trapline::{AbTester, App, Config};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "trapline")]
#[command(version = VERSION)]
#[command(about = "Honeypot with scripted responders and A/B response variants")]
struct Cli {
    /// Configuration file (default: <config dir>/trapline/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the listener, script reload task and management endpoint
    Serve,
    /// Append A/B variants from a `{group: {key: [values]}}` JSON file
    AbImport {
        /// Path to the JSON file
        file: PathBuf,
        /// Append even if this exact file was imported before
        #[arg(long)]
        force: bool,
    },
    /// Load the scripts of a service and list them
    Scripts {
        /// Service name (directory under the scripter folder)
        service: String,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to this path
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn init_logging() -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("TRAPLINE_LOG_FILE") {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config)?,
        Commands::AbImport { file, force } => {
            let storage = config.open_storage()?;
            let abtester = AbTester::namespace(storage.as_ref(), &config.abtester.namespace)?;
            let added = if force {
                Some(abtester.load_from_file(&file)?)
            } else {
                abtester.load_from_file_once(&file)?
            };
            match added {
                Some(added) => println!("Imported {} variant(s) into abtester_{}", added, config.abtester.namespace),
                None => println!("{} was already imported; use --force to append again", file.display()),
            }
            if config.storage.in_memory {
                log::warn!("Storage is in-memory; imported variants are not persisted");
            }
        }
        Commands::Scripts { service } => {
            let scripter = ScripterRegistry::with_defaults().build(
                &config.scripter.kind,
                ScripterSettings {
                    name: config.scripter.name.clone(),
                    folder: config.scripter.folder.clone(),
                    abtester: None,
                    events: None,
                    idle_timeout: None,
                },
            )?;
            scripter.init(&service)?;
            for (name, path) in scripter.scripts().remove(&service).unwrap_or_default() {
                println!("{:<24} {}", name, path.display());
            }
        }
        Commands::Config { write } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if let Some(path) = write {
                config.save(&path)?;
                log::info!("Wrote configuration to {}", path.display());
            }
        }
    }

    Ok(())
}

fn serve(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        let app = App::from_config(config)?;
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            log::info!("Interrupted, shutting down");
            signal.cancel();
        });

        app.run(shutdown).await
    })
}
