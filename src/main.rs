//! model-cache - CLI entry point

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use model_cache::{CacheConfig, CacheError, CacheResult, ModelService};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "model-cache")]
#[command(about = "Fetch, verify and cache model artifacts", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MODEL_CACHE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure a model is cached and print its path
    Download(ModelArgs),
    /// Check that every required model is cached and verified
    Health {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List cache entries
    List {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Reconcile the cache with the disk and purge abandoned downloads
    Gc,
    /// Re-hash a cached model
    Verify(ModelArgs),
    /// Protect a cached model from eviction
    Pin(ModelArgs),
    /// Release a pin
    Unpin(ModelArgs),
}

#[derive(clap::Args, Debug)]
struct ModelArgs {
    /// Model identifier, e.g. BAAI/bge-small-en-v1.5
    model_id: String,

    /// Variant (defaults to the only configured one, else "default")
    #[arg(long)]
    variant: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error[Config]: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let result = tokio::select! {
        result = run(cli.command, &config, &cancel) => result,
        _ = cancel.cancelled() => Err(CacheError::Aborted { model: "-".to_string() }),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error[{}]: {}", e.kind(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<CacheConfig> {
    let config = CacheConfig::load(path)?;
    config.validate()?;

    tracing::info!(
        cache_root = ?config.cache_root,
        budget_bytes = config.budget_bytes,
        models = config.models.len(),
        "Configuration loaded"
    );
    Ok(config)
}

async fn run(
    command: Command,
    config: &CacheConfig,
    cancel: &CancellationToken,
) -> CacheResult<ExitCode> {
    let service = ModelService::from_config(config).await?;

    match command {
        Command::Download(args) => {
            let path = service
                .ensure_with_cancel(&args.model_id, args.variant.as_deref(), cancel)
                .await?;
            println!("{}", path.display());
        }
        Command::Health { format } => {
            let report = service.health().await?;
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text if report.is_ok() => {
                    println!("ok: {} required models ready", report.checked);
                }
                OutputFormat::Text => {
                    for missing in report.missing() {
                        println!("degraded: {}", missing);
                    }
                }
            }
            if !report.is_ok() {
                return Ok(ExitCode::from(1));
            }
        }
        Command::List { format } => {
            let entries = service.cache().list().await?;
            match format {
                OutputFormat::Json => print_json(&entries)?,
                OutputFormat::Text => {
                    let used = service.cache().total_size().await?;
                    for entry in &entries {
                        println!(
                            "{}\t{} bytes\tpins={}\tverified={}\tlast_access={}\t{}",
                            entry.key,
                            entry.size_bytes,
                            entry.pin_count,
                            entry.verified,
                            entry.last_access.to_rfc3339(),
                            entry.path.display()
                        );
                    }
                    println!(
                        "{} entries, {} of {} bytes used",
                        entries.len(),
                        used,
                        service.cache().budget()
                    );
                }
            }
        }
        Command::Gc => {
            // Opening the service already ran one pass; report a fresh one
            let report = service.recover().await?;
            println!(
                "purged {} partial downloads, dropped {} broken entries, removed {} orphaned files",
                report.purged_temp_files,
                report.dropped_entries.len(),
                report.orphaned_files
            );
        }
        Command::Verify(args) => {
            let key = service.key_for(&args.model_id, args.variant.as_deref());
            let entry = service.cache().reverify(&key).await?;
            if !entry.verified {
                return Err(CacheError::ChecksumMismatch {
                    model: key.to_string(),
                    expected: entry.checksum.to_string(),
                    actual: "different bytes on disk".to_string(),
                });
            }
            println!("{}: ok", key);
        }
        Command::Pin(args) => {
            let key = service.key_for(&args.model_id, args.variant.as_deref());
            let entry = service.cache().pin(&key).await?;
            println!("{}: pins={}", key, entry.pin_count);
        }
        Command::Unpin(args) => {
            let key = service.key_for(&args.model_id, args.variant.as_deref());
            let entry = service.cache().unpin(&key).await?;
            println!("{}: pins={}", key, entry.pin_count);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_json<T: serde::Serialize>(value: &T) -> CacheResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CacheError::Io(format!("cannot serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
    cancel.cancel();
}
