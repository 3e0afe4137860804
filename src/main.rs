//! Engine Bridge - demo CLI against the simulated engine

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine_bridge::{
    BridgeConfig, GenerationEvent, Input, ModelKind, ModelRef, Runtime, SimulatedEngine, metrics,
};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "engine-bridge")]
#[command(about = "Drive the engine bridge from the command line", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API key used for activation (overrides config)
    #[arg(long)]
    api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Print a Prometheus metrics snapshot before exiting
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalogued models and their download state
    Models {
        /// Refresh the registry first
        #[arg(long)]
        sync: bool,
    },
    /// Activate the license and print the resulting status
    Activate,
    /// Download a model, drawing a progress bar
    Download { identifier: String },
    /// Stream a reply from a model
    Chat { identifier: String, prompt: String },
    /// Activate, sync, download the default model and chat with it
    RunAll {
        #[arg(default_value = "Say hello in one sentence.")]
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for command output
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    // Load configuration
    let mut config = BridgeConfig::load(cli.config)?;

    // CLI overrides
    if let Some(api_key) = cli.api_key {
        config.api_key = Some(api_key);
    }

    config.validate()?;

    tracing::info!(
        default_model = ?config.default_model,
        auto_downloads = config.simulation.auto_downloads,
        "Configuration loaded"
    );

    let prometheus_handle = if cli.print_metrics {
        Some(metrics::setup_metrics()?)
    } else {
        None
    };

    let engine = Arc::new(SimulatedEngine::from_config(&config.simulation));
    let runtime = Runtime::start(engine);

    let result = match cli.command {
        Command::Models { sync } => list_models(&runtime, sync).await,
        Command::Activate => activate(&runtime, &config).await,
        Command::Download { identifier } => {
            activate(&runtime, &config).await?;
            download(&runtime, &identifier).await
        }
        Command::Chat { identifier, prompt } => {
            activate(&runtime, &config).await?;
            chat(&runtime, &config, &identifier, &prompt).await
        }
        Command::RunAll { prompt } => run_all(&runtime, &config, &prompt).await,
    };

    runtime.shutdown();

    if let Some(handle) = prometheus_handle {
        println!("\n{}", handle.render());
    }

    result
}

async fn activate(runtime: &Runtime, config: &BridgeConfig) -> Result<()> {
    let api_key = config
        .api_key
        .as_deref()
        .context("No API key configured (use --api-key or ENGINE_BRIDGE_API_KEY)")?;

    let status = runtime.activate(api_key).await?;
    println!("License: {}", status);

    if !status.is_usable() {
        anyhow::bail!("License is not usable ({})", status);
    }
    Ok(())
}

async fn list_models(runtime: &Runtime, sync: bool) -> Result<()> {
    if sync {
        let diff = runtime.sync().await.context("Registry refresh failed")?;
        println!(
            "Synced: {} added, {} removed, {} unchanged",
            diff.added.len(),
            diff.removed.len(),
            diff.retained.len()
        );
    }

    for model in runtime.models() {
        println!(
            "{:<32} {:<6} {:<12} {:<24} {}",
            model.identifier,
            model.info.kind,
            model.info.vendor,
            model.info.name,
            model.state.phase()
        );
    }
    Ok(())
}

async fn download(runtime: &Runtime, identifier: &str) -> Result<()> {
    if runtime.info(identifier).is_none() {
        anyhow::bail!("Unknown model: {}", identifier);
    }

    let handle = runtime.download_handle(identifier);
    let mut progress = handle.progress();
    handle.start()?;

    loop {
        tokio::select! {
            update = progress.next() => {
                let Some(update) = update else { break };
                let update = update?;
                draw_progress(update.progress, update.completed_bytes, update.total_bytes);
            }
            _ = shutdown_signal() => {
                handle.pause();
                println!("\nPaused {}", identifier);
                return Ok(());
            }
        }
    }

    println!("\nDownloaded {}", identifier);
    Ok(())
}

fn draw_progress(fraction: f64, completed: u64, total: Option<u64>) {
    const WIDTH: usize = 30;
    let filled = (fraction * WIDTH as f64).round() as usize;
    let total = total.map_or_else(|| "?".to_string(), |t| t.to_string());
    print!(
        "\r[{}{}] {:>5.1}% ({}/{} bytes)",
        "#".repeat(filled),
        " ".repeat(WIDTH - filled.min(WIDTH)),
        fraction * 100.0,
        completed,
        total
    );
    let _ = std::io::stdout().flush();
}

async fn chat(runtime: &Runtime, config: &BridgeConfig, identifier: &str, prompt: &str) -> Result<()> {
    let info = runtime
        .info(identifier)
        .with_context(|| format!("Unknown model: {}", identifier))?;

    let model = match info.kind {
        ModelKind::Local => {
            if !runtime.state(identifier).is_downloaded() {
                download(runtime, identifier).await?;
            }
            ModelRef::Local(identifier.to_string())
        }
        ModelKind::Cloud => ModelRef::Cloud(identifier.to_string()),
    };

    let session = runtime.create_session(&model, Some(config.session.to_session_config()))?;
    let mut stream = session.stream(Input::from(prompt), config.run.to_run_config())?;

    let mut printed = 0;
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = shutdown_signal(), if !interrupted => {
                interrupted = true;
                stream.cancel();
                continue;
            }
        };

        match event {
            Some(GenerationEvent::Partial(output)) => {
                // Partials are cumulative; print only what is new
                if let Some(suffix) = output.text.get(printed..) {
                    print!("{}", suffix);
                    let _ = std::io::stdout().flush();
                }
                printed = output.text.len();
            }
            Some(GenerationEvent::Finished(result)) => {
                let output = result?;
                println!();
                println!(
                    "[{:?}, {} tokens, {:.1} tok/s]",
                    output.finish_reason,
                    output.stats.tokens_count_output,
                    output.stats.tokens_per_second()
                );
                break;
            }
            None => break,
        }
    }

    let stats = session.stats();
    tracing::info!(runs = stats.runs, cancelled = stats.cancelled_runs, "Chat finished");
    Ok(())
}

async fn run_all(runtime: &Runtime, config: &BridgeConfig, prompt: &str) -> Result<()> {
    activate(runtime, config).await?;
    list_models(runtime, true).await?;

    let identifier = match &config.default_model {
        Some(identifier) => identifier.clone(),
        None => runtime
            .models()
            .into_iter()
            .find(|m| m.info.kind == ModelKind::Local)
            .map(|m| m.identifier)
            .context("No local model in the catalog")?,
    };

    println!("\nUsing {}", identifier);
    chat(runtime, config, &identifier, prompt).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
}
