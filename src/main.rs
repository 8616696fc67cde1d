//! memproxy - long-term conversation memory in front of an LLM endpoint

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memproxy::{
    api::build_app,
    config::{resolve_api_key, ProxyConfig, StorageBackend},
    gateway::GatewayBuilder,
    memory::{EntryStore, JsonFilePersistence, JsonlRevisionLog, RevisionLog},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memproxy")]
#[command(version)]
#[command(about = "Per-conversation memory proxy for OpenAI-compatible LLM APIs")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MEMPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Print stored entries and the revision chain of a conversation
    Inspect {
        /// Conversation id
        conversation: String,
    },

    /// Run diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memproxy={},tower_http=debug", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config_path = cli.config.clone().or_else(|| {
        default_config_path().filter(|p| p.exists())
    });
    let config = match &config_path {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    match cli.command {
        Commands::Serve { host, port } => {
            run_serve(config, host, port).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Inspect { conversation } => {
            inspect(&config, &conversation).await?;
        }
        Commands::Doctor => {
            run_doctor(&config, config_path.as_deref()).await?;
        }
    }

    Ok(())
}

async fn run_serve(config: ProxyConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut builder = GatewayBuilder::new().config(config);
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(port) = port {
        builder = builder.port(port);
    }
    let gateway = Arc::new(builder.build().await?);
    gateway.start().await?;

    let gateway_config = &gateway.config().gateway;
    let addr = format!("{}:{}", gateway_config.host, gateway_config.port);
    let app = build_app(gateway.clone(), &gateway_config.cors_origins);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("memproxy is listening on http://{}. Press Ctrl+C to stop.", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
}

fn show_config(config: Option<&ProxyConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

async fn inspect(config: &ProxyConfig, conversation: &str) -> Result<()> {
    if config.storage.backend != StorageBackend::File {
        anyhow::bail!("inspect needs the file storage backend");
    }
    let base = &config.storage.base_dir;
    let persistence = Arc::new(JsonFilePersistence::new(base).await?);
    let store = EntryStore::open(config.embedding.dimension, persistence).await?;
    let revisions = JsonlRevisionLog::new(base).await?;

    let Some(info) = store.conversation(conversation).await else {
        println!("Conversation '{}' has no stored memories", conversation);
        return Ok(());
    };

    println!("Conversation: {}", info.id);
    println!("  entries:  {}", info.entry_count);
    if let Some(summary) = &info.summary {
        println!("  summary:  {}", summary);
    }
    if let Some(head) = info.head_revision {
        println!("  head:     {}", head);
    }

    println!();
    println!("Entries:");
    for entry in store.list(conversation).await {
        println!(
            "  {} [{} | accessed {}x] {}",
            entry.id,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.access_count,
            entry.text
        );
    }

    println!();
    println!("Revisions:");
    for rev in revisions.history(conversation).await? {
        println!(
            "  {} {} {:<8}",
            rev.timestamp.format("%Y-%m-%d %H:%M:%S"),
            rev.id,
            rev.mutation.kind()
        );
    }
    Ok(())
}

async fn run_doctor(config: &ProxyConfig, config_path: Option<&std::path::Path>) -> Result<()> {
    println!("memproxy doctor");
    println!();

    println!("Checking configuration...");
    match config_path {
        Some(path) => println!("  ✓ Configuration file: {}", path.display()),
        None => println!("  ℹ No configuration file found (using defaults)"),
    }
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration is valid"),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking API keys...");
    for (name, env_var) in [
        ("upstream", config.upstream.api_key_env.as_deref()),
        ("embedding", config.embedding.api_key_env.as_deref()),
        ("extraction", config.extraction.api_key_env.as_deref()),
    ] {
        match (env_var, resolve_api_key(env_var)) {
            (Some(var), Some(_)) => println!("  ✓ {}: ${} is set", name, var),
            (Some(var), None) => println!("  ✗ {}: ${} is not set", name, var),
            (None, _) => println!("  ℹ {}: no key configured", name),
        }
    }

    println!();
    println!("Checking storage...");
    match config.storage.backend {
        StorageBackend::Memory => println!("  ℹ In-memory backend, nothing is persisted"),
        StorageBackend::File => {
            let base = &config.storage.base_dir;
            let probe = base.join(".doctor");
            let writable = async {
                tokio::fs::create_dir_all(base).await?;
                tokio::fs::write(&probe, b"ok").await?;
                tokio::fs::remove_file(&probe).await
            }
            .await;
            match writable {
                Ok(()) => println!("  ✓ {} is writable", base.display()),
                Err(e) => println!("  ✗ {}: {}", base.display(), e),
            }
        }
    }

    println!();
    println!("Doctor check complete!");
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join("memproxy").join("config.toml"))
}
