// fsend: peer-addressed file exchange
//
// Cross-platform (macOS, Linux, Windows) command-line interface: runs the
// exchange server, or talks to one as a client under the local identifier.

mod config;
mod identity;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use fsend_core::{ClientError, FileClient, FileServer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fsend")]
#[command(about = "fsend — Peer-Addressed File Exchange", long_about = None)]
#[command(version)]
struct Cli {
    /// Server address for client commands (overrides config)
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the file exchange server
    Serve {
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        storage: Option<PathBuf>,
    },
    /// Check that the server answers
    Ping,
    /// List files waiting for this identifier
    List,
    /// Upload a file into this identifier's storage
    Put {
        path: PathBuf,
        /// Copy buffer size to request from the server
        #[arg(short, long)]
        buffer: Option<u32>,
    },
    /// Download a file (the server deletes it afterwards)
    Get {
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Push a file into another identifier's storage
    Send { target: String, path: PathBuf },
    /// Show the local identifier
    Whoami,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = config::Config::load()?;
    let server = cli.server.unwrap_or_else(|| config.server_addr.clone());

    match cli.command {
        Commands::Serve { listen, storage } => cmd_serve(&config, listen, storage).await,
        Commands::Ping => cmd_ping(&config, &server).await,
        Commands::List => cmd_list(&config, &server).await,
        Commands::Put { path, buffer } => cmd_put(&config, &server, &path, buffer).await,
        Commands::Get { name, output } => cmd_get(&config, &server, &name, output).await,
        Commands::Send { target, path } => cmd_send(&config, &server, &target, &path).await,
        Commands::Whoami => cmd_whoami(&config),
        Commands::Config { action } => cmd_config(config, action),
    }
}

async fn cmd_serve(
    config: &config::Config,
    listen: Option<SocketAddr>,
    storage: Option<PathBuf>,
) -> Result<()> {
    let mut server_config = config.server_config();
    if let Some(addr) = listen {
        server_config.listen_addr = addr;
    }
    if let Some(dir) = storage {
        server_config.storage_root = dir;
    }

    let server = FileServer::bind(server_config)
        .await
        .context("Failed to start server")?;

    println!("{}", "fsend server running".bold());
    println!("  Listening: {}", server.local_addr()?.to_string().bright_cyan());
    println!(
        "  Storage:   {}",
        server.config().storage_root.display().to_string().bright_cyan()
    );
    println!();
    println!("{}", "Press Ctrl+C to stop".dimmed());

    let registry = server.registry();
    tokio::select! {
        result = server.run() => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            let stats = registry.stats();
            println!();
            println!(
                "{} Shutting down ({} active, {} served)",
                "✓".green(),
                stats.connections_active,
                stats.connections_total
            );
        }
    }
    Ok(())
}

/// Connect to `server` and register under the local identifier
async fn open_session(config: &config::Config, server: &str) -> Result<FileClient> {
    let uid = identity::load_or_create(&config.uid_path()?)?;
    let mut client = FileClient::connect(server)
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;
    client.register(&uid).await.context("Failed to register")?;
    Ok(client)
}

async fn cmd_ping(config: &config::Config, server: &str) -> Result<()> {
    let mut client = open_session(config, server).await?;
    let started = Instant::now();
    client.ping().await.context("Ping failed")?;
    let elapsed = started.elapsed();
    client.bye().await?;

    println!(
        "{} pong from {} in {:.1} ms",
        "✓".green(),
        server.bright_cyan(),
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}

async fn cmd_list(config: &config::Config, server: &str) -> Result<()> {
    let mut client = open_session(config, server).await?;
    let names = client.list_files().await.context("Listing failed")?;
    client.bye().await?;

    if names.is_empty() {
        println!("{}", "No files waiting.".dimmed());
    } else {
        println!("{} ({} total)", "Files".bold(), names.len());
        println!();
        for name in names {
            println!("  {} {}", "•".bright_green(), name.bright_cyan());
        }
    }
    Ok(())
}

async fn cmd_put(
    config: &config::Config,
    server: &str,
    path: &Path,
    buffer: Option<u32>,
) -> Result<()> {
    let mut client = open_session(config, server).await?;
    let hint = buffer.unwrap_or(config.buffer_hint);
    let sent = client
        .put_file(path, hint)
        .await
        .with_context(|| format!("Failed to upload {}", path.display()))?;
    client.bye().await?;

    println!(
        "{} Uploaded {} ({} bytes)",
        "✓".green(),
        path.display().to_string().bright_cyan(),
        sent
    );
    Ok(())
}

async fn cmd_get(
    config: &config::Config,
    server: &str,
    name: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let output = match output {
        Some(path) => path,
        None => Path::new(name)
            .file_name()
            .map(PathBuf::from)
            .with_context(|| format!("Cannot derive a local file name from {}", name))?,
    };

    let mut client = open_session(config, server).await?;
    let result = client.download(name, &output).await;
    if let Err(e) = client.bye().await {
        tracing::debug!(error = %e, "BYE failed");
    }

    match result {
        Ok(received) => {
            println!(
                "{} Downloaded {} to {} ({} bytes)",
                "✓".green(),
                name.bright_cyan(),
                output.display(),
                received
            );
            Ok(())
        }
        Err(ClientError::NotFound(_)) => {
            anyhow::bail!("No file named {} is waiting on the server", name)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to download {}", name)),
    }
}

async fn cmd_send(config: &config::Config, server: &str, target: &str, path: &Path) -> Result<()> {
    let mut client = open_session(config, server).await?;
    let sent = client
        .send_file(target, path)
        .await
        .with_context(|| format!("Failed to send {}", path.display()))?;
    client.bye().await?;

    println!(
        "{} Sent {} to {} ({} bytes)",
        "✓".green(),
        path.display().to_string().bright_cyan(),
        target.bright_yellow(),
        sent
    );
    Ok(())
}

fn cmd_whoami(config: &config::Config) -> Result<()> {
    let path = config.uid_path()?;
    let uid = identity::load_or_create(&path)?;

    println!("{}", "Identity".bold());
    println!("  UID:  {}", uid.bright_cyan());
    println!("  File: {}", path.display().to_string().dimmed());
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown or unset config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<14} {}", key.bright_cyan(), value);
            }
            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}
