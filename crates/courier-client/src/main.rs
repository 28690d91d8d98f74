//! Courier - encrypted file relay client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_client::config::expand_path;
use courier_client::layout::Folder;
use courier_client::{Client, ClientEvent, Config, EventReceiver};
use courier_core::{KeyLength, PeerId};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Encrypted file relay client", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.courier/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Relay address as host:port (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Username to log in with (overrides config)
    #[arg(short, long)]
    user: Option<String>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Stay connected and print everything the relay sends
    Listen,

    /// List clients currently online
    Peers,

    /// Encrypt a file and send it to another client
    Send {
        /// Path to the file to send
        #[arg(required = true)]
        file: PathBuf,

        /// Recipient username
        #[arg(short, long)]
        to: String,

        /// AES key size in bits (128, 192 or 256)
        #[arg(short, long)]
        key_size: Option<KeyLength>,

        /// Encryption password
        #[arg(short, long, env = "COURIER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Encrypt a file into the Encrypt folder
    Encrypt {
        #[arg(required = true)]
        file: PathBuf,

        #[arg(short, long)]
        key_size: Option<KeyLength>,

        #[arg(short, long, env = "COURIER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Decrypt a received file into the Decrypt folder
    Decrypt {
        /// Name of the file in the Received folder
        #[arg(required = true)]
        file: String,

        #[arg(short, long)]
        key_size: Option<KeyLength>,

        #[arg(short, long, env = "COURIER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// List received, decrypted and encrypted files
    Files,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(server) = cli.server {
        config.server.address = server;
    }
    if let Some(user) = cli.user {
        config.username = Some(user);
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    let default_key = config.cipher.key_size;

    match cli.command {
        Commands::Init => init_config(&config_path)?,
        Commands::Listen => {
            let (client, events) = build_client(&config)?;
            listen(client, events).await?;
        }
        Commands::Peers => {
            let (client, _events) = build_client(&config)?;
            list_peers(&client).await?;
        }
        Commands::Send {
            file,
            to,
            key_size,
            password,
        } => {
            let recipient = PeerId::parse(&to)?;
            let (client, events) = build_client(&config)?;
            let key_length = key_size.unwrap_or(default_key);
            send_file(&client, events, file, recipient, password, key_length).await?;
        }
        Commands::Encrypt {
            file,
            key_size,
            password,
        } => {
            let (client, _events) = build_client(&config)?;
            let key_length = key_size.unwrap_or(default_key);
            let dest = client.encrypt_file(&file, password, key_length).await?;
            println!("Encrypted with {}: {}", key_length, dest.display());
        }
        Commands::Decrypt {
            file,
            key_size,
            password,
        } => {
            let (client, _events) = build_client(&config)?;
            let key_length = key_size.unwrap_or(default_key);
            let dest = client.decrypt_received(&file, password, key_length).await?;
            println!("Decrypted: {}", dest.display());
        }
        Commands::Files => {
            let (client, _events) = build_client(&config)?;
            list_files(&client).await?;
        }
    }

    Ok(())
}

fn build_client(config: &Config) -> Result<(Client, EventReceiver)> {
    let username = config
        .username
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("Username required. Use --user or set it in the config"))?;
    let username = PeerId::parse(username)?;
    Ok(Client::from_config(config, username))
}

async fn listen(mut client: Client, mut events: EventReceiver) -> Result<()> {
    client.connect().await?;
    println!("Listening as {} (Ctrl+C to quit)", client.username());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.disconnect().await;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", event.describe());
                if let ClientEvent::Disconnected { .. } = event {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn list_peers(client: &Client) -> Result<()> {
    let peers = client.list_peers().await?;
    if peers.is_empty() {
        println!("No clients online!");
    } else {
        println!("{} client(s) online:", peers.len());
        for peer in &peers {
            println!("  {}", peer);
        }
    }
    Ok(())
}

async fn send_file(
    client: &Client,
    mut events: EventReceiver,
    file: PathBuf,
    recipient: PeerId,
    password: String,
    key_length: KeyLength,
) -> Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }

    let task = client.spawn_send_encrypted(file, recipient, password, key_length);
    let id = task.id();

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::TransferProgress { percent, .. } if percent % 10 != 0 => {}
            ClientEvent::SubmissionAcknowledged { task, .. } if task == id => {
                println!("{}", event.describe());
                break;
            }
            ClientEvent::TaskFailed { task, reason } if task == id => {
                anyhow::bail!("Send failed: {}", reason);
            }
            other => println!("{}", other.describe()),
        }
    }

    task.join().await;
    Ok(())
}

async fn list_files(client: &Client) -> Result<()> {
    println!("User folder: {}", client.dirs().root().display());
    for folder in Folder::ALL {
        let files = client.dirs().list(folder).await?;
        println!();
        println!("{} ({} files)", folder.dir_name(), files.len());
        for file in files {
            println!("  {} ({} bytes)", file.name, file.size);
        }
    }
    Ok(())
}

fn init_config(config_path: &std::path::Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
        tracing::info!("Created config directory: {}", parent.display());
    }

    let config = Config::default();
    let toml = toml::to_string_pretty(&config)?;
    std::fs::write(config_path, toml)?;

    println!("Initialized Courier config at: {}", config_path.display());
    println!("Set `username` and `[server] address` before connecting.");
    Ok(())
}
