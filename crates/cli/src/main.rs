//! certbucket - command-line access to certificate storage
//!
//! Inspect and edit what an ACME cluster keeps in its bucket: stored
//! certificates and keys, and the lock records guarding them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use certbucket::{
    generate_key, CancellationToken, CertificateStorage, ObjectStorage, StorageConfig,
};

/// Certificate storage on S3-compatible object stores
#[derive(Parser, Debug)]
#[command(name = "certbucket")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTBUCKET_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and check that the bucket is reachable
    Check,
    /// Print a fresh random encryption key as hex
    GenKey,
    /// Store a value read from a file or stdin
    Put {
        key: String,
        /// Read the value from this file instead of stdin
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },
    /// Write a stored value to stdout
    Get { key: String },
    /// Delete a stored value
    Rm { key: String },
    /// Show size and modification time of a key
    Stat { key: String },
    /// List keys under a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
        /// Include nested keys instead of direct children only
        #[arg(short = 'r', long = "recursive")]
        recursive: bool,
    },
    /// Acquire a lock, waiting until it is free
    Lock {
        key: String,
        /// Give up after this many seconds
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    /// Release a lock
    Unlock { key: String },
    /// Show whether a lock is held and by how long
    LockStatus { key: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Commands::GenKey = cli.command {
        print_new_key();
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, config))
}

/// Load the TOML configuration and apply credential overrides.
fn load_config(path: Option<&std::path::Path>) -> Result<StorageConfig> {
    let Some(path) = path else {
        bail!("No configuration file given (use --config or CERTBUCKET_CONFIG)");
    };
    info!("Loading configuration from: {}", path.display());

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    let mut config: StorageConfig =
        toml::from_str(&text).context("Failed to parse configuration file")?;
    apply_env_overrides(&mut config);
    Ok(config)
}

fn print_new_key() {
    println!("{}", hex::encode(generate_key()));
}

fn apply_env_overrides(config: &mut StorageConfig) {
    if let Ok(id) = std::env::var("CERTBUCKET_ACCESS_KEY_ID") {
        config.access_key_id = id;
    }
    if let Ok(secret) = std::env::var("CERTBUCKET_SECRET_ACCESS_KEY") {
        config.secret_access_key = secret;
    }
}

async fn run(command: Commands, config: StorageConfig) -> Result<()> {
    let storage = ObjectStorage::connect(&config)
        .await
        .context("Failed to open certificate storage")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupted");
                cancel.cancel();
            }
        });
    }

    match command {
        Commands::Check => {
            println!(
                "certbucket: bucket '{}' is reachable, prefix '{}', {} storage",
                config.bucket,
                storage.namer().prefix(),
                if storage.is_encrypted() {
                    "encrypted"
                } else {
                    "clear text"
                }
            );
        }
        Commands::GenKey => print_new_key(),
        Commands::Put { key, file } => {
            let value = match file {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin()
                        .read_to_end(&mut buf)
                        .await
                        .context("Failed to read stdin")?;
                    buf
                }
            };
            storage
                .store(&key, &value, &cancel)
                .await
                .with_context(|| format!("Failed to store '{}'", key))?;
            info!(key = %key, size = value.len(), "Stored");
        }
        Commands::Get { key } => {
            let value = storage
                .load(&key, &cancel)
                .await
                .with_context(|| format!("Failed to load '{}'", key))?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&value).await?;
            stdout.flush().await?;
        }
        Commands::Rm { key } => {
            storage
                .delete(&key, &cancel)
                .await
                .with_context(|| format!("Failed to delete '{}'", key))?;
            info!(key = %key, "Deleted");
        }
        Commands::Stat { key } => {
            let info = storage
                .stat(&key, &cancel)
                .await
                .with_context(|| format!("Failed to stat '{}'", key))?;
            println!("key:      {}", info.key);
            println!("size:     {}", info.size);
            println!("modified: {}", info.modified.to_rfc3339());
        }
        Commands::Ls { prefix, recursive } => {
            let keys = storage
                .list(&prefix, recursive, &cancel)
                .await
                .with_context(|| format!("Failed to list '{}'", prefix))?;
            for key in keys {
                println!("{}", key);
            }
        }
        Commands::Lock { key, timeout_secs } => {
            if let Some(secs) = timeout_secs {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    cancel.cancel();
                });
            }
            storage
                .lock(&key, &cancel)
                .await
                .with_context(|| format!("Failed to lock '{}'", key))?;
            println!("certbucket: locked '{}'", key);
        }
        Commands::Unlock { key } => {
            storage
                .unlock(&key, &cancel)
                .await
                .with_context(|| format!("Failed to unlock '{}'", key))?;
            println!("certbucket: unlocked '{}'", key);
        }
        Commands::LockStatus { key } => {
            let state = storage
                .locks()
                .inspect(&key)
                .await
                .with_context(|| format!("Failed to read lock '{}'", key))?;
            println!("{}: {}", key, state);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ls_and_lock() {
        let cli = Cli::parse_from(["certbucket", "-c", "c.toml", "ls", "certificates", "-r"]);
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert!(matches!(
            cli.command,
            Commands::Ls { ref prefix, recursive: true } if prefix == "certificates"
        ));

        let cli = Cli::parse_from(["certbucket", "lock", "certA", "--timeout-secs", "5", "--verbose"]);
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Lock { ref key, timeout_secs: Some(5) } if key == "certA"
        ));
    }

    #[test]
    fn test_missing_config_is_an_error() {
        let err = load_config(None).unwrap_err();
        assert!(err.to_string().contains("--config"));
    }
}
