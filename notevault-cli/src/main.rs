use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use notevault_core::config::Config;
use notevault_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use notevault_core::provider::LocalFileProvider;
use notevault_core::{ItemId, MemoryCredentialStore, StorageItem, StorageManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable holding the encryption password
const PASSWORD_ENV: &str = "NOTEVAULT_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "notevault")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Raise verbosity one level per occurrence (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Configuration file (TOML); NOTEVAULT_* variables still apply on top
    #[arg(short, long)]
    config: Option<String>,

    /// Data directory, overrides the configuration
    #[arg(long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update an item
    Put {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        content: String,

        /// Read the content from a file instead
        #[arg(long, conflicts_with = "content")]
        file: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Update the item with this id
        #[arg(long)]
        id: Option<String>,
    },
    /// Print an item as JSON
    Get { id: String },
    /// List items on the primary provider
    List,
    Delete { id: String },
    /// Back up the primary provider
    Backup,
    /// Replace the primary provider's items from a backup
    Restore { path: String },
    /// Write every item to an interchange file
    Export,
    /// Import items from an interchange file
    Import { path: String },
    /// Reconcile primary and secondary now
    Sync,
    /// Print statistics and health
    Stats,
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let path = expand(path);
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env()?;
            config
        }
        None => Config::from_env()?,
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = expand(dir);
    }
    if config.data_dir.as_os_str().is_empty() {
        config.data_dir = Config::default_data_dir();
    }
    config.validate()?;
    Ok(config)
}

fn init_cli_logging(args: &Args, config: &Config) -> Result<()> {
    let requested = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let mut log_level = requested.parse::<LogLevel>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', using 'info'", requested);
        LogLevel::Info
    });
    for _ in 0..args.verbose {
        log_level = log_level.more_verbose();
    }

    let log_config = LogConfig::new(log_level)
        .json_format(args.json_logs || config.logging.json_format)
        .with_target(config.logging.with_target);
    init_logging_with_config(log_config)?;
    Ok(())
}

/// Build a manager over filesystem providers under the data directory
async fn open_manager(config: &Config, password: Option<String>) -> Result<Arc<StorageManager>> {
    let storage = &config.storage;
    if storage.encryption_enabled && password.is_none() {
        bail!("encryption is enabled; set {} to read and write items", PASSWORD_ENV);
    }

    let mut builder = StorageManager::builder(storage.clone());
    for id in storage.active_providers() {
        let dir = config.provider_dir(&id);
        debug!(provider = %id, dir = %dir.display(), "Opening provider");
        let provider = if storage.secondary_provider.as_ref() == Some(&id) {
            LocalFileProvider::cloud_folder(id, dir)?
        } else {
            LocalFileProvider::new(id, dir)?
        };
        builder = builder.provider(provider);
    }

    if let Some(password) = password {
        let store = MemoryCredentialStore::with_passwords(
            storage
                .active_providers()
                .into_iter()
                .map(|id| (id, password.clone())),
        );
        builder = builder.credentials(Arc::new(store));
    }

    Ok(builder.build().await?)
}

fn parse_id(id: &str) -> Result<ItemId> {
    id.parse::<ItemId>()
        .with_context(|| format!("'{}' is not a valid item id", id))
}

/// Run one command; returns what should be printed
async fn execute(manager: &StorageManager, command: Command) -> Result<String> {
    let output = match command {
        Command::Put {
            title,
            content,
            file,
            tags,
            id,
        } => {
            let content = match file {
                Some(path) => tokio::fs::read_to_string(expand(&path)).await?,
                None => content,
            };
            let mut item = match id {
                Some(id) => {
                    let id = parse_id(&id)?;
                    match manager.load_item(&id).await? {
                        Some(mut existing) => {
                            existing.set_title(title);
                            existing.set_content(content);
                            existing
                        }
                        None => StorageItem::with_id(id, title, content),
                    }
                }
                None => StorageItem::new(title, content),
            };
            for tag in tags {
                item.add_tag(tag);
            }

            let saved = manager.save_item(&item).await?;
            info!(item = %saved.id(), status = %saved.sync_status, "Item saved");
            saved.id().to_string()
        }
        Command::Get { id } => {
            let id = parse_id(&id)?;
            match manager.load_item(&id).await? {
                Some(item) => serde_json::to_string_pretty(&item)?,
                None => bail!("item {} not found", id),
            }
        }
        Command::List => {
            let mut items = manager.load_all_items().await?;
            items.sort_by_key(|item| std::cmp::Reverse(item.modified_at()));
            items
                .iter()
                .map(|item| format!("{}\t{}\t{}", item.id(), item.sync_status, item.title))
                .collect::<Vec<_>>()
                .join("\n")
        }
        Command::Delete { id } => {
            let id = parse_id(&id)?;
            if !manager.delete_item(&id).await? {
                bail!("item {} not found", id);
            }
            format!("deleted {}", id)
        }
        Command::Backup => manager.create_backup().await?.display().to_string(),
        Command::Restore { path } => {
            let path = expand(&path);
            manager.restore_backup(&path).await?;
            format!("restored from {}", path.display())
        }
        Command::Export => manager.export_all().await?.display().to_string(),
        Command::Import { path } => {
            let count = manager.import_from(&expand(&path)).await?;
            format!("imported {} items", count)
        }
        Command::Sync => {
            let report = manager.sync_now().await?;
            serde_json::to_string_pretty(&report)?
        }
        Command::Stats => {
            let statistics = manager.refresh_statistics().await;
            let health = manager.health();
            serde_json::to_string_pretty(&serde_json::json!({
                "statistics": statistics,
                "health": health,
            }))?
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_cli_logging(&args, &config)?;

    info!(data_dir = %config.data_dir.display(), "notevault started");

    let password = std::env::var(PASSWORD_ENV).ok();
    let manager = open_manager(&config, password).await?;
    let output = execute(&manager, args.command).await?;
    if !output.is_empty() {
        println!("{}", output);
    }

    manager.shutdown().await;
    Ok(())
}
