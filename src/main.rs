use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context as _, bail};
use clap::{ArgGroup, Parser, Subcommand};
use mockdb::{
    backup::{ExportScope, read_snapshot_file},
    config::Config,
    connection::StorageLocation,
    logging,
    schema::Collection,
    services::MockServices,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "mockdb", about = "Inspect and manage the local mock data store")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// Show storage location, schema version and record counts.
    Status,
    /// Write a backup snapshot to a file, or stdout when `--out` is omitted.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
        /// Include captured traffic (network log and mock responses).
        #[arg(long)]
        all: bool,
    },
    /// Replace collections with the contents of a snapshot file.
    Import { file: PathBuf },
    /// Empty every collection, optionally re-seeding from a snapshot file.
    Reset {
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Print one record, or every record in a collection.
    Get { collection: String, id: Option<String> },
    /// Review captured mock responses.
    Mocks {
        #[command(subcommand)]
        action: MocksCommand,
    },
    /// Inspect the network log.
    Log {
        #[command(subcommand)]
        action: LogCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum MocksCommand {
    /// List captured responses.
    List {
        /// Only entries that have not been reviewed yet.
        #[arg(long)]
        pending: bool,
    },
    /// Approve or reject a captured response.
    #[command(group(ArgGroup::new("decision").required(true).args(["approve", "reject"])))]
    Review {
        key: String,
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        reject: bool,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum LogCommand {
    /// List log entries oldest first, or the newest `--limit` entries.
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Empty the network log.
    Clear,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    location: String,
    schema_version: i32,
    initialized: bool,
    api_base_url: String,
    use_mock_data: bool,
    capture_responses: bool,
    log_network_traffic: bool,
    records: BTreeMap<&'static str, usize>,
}

fn describe_location(location: &StorageLocation) -> String {
    match location {
        StorageLocation::File(path) => path.display().to_string(),
        StorageLocation::Memory => ":memory:".to_owned(),
    }
}

async fn run_command(services: &MockServices, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Status => {
            let connection = services.connections().ensure_connection().await?;
            let mut records = BTreeMap::new();
            for collection in Collection::ALL {
                records.insert(collection.name(), services.store.count(collection).await?);
            }
            let flags = services.network_flags();
            serde_json::to_value(StatusReport {
                location: describe_location(services.connections().location()),
                schema_version: connection.schema_version().await?,
                initialized: services.backup.is_initialized().await?,
                api_base_url: flags.api_base_url,
                use_mock_data: flags.use_mock_data,
                capture_responses: flags.capture_responses,
                log_network_traffic: flags.log_network_traffic,
                records,
            })?
        }
        Command::Export { out, all } => {
            let scope = if all {
                ExportScope::All
            } else {
                ExportScope::Persisted
            };
            match out {
                Some(path) => {
                    let written = services.backup.export_to_path(&path, scope).await?;
                    serde_json::json!({ "exported": written })
                }
                None => serde_json::to_value(services.backup.export_scope(scope).await?)?,
            }
        }
        Command::Import { file } => {
            serde_json::to_value(services.backup.import_from_path(&file).await?)?
        }
        Command::Reset { seed } => {
            let seed = match seed {
                Some(path) => Some(read_snapshot_file(&path).await?),
                None => None,
            };
            let summary = services.backup.reset_with_seed(seed.as_ref()).await?;
            serde_json::json!({
                "initialized": services.backup.is_initialized().await?,
                "imported": summary,
            })
        }
        Command::Get { collection, id } => {
            let collection: Collection = collection.parse()?;
            match id {
                Some(id) => services
                    .store
                    .get(collection, &id)
                    .await?
                    .with_context(|| format!("record `{id}` was not found in `{collection}`"))?,
                None => Value::Array(services.store.get_all(collection).await?),
            }
        }
        Command::Mocks { action } => match action {
            MocksCommand::List { pending } => {
                let entries = if pending {
                    services.catalog.pending().await?
                } else {
                    services.catalog.list().await?
                };
                serde_json::to_value(entries)?
            }
            MocksCommand::Review {
                key,
                approve,
                reject,
            } => {
                if approve == reject {
                    bail!("pass exactly one of --approve or --reject");
                }
                serde_json::to_value(services.catalog.review(&key, approve).await?)?
            }
        },
        Command::Log { action } => match action {
            LogCommand::List { limit: Some(limit) } => {
                serde_json::to_value(services.recorder.recent(limit).await?)?
            }
            LogCommand::List { limit: None } => serde_json::to_value(services.recorder.list().await?)?,
            LogCommand::Clear => {
                serde_json::json!({ "removed": services.recorder.clear().await? })
            }
        },
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;

    let services = MockServices::from_config(&config);
    let output = run_command(&services, cli.command).await?;
    services.connections().close().await;

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("render command output")?
    );
    Ok(())
}
