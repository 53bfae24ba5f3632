/// dcache - inspect and drive a delta-cache store from the command line
///
/// Usage:
///   dcache providers                          - Show which storage providers work here
///   dcache find <collection> [--filter JSON]  - List cached entities
///   dcache get <collection> <id>              - Show one cached entity
///   dcache save <collection> <json>           - Upsert one entity or an array
///   dcache remove <collection> <id>           - Remove one cached entity
///   dcache clear                              - Remove every cached collection
///   dcache pull <collection> --url URL --app-key KEY
///                                             - Refresh a collection from the backend
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::*;
use delta_cache::{
    Entity, Filter, JsonValue, Query, StorageProvider, SyncClient, SyncConfig,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// dcache - offline cache inspector
///
/// Reads and writes the same stores a delta-cache client uses.
#[derive(Parser)]
#[command(name = "dcache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory (default: the platform data dir)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Logical database name
    #[arg(long, global = true, default_value = "dcache")]
    database: String,

    /// Use only this storage provider (object-store, sqlite, key-value, memory)
    #[arg(short, long, global = true)]
    provider: Option<StorageProvider>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List storage providers and whether they can run with these settings
    Providers,

    /// List cached entities of a collection
    ///
    /// Examples:
    ///   dcache find books
    ///   dcache find books --filter '{"author": "Herbert"}' --limit 10
    Find {
        collection: String,

        /// Equality object, or a JSON list of filters
        #[arg(short, long)]
        filter: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show one cached entity
    Get { collection: String, id: String },

    /// Upsert an entity, or an array of entities
    ///
    /// Example:
    ///   dcache save books '{"id": "b1", "title": "Dune"}'
    Save { collection: String, value: String },

    /// Remove one cached entity
    Remove { collection: String, id: String },

    /// Remove every cached collection in the database
    Clear,

    /// Delta-sync a collection from the backend into the cache
    Pull {
        collection: String,

        /// Backend base URL
        #[arg(long)]
        url: String,

        #[arg(long)]
        app_key: String,

        /// Equality object, or a JSON list of filters
        #[arg(short, long)]
        filter: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn format_json(value: &JsonValue) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Parse `--filter`: either a list of filters, a single filter, or a plain
/// object whose fields must all be equal.
fn parse_filter(text: &str) -> Result<Vec<Filter>> {
    if let Ok(filters) = serde_json::from_str::<Vec<Filter>>(text) {
        return Ok(filters);
    }
    if let Ok(filter) = serde_json::from_str::<Filter>(text) {
        return Ok(vec![filter]);
    }
    let value: JsonValue =
        serde_json::from_str(text).with_context(|| format!("Invalid filter JSON: {}", text))?;
    let Some(object) = value.as_object() else {
        bail!("Filter must be a JSON object or a list of filters");
    };
    Ok(object
        .iter()
        .map(|(field, value)| Filter::eq(field.as_str(), value.clone()))
        .collect())
}

fn build_query(filter: Option<&str>, limit: Option<usize>) -> Result<Query> {
    let mut query = Query::new();
    if let Some(text) = filter {
        query = query.filters(parse_filter(text)?);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    Ok(query)
}

impl Cli {
    fn config(&self, app_key: &str) -> SyncConfig {
        let mut config = SyncConfig::new(app_key).with_database_name(&self.database);
        if let Some(dir) = self.data_dir.clone().or_else(SyncConfig::default_data_dir) {
            config = config.with_data_dir(dir);
        }
        if let Some(provider) = self.provider {
            config = config.with_storage(vec![provider]);
        }
        config
    }
}

fn print_entities(entities: &[Entity]) {
    let values: Vec<JsonValue> = entities.iter().map(Entity::to_json).collect();
    println!("{}", format_json(&JsonValue::Array(values)));
    eprintln!(
        "{}",
        format!(
            "({} {})",
            entities.len(),
            if entities.len() == 1 { "entity" } else { "entities" }
        )
        .bright_black()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Providers = cli.command {
        let config = cli.config(&cli.database);
        println!("{}", "Storage providers:".bold());
        for provider in StorageProvider::preference_order() {
            let status = if provider.is_supported(&config) {
                "supported".green()
            } else {
                "unsupported".red()
            };
            println!("  {:<14} {}", provider.as_str().cyan(), status);
        }
        return Ok(());
    }

    if let Commands::Pull {
        collection,
        url,
        app_key,
        filter,
        limit,
    } = &cli.command
    {
        let config = cli.config(app_key).with_base_url(url);
        let client = open_online(config).await?;
        let query = build_query(filter.as_deref(), *limit)?;
        let result = client
            .collection(collection)?
            .pull(&query)
            .await
            .with_context(|| format!("Failed to pull '{}'", collection))?;

        print_entities(&result.entities);
        eprintln!(
            "{} re-fetched {} in {} {}",
            "OK".green().bold(),
            result.refetched_ids.len(),
            result.batches,
            if result.batches == 1 { "batch" } else { "batches" }
        );
        return Ok(());
    }

    let client = SyncClient::offline(cli.config(&cli.database))
        .await
        .context("Failed to open cache")?;

    match &cli.command {
        Commands::Find {
            collection,
            filter,
            limit,
        } => {
            let query = build_query(filter.as_deref(), *limit)?;
            let entities = client.collection(collection)?.find(&query).await?;
            print_entities(&entities);
        }
        Commands::Get { collection, id } => {
            let entity = client
                .collection(collection)?
                .find_by_id(id)
                .await
                .with_context(|| format!("Entity not found: {}/{}", collection, id))?;
            println!("{}", format_json(&entity.to_json()));
        }
        Commands::Save { collection, value } => {
            let value: JsonValue = serde_json::from_str(value)
                .with_context(|| format!("Invalid JSON value: {}", value))?;
            let handle = client.collection(collection)?;
            let saved = match value {
                JsonValue::Array(_) => {
                    handle
                        .save_many(delta_cache::entity::entities_from_json(value)?)
                        .await?
                }
                other => vec![handle.save(Entity::from_json(other)?).await?],
            };
            for entity in &saved {
                let key = format!("{}/{}", collection, entity.id().unwrap_or_default());
                println!("{} {}", "saved".green(), key.cyan());
            }
        }
        Commands::Remove { collection, id } => {
            let removed = client
                .collection(collection)?
                .remove_by_id(id)
                .await
                .with_context(|| format!("Failed to remove {}/{}", collection, id))?;
            println!("{} {} {}", "removed".green(), removed.count, collection.cyan());
        }
        Commands::Clear => {
            client.clear().await.context("Failed to clear cache")?;
            println!("{}", "OK".green().bold());
        }
        Commands::Providers | Commands::Pull { .. } => {}
    }
    Ok(())
}

#[cfg(feature = "http")]
async fn open_online(config: SyncConfig) -> Result<SyncClient> {
    SyncClient::start(config)
        .await
        .context("Failed to start sync client")
}

#[cfg(not(feature = "http"))]
async fn open_online(_config: SyncConfig) -> Result<SyncClient> {
    bail!("dcache was built without the http feature")
}
