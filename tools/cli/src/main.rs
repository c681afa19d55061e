//! Tidesync CLI - inspect and edit a local replica.
//!
//! Mutations submitted here are only queued: the CLI never talks to a
//! remote store, so everything it writes waits in the outbox until an
//! application embedding the engine drains it. `demo` runs two replicas
//! in-process against the in-memory remote.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tidesync_common::{
    CollectionName, Entity, EntityKey, FieldPatch, MutationId, MutationOp, ReplicaId, Value,
};
use tidesync_remote::MemoryRemote;
use tidesync_store::{Database, Predicate};
use tidesync_sync::{SyncConfig, SyncEngine};

const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "replica.db";

#[derive(Parser)]
#[command(name = "tidesync")]
#[command(about = "Tidesync - offline-first replica inspection")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (default: platform data dir).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config subscribing to the given collections.
    Init {
        /// Collection names.
        #[arg(required = true)]
        collections: Vec<String>,

        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },

    /// Create or update an entity.
    Put {
        collection: String,
        id: String,

        /// Field edits: `name=value`, `tags+=item` or `tags-=item`.
        /// Values are parsed as JSON, falling back to plain text.
        edits: Vec<String>,

        /// Fields to remove.
        #[arg(short, long)]
        remove: Vec<String>,
    },

    /// Delete an entity.
    Delete { collection: String, id: String },

    /// Show one entity.
    Get { collection: String, id: String },

    /// List live entities, optionally filtered by `field=value`.
    Query {
        collection: String,

        #[arg(short, long)]
        filter: Vec<String>,
    },

    /// List outbox mutations.
    Outbox,

    /// Show change stream cursors.
    Cursors,

    /// Withdraw a mutation that has not been sent.
    Cancel { mutation_id: u64 },

    /// Run two replicas against an in-memory remote and show them converge.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact();
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?,
        Err(_) => tracing::subscriber::set_global_default(builder.finish())?,
    }

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No data directory on this platform; pass --data-dir")?
            .join("tidesync"),
    };

    match cli.command {
        Commands::Init { collections, force } => cmd_init(&data_dir, collections, force),

        Commands::Put {
            collection,
            id,
            edits,
            remove,
        } => cmd_put(&data_dir, &collection, &id, &edits, &remove),

        Commands::Delete { collection, id } => cmd_delete(&data_dir, &collection, &id),

        Commands::Get { collection, id } => cmd_get(&data_dir, &collection, &id),

        Commands::Query { collection, filter } => cmd_query(&data_dir, &collection, &filter),

        Commands::Outbox => cmd_outbox(&data_dir),

        Commands::Cursors => cmd_cursors(&data_dir),

        Commands::Cancel { mutation_id } => cmd_cancel(&data_dir, mutation_id),

        Commands::Demo => cmd_demo().await,
    }
}

/// Open the replica in a data directory. The gateway stays offline.
fn open_engine(data_dir: &Path) -> Result<SyncEngine> {
    let config_path = data_dir.join(CONFIG_FILE);
    let config = if config_path.exists() {
        SyncConfig::load(&config_path).context("Failed to load config")?
    } else {
        SyncConfig::default()
    };

    std::fs::create_dir_all(data_dir).context("Failed to create data directory")?;
    let db = Database::open(data_dir.join(DATABASE_FILE)).context("Failed to open replica")?;

    let remote = MemoryRemote::new();
    remote.set_online(false);
    let engine = SyncEngine::open(Arc::new(db), Arc::new(remote), config)
        .context("Failed to start engine")?;
    Ok(engine)
}

fn parse_value(raw: &str) -> Result<Value> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Ok(Value::try_from(json)?),
        Err(_) => Ok(Value::Text(raw.to_string())),
    }
}

fn parse_patch(edits: &[String], remove: &[String]) -> Result<FieldPatch> {
    let mut patch = FieldPatch::new();
    for edit in edits {
        if let Some((field, item)) = edit.split_once("+=") {
            patch = patch.add_to_set(field, [item]);
        } else if let Some((field, item)) = edit.split_once("-=") {
            patch = patch.remove_from_set(field, [item]);
        } else if let Some((field, raw)) = edit.split_once('=') {
            patch = patch.set(field, parse_value(raw)?);
        } else {
            bail!("Invalid edit '{}'. Use name=value, name+=item or name-=item", edit);
        }
    }
    for field in remove {
        patch = patch.remove(field.as_str());
    }
    Ok(patch)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => format!("{:?}", s),
        Value::List(items) => {
            let items: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Set(items) => {
            let items: Vec<&str> = items.iter().map(String::as_str).collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

fn print_entity(entity: &Entity) {
    println!(
        "{} (version {}, remote {})",
        entity.key, entity.version, entity.remote_version
    );
    for (name, field) in &entity.fields {
        println!(
            "  {} = {}  [{} by {}]",
            name,
            render_value(&field.value),
            field.modified_at,
            field.writer
        );
    }
}

/// Write a config file.
fn cmd_init(data_dir: &Path, collections: Vec<String>, force: bool) -> Result<()> {
    let path = data_dir.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("Config already exists at {} (use --force)", path.display());
    }

    let config = SyncConfig::for_collections(collections).context("Invalid collection name")?;
    config.save(&path).context("Failed to save config")?;

    println!("Config written to {}", path.display());
    for collection in &config.collections {
        println!("  collection: {}", collection);
    }
    Ok(())
}

/// Queue a create or update.
fn cmd_put(data_dir: &Path, collection: &str, id: &str, edits: &[String], remove: &[String]) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let key = EntityKey::parse(collection, id).context("Invalid entity key")?;
    let patch = parse_patch(edits, remove)?;

    let live = engine.get(&key)?.map_or(false, |e| !e.tombstone);
    let op = if live { MutationOp::Update } else { MutationOp::Create };

    let handle = engine
        .submit_mutation(key, op, patch)
        .context("Failed to submit mutation")?;
    info!("Queued {} for {}", handle.mutation_id(), handle.key());

    println!("Queued {} {} as mutation {}", op, handle.key(), handle.mutation_id());
    if let Some(entity) = engine.get(handle.key())? {
        print_entity(&entity);
    }
    Ok(())
}

/// Queue a delete.
fn cmd_delete(data_dir: &Path, collection: &str, id: &str) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let key = EntityKey::parse(collection, id).context("Invalid entity key")?;

    let handle = engine
        .submit_mutation(key, MutationOp::Delete, FieldPatch::new())
        .context("Failed to submit delete")?;

    println!("Queued delete of {} as mutation {}", handle.key(), handle.mutation_id());
    Ok(())
}

/// Show one entity.
fn cmd_get(data_dir: &Path, collection: &str, id: &str) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let key = EntityKey::parse(collection, id).context("Invalid entity key")?;

    match engine.get(&key)? {
        Some(entity) if !entity.tombstone => print_entity(&entity),
        Some(entity) => println!("{} is deleted (version {})", key, entity.version),
        None => println!("{} not found", key),
    }
    Ok(())
}

/// List matching entities.
fn cmd_query(data_dir: &Path, collection: &str, filters: &[String]) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let collection = CollectionName::new(collection).context("Invalid collection name")?;

    let mut predicate = Predicate::All;
    for filter in filters {
        let Some((field, raw)) = filter.split_once('=') else {
            bail!("Invalid filter '{}'. Use field=value", filter);
        };
        predicate = predicate.and(Predicate::eq(field, parse_value(raw)?));
    }

    let entities = engine.query(&collection, &predicate)?;
    if entities.is_empty() {
        println!("No entities.");
    }
    for entity in &entities {
        print_entity(entity);
    }
    Ok(())
}

/// List the outbox.
fn cmd_outbox(data_dir: &Path) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let mutations = engine.outbox().all()?;

    if mutations.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    println!("{} mutations:", mutations.len());
    for m in mutations {
        let fields: Vec<&str> = m.field_patch.fields().map(String::as_str).collect();
        println!(
            "  #{} {} {} [{}] base {} attempts {} ({})",
            m.mutation_id,
            m.op,
            m.key,
            fields.join(", "),
            m.base_version,
            m.attempts,
            m.state
        );
        if let Some(error) = m.last_error {
            println!("      last error: {}", error);
        }
    }
    Ok(())
}

/// Show cursors.
fn cmd_cursors(data_dir: &Path) -> Result<()> {
    let engine = open_engine(data_dir)?;
    let cursors = engine.cursors().all()?;

    if cursors.is_empty() {
        println!("No cursors yet.");
    }
    for cursor in cursors {
        println!(
            "  {}: watermark {}, token {}, updated {}",
            cursor.collection,
            cursor.watermark,
            cursor
                .token
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            cursor.updated_at
        );
    }
    Ok(())
}

/// Withdraw a queued mutation.
fn cmd_cancel(data_dir: &Path, mutation_id: u64) -> Result<()> {
    let engine = open_engine(data_dir)?;
    engine
        .cancel_mutation(MutationId::new(mutation_id))
        .context("Failed to cancel mutation")?;

    println!("Mutation {} cancelled.", mutation_id);
    Ok(())
}

/// Two replicas edit the same entity concurrently and converge.
async fn cmd_demo() -> Result<()> {
    let remote = MemoryRemote::new();
    let config = SyncConfig::for_collections(["players"])?;
    let players = CollectionName::new("players")?;
    let key = EntityKey::parse("players", "p1")?;

    let replica = |name: &str| -> Result<SyncEngine> {
        let db = Database::in_memory()?;
        db.set_meta("replica_id", ReplicaId::new(name)?.as_str())?;
        Ok(SyncEngine::open(
            Arc::new(db),
            Arc::new(remote.clone()),
            config.clone(),
        )?)
    };
    let alice = replica("alice")?;
    let bob = replica("bob")?;

    println!("alice creates {}", key);
    let created = alice.submit_mutation(
        key.clone(),
        MutationOp::Create,
        FieldPatch::new().set("name", "A").set("hp", 10),
    )?;
    alice.drain_once().await?;
    println!("  -> {:?}", created.wait().await?);
    bob.pull_once(&players).await?;

    println!("alice renames, bob heals, both offline");
    let rename = alice.submit_mutation(key.clone(), MutationOp::Update, FieldPatch::new().set("name", "B"))?;
    let heal = bob.submit_mutation(key.clone(), MutationOp::Update, FieldPatch::new().set("hp", 12))?;

    bob.drain_once().await?;
    alice.drain_once().await?;
    println!("  alice: {:?}", rename.wait().await?);
    println!("  bob:   {:?}", heal.wait().await?);

    // A merged rebase is a fresh mutation; drain until both outboxes settle.
    for _ in 0..4 {
        alice.drain_once().await?;
        bob.drain_once().await?;
    }
    alice.pull_once(&players).await?;
    bob.pull_once(&players).await?;

    for (name, engine) in [("alice", &alice), ("bob", &bob)] {
        println!("{}:", name);
        match engine.get(&key)? {
            Some(entity) => print_entity(&entity),
            None => println!("  (missing)"),
        }
    }
    if let Some(doc) = remote.document(&key) {
        println!("remote:");
        print_entity(&doc);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_patch_edits() {
        let patch = parse_patch(
            &[
                "hp=12".to_string(),
                "name=Bob".to_string(),
                "tags+=fast".to_string(),
                "alive=true".to_string(),
            ],
            &["old".to_string()],
        )
        .unwrap();

        assert_eq!(patch.len(), 5);
        assert!(patch.get("tags").unwrap().is_set_edit());
        assert!(parse_patch(&["nonsense".to_string()], &[]).is_err());
    }

    #[test]
    fn test_parse_value_falls_back_to_text() {
        assert_eq!(parse_value("12").unwrap(), Value::Int(12));
        assert_eq!(parse_value("Bob").unwrap(), Value::Text("Bob".to_string()));
        assert_eq!(parse_value("\"12\"").unwrap(), Value::Text("12".to_string()));
        assert!(parse_value("{\"a\": 1}").is_err());
    }

    #[test]
    fn test_offline_put_is_queued_and_persisted() {
        let temp = TempDir::new().unwrap();
        cmd_init(temp.path(), vec!["players".to_string()], false).unwrap();
        assert!(cmd_init(temp.path(), vec!["players".to_string()], false).is_err());

        cmd_put(temp.path(), "players", "p1", &["hp=3".to_string()], &[]).unwrap();
        cmd_put(temp.path(), "players", "p1", &["hp=4".to_string()], &[]).unwrap();

        let engine = open_engine(temp.path()).unwrap();
        let mutations = engine.outbox().all().unwrap();
        assert_eq!(mutations.len(), 2);
        assert_eq!(mutations[0].op, MutationOp::Create);
        assert_eq!(mutations[1].op, MutationOp::Update);

        let key = EntityKey::parse("players", "p1").unwrap();
        assert_eq!(engine.get(&key).unwrap().unwrap().value("hp"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_cancel_reverts_queued_put() {
        let temp = TempDir::new().unwrap();
        cmd_put(temp.path(), "players", "p1", &["hp=3".to_string()], &[]).unwrap();
        let id = {
            let engine = open_engine(temp.path()).unwrap();
            engine.outbox().all().unwrap()[0].mutation_id
        };

        cmd_cancel(temp.path(), id.get()).unwrap();
        let engine = open_engine(temp.path()).unwrap();
        assert!(engine.outbox().is_empty().unwrap());
        let key = EntityKey::parse("players", "p1").unwrap();
        assert!(engine.get(&key).unwrap().map_or(true, |e| e.tombstone));
    }

    #[tokio::test]
    async fn test_demo_runs() {
        cmd_demo().await.unwrap();
    }
}
