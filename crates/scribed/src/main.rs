//! Scribe daemon (scribed)
//!
//! Runs the document service with its background worker pool, or performs a
//! single administrative operation against the configured store.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store and cache, metrics on :9090
//! scribed serve
//!
//! # SQLite persistence with a Redis cache
//! scribed --db /var/lib/scribe/scribe.db --redis-url redis://127.0.0.1:6379 serve
//!
//! # With configuration file
//! scribed --config /etc/scribe/scribe.toml serve
//!
//! # Admin operations
//! scribed --db scribe.db create --owner 1 "Meeting notes"
//! scribed --db scribe.db append --doc 1 --author 1 "fragment"
//! scribed --db scribe.db state --doc 1
//! scribed --db scribe.db compact --doc 1
//! ```

mod config;
mod metrics;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scribe_cache::{KvStore, MemoryKv};
use scribe_core::{DocumentId, UserId};
use scribe_service::DocumentService;
use scribe_storage::{DocumentStore, MemoryStore};
use scribe_sync::{HttpSyncClient, SyncClient};
use scribe_worker::WorkerPool;

use config::{CacheBackend, CacheSection, FileConfig, StorageBackend, StorageSection};
use metrics::{Metrics, MetricsServer};

/// Scribe daemon - document persistence for collaborative editing
#[derive(Parser, Debug)]
#[command(name = "scribed")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "SCRIBE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "SCRIBE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Storage backend
    #[arg(long, env = "SCRIBE_STORAGE", value_enum)]
    storage: Option<StorageBackend>,

    /// SQLite database path (implies --storage sqlite)
    #[arg(long, env = "SCRIBE_DB")]
    db: Option<PathBuf>,

    /// Postgres connection string (implies --storage postgres)
    #[arg(long, env = "SCRIBE_DATABASE_URL", conflicts_with = "db")]
    database_url: Option<String>,

    /// Redis URL for locks and listing caches (default: in-process cache)
    #[arg(long, env = "SCRIBE_REDIS_URL")]
    redis_url: Option<String>,

    /// Base URL of the sync service
    #[arg(long, env = "SCRIBE_SYNC_URL")]
    sync_url: Option<String>,

    /// Shared secret sent to the sync service
    #[arg(long, env = "SCRIBE_SYNC_SECRET", hide_env_values = true)]
    sync_secret: Option<String>,

    /// Number of background workers
    #[arg(long, env = "SCRIBE_WORKERS")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Run the service until interrupted (default)
    Serve {
        /// Metrics endpoint address
        #[arg(long, env = "SCRIBE_METRICS_ADDR", default_value = "0.0.0.0:9090")]
        metrics_addr: SocketAddr,

        /// Disable the metrics endpoint
        #[arg(long)]
        no_metrics: bool,
    },
    /// Create a document
    Create {
        #[arg(long)]
        owner: u64,
        title: String,
    },
    /// Append an update fragment to a document
    Append {
        #[arg(long)]
        doc: u64,
        #[arg(long)]
        author: u64,
        payload: String,
    },
    /// Print the materialized state of a document
    State {
        #[arg(long)]
        doc: u64,
    },
    /// Compact a document now if it is due
    Compact {
        #[arg(long)]
        doc: u64,
    },
}

impl Default for Command {
    fn default() -> Self {
        Command::Serve {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            no_metrics: false,
        }
    }
}

/// Merge the optional config file with command-line overrides
fn resolve_config(args: &Args) -> Result<FileConfig> {
    let mut config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    if let Some(backend) = args.storage {
        config.storage.backend = backend;
    }
    if let Some(path) = &args.db {
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.path = path.clone();
    }
    if let Some(url) = &args.database_url {
        config.storage.backend = StorageBackend::Postgres;
        config.storage.url = Some(url.clone());
    }
    if let Some(url) = &args.redis_url {
        config.cache.backend = CacheBackend::Redis;
        config.cache.url = url.clone();
    }
    if let Some(url) = &args.sync_url {
        config.sync.base_url = url.clone();
    }
    if let Some(secret) = &args.sync_secret {
        config.sync.secret = secret.clone();
    }
    if let Some(workers) = args.workers {
        config.worker.workers = workers;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = resolve_config(&args)?;
    let command = args.command.clone().unwrap_or_default();

    let store = open_store(&config.storage).await?;
    let (kv, memory_kv) = open_cache(&config.cache).await?;
    let sync: Arc<dyn SyncClient> = Arc::new(
        HttpSyncClient::new(config.sync.to_sync_config()).context("building sync client")?,
    );
    let pool = Arc::new(WorkerPool::new(config.worker.to_pool_config()));
    let service = Arc::new(
        DocumentService::new(store, kv, sync, pool.clone(), config.service.clone())
            .context("invalid service configuration")?,
    );

    let result = match command {
        Command::Serve {
            metrics_addr,
            no_metrics,
        } => {
            print_banner();
            serve(
                service.clone(),
                pool.clone(),
                memory_kv,
                (!no_metrics).then_some(metrics_addr),
            )
            .await
        }
        admin => run_admin(&service, admin).await,
    };

    // Queued follow-up work runs to completion before exit
    pool.shutdown().await;
    let stats = pool.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        dropped = stats.dropped,
        "Worker pool drained"
    );

    result
}

async fn serve(
    service: Arc<DocumentService>,
    pool: Arc<WorkerPool>,
    memory_kv: Option<Arc<MemoryKv>>,
    metrics_addr: Option<SocketAddr>,
) -> Result<()> {
    let mut handles = Vec::new();

    if let Some(addr) = metrics_addr {
        let metrics = Metrics::new().context("registering metrics")?;
        let server = MetricsServer::bind(addr, metrics, pool.clone(), service.clone())
            .await
            .with_context(|| format!("binding metrics endpoint {addr}"))?;
        handles.push(tokio::spawn(server.run()));
    }

    // The in-process cache has no expiry thread of its own
    if let Some(kv) = memory_kv {
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let removed = kv.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "Purged expired cache entries");
                }
            }
        }));
    }

    let service_config = service.config();
    info!(
        compaction_threshold = service_config.compaction_threshold,
        metrics = metrics_addr.is_some(),
        "Scribe daemon running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_admin(service: &DocumentService, command: Command) -> Result<()> {
    let output = match command {
        Command::Create { owner, title } => {
            let document = service.create_document(UserId(owner), &title).await?;
            serde_json::to_value(&document)?
        }
        Command::Append {
            doc,
            author,
            payload,
        } => {
            let seq = service
                .append_update(DocumentId(doc), UserId(author), payload.as_bytes())
                .await?;
            json!({ "document_id": doc, "seq": seq })
        }
        Command::State { doc } => {
            let state = service.document_state(DocumentId(doc)).await?;
            json!({
                "document_id": doc,
                "snapshot_seq": state.snapshot_seq,
                "snapshot_bytes": state.snapshot.as_ref().map_or(0, Vec::len),
                "updates": state.updates.len(),
                "head_seq": state.head_seq(),
            })
        }
        Command::Compact { doc } => {
            let outcome = service.compact_now(DocumentId(doc)).await?;
            json!({ "document_id": doc, "outcome": format!("{outcome:?}") })
        }
        Command::Serve { .. } => anyhow::bail!("serve is not an admin command"),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn open_store(section: &StorageSection) -> Result<Arc<dyn DocumentStore>> {
    match section.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage (nothing is persisted)");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => open_sqlite(section),
        StorageBackend::Postgres => open_postgres(section).await,
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(section: &StorageSection) -> Result<Arc<dyn DocumentStore>> {
    info!(path = %section.path.display(), "Opening SQLite storage");
    let store = scribe_storage::SqliteStore::new(&section.path)
        .with_context(|| format!("opening {}", section.path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_section: &StorageSection) -> Result<Arc<dyn DocumentStore>> {
    anyhow::bail!("scribed was built without the `sqlite` feature")
}

#[cfg(feature = "postgres")]
async fn open_postgres(section: &StorageSection) -> Result<Arc<dyn DocumentStore>> {
    let url = section
        .url
        .as_deref()
        .context("postgres storage needs [storage] url or --database-url")?;
    info!(max_connections = section.max_connections, "Connecting to Postgres");
    let store = scribe_storage::PostgresStore::new(url, section.max_connections)
        .await
        .context("connecting to Postgres")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_section: &StorageSection) -> Result<Arc<dyn DocumentStore>> {
    anyhow::bail!("scribed was built without the `postgres` feature")
}

/// The shared cache, plus a handle to it when it lives in this process
async fn open_cache(section: &CacheSection) -> Result<(Arc<dyn KvStore>, Option<Arc<MemoryKv>>)> {
    match section.backend {
        CacheBackend::Memory => {
            warn!("Using in-process cache; locks are not shared with other instances");
            let kv = Arc::new(MemoryKv::new());
            let shared: Arc<dyn KvStore> = kv.clone();
            Ok((shared, Some(kv)))
        }
        CacheBackend::Redis => Ok((open_redis(section).await?, None)),
    }
}

#[cfg(feature = "redis")]
async fn open_redis(section: &CacheSection) -> Result<Arc<dyn KvStore>> {
    info!(url = %section.url, "Connecting to Redis");
    let kv = scribe_cache::RedisKv::connect(&section.url, section.op_timeout())
        .await
        .context("connecting to Redis")?;
    Ok(Arc::new(kv))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_section: &CacheSection) -> Result<Arc<dyn KvStore>> {
    anyhow::bail!("scribed was built without the `redis` feature")
}

fn print_banner() {
    eprintln!(
        r#"
  ╔═╗╔═╗╦═╗╦╔╗ ╔═╗
  ╚═╗║  ╠╦╝║╠╩╗║╣
  ╚═╝╚═╝╩╚═╩╚═╝╚═╝
  Collaborative document persistence
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let args = Args::try_parse_from(["scribed"]).unwrap();
        assert_eq!(args.command, None);
        assert!(matches!(
            args.command.unwrap_or_default(),
            Command::Serve { no_metrics: false, .. }
        ));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"[storage]\nbackend = \"memory\"\n[worker]\nworkers = 2\n[sync]\nsecret = \"from-file\"\n",
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::try_parse_from([
            "scribed",
            "--config",
            &path,
            "--db",
            "/tmp/scribe.db",
            "--redis-url",
            "redis://cache:6379",
            "--workers",
            "6",
            "state",
            "--doc",
            "3",
        ])
        .unwrap();
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.path, PathBuf::from("/tmp/scribe.db"));
        assert_eq!(config.cache.backend, CacheBackend::Redis);
        assert_eq!(config.cache.url, "redis://cache:6379");
        assert_eq!(config.worker.workers, 6);
        assert_eq!(config.sync.secret, "from-file");
        assert_eq!(args.command, Some(Command::State { doc: 3 }));
    }

    #[test]
    fn test_db_and_database_url_conflict() {
        assert!(Args::try_parse_from([
            "scribed",
            "--db",
            "a.db",
            "--database-url",
            "postgres://localhost/scribe",
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_admin_commands_against_memory_store() {
        let (kv, _) = open_cache(&CacheSection::default()).await.unwrap();
        let store = open_store(&StorageSection::default()).await.unwrap();
        let sync: Arc<dyn SyncClient> =
            Arc::new(HttpSyncClient::new(Default::default()).unwrap());
        let pool = Arc::new(WorkerPool::new(Default::default()));
        let service =
            DocumentService::new(store, kv, sync, pool.clone(), Default::default()).unwrap();

        run_admin(
            &service,
            Command::Create {
                owner: 1,
                title: "notes".into(),
            },
        )
        .await
        .unwrap();
        run_admin(
            &service,
            Command::Append {
                doc: 1,
                author: 1,
                payload: "hello".into(),
            },
        )
        .await
        .unwrap();
        run_admin(&service, Command::State { doc: 1 }).await.unwrap();
        run_admin(&service, Command::Compact { doc: 1 }).await.unwrap();

        assert!(run_admin(
            &service,
            Command::Append {
                doc: 1,
                author: 2,
                payload: "nope".into(),
            },
        )
        .await
        .is_err());

        let state = service.document_state(DocumentId(1)).await.unwrap();
        assert_eq!(state.head_seq(), 1);

        pool.shutdown().await;
    }
}
