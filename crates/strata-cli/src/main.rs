use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use strata_core::config::{BackendConfig, PoolConfig, StrataConfig};
use strata_core::model::event::{Bookmark, Channel, EventQuery};
use strata_core::query::fork::ForkRequest;
use strata_core::query::snapshot::SnapshotRequest;
use strata_core::storage::duckdb::DuckDbStorage;
use strata_core::storage::file::FileStore;
use strata_core::storage::hybrid::HybridStore;
use strata_core::storage::{AgentFilter, Page, QueryBackend, Sort, StorageBackend};
use strata_core::StrataEngine;

#[derive(Parser)]
#[command(name = "strata", about = "Inspect and administer Strata agent stores")]
struct Cli {
    /// Storage medium
    #[arg(long, value_enum, default_value = "duckdb", env = "STRATA_BACKEND")]
    backend: Backend,

    /// Path to the DuckDB database file
    #[arg(long, default_value = "strata.db", env = "STRATA_DB_PATH")]
    db_path: PathBuf,

    /// Root directory of the file store (also holds timelines for the hybrid backend)
    #[arg(long, default_value = "strata-data", env = "STRATA_ROOT")]
    root: PathBuf,

    /// PostgreSQL connection URL; for the hybrid backend it replaces DuckDB as the structured store
    #[arg(long, env = "STRATA_POSTGRES_URL")]
    postgres_url: Option<String>,

    /// Maximum pooled PostgreSQL connections
    #[arg(long, default_value = "10", env = "STRATA_MAX_CONNECTIONS")]
    max_connections: u32,

    /// How long to wait for an agent lock, in milliseconds
    #[arg(long, default_value = "30000", env = "STRATA_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    File,
    Duckdb,
    Postgres,
    Hybrid,
}

#[derive(Subcommand)]
enum Command {
    /// List agents, newest first
    List {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        template: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show an agent's info record
    Info { agent_id: String },
    /// Aggregate counts for an agent
    Stats { agent_id: String },
    /// Verify an agent's stored state without repairing it
    Check { agent_id: String },
    /// Snapshot an agent at its latest safe fork point
    Snapshot {
        agent_id: String,
        #[arg(long)]
        id: Option<String>,
    },
    /// Fork an agent from one of its snapshots
    Fork {
        agent_id: String,
        snapshot_id: String,
        #[arg(long)]
        new_agent_id: Option<String>,
    },
    /// Print timeline events after a sequence number
    Events {
        agent_id: String,
        #[arg(long, default_value = "0")]
        since: i64,
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Delete an agent and everything it owns
    Delete { agent_id: String },
    /// Probe the backend and print operation metrics
    Health,
}

impl Cli {
    fn config(&self) -> Result<StrataConfig, Box<dyn std::error::Error>> {
        let structured = match &self.postgres_url {
            Some(url) => BackendConfig::Postgres { url: url.clone() },
            None => BackendConfig::DuckDb {
                path: Some(self.db_path.clone()),
            },
        };
        let backend = match self.backend {
            Backend::File => BackendConfig::File {
                root: self.root.clone(),
            },
            Backend::Duckdb => BackendConfig::DuckDb {
                path: Some(self.db_path.clone()),
            },
            Backend::Postgres => match structured {
                BackendConfig::Postgres { .. } => structured,
                _ => return Err("--postgres-url (or STRATA_POSTGRES_URL) is required for the postgres backend".into()),
            },
            Backend::Hybrid => BackendConfig::Hybrid {
                root: self.root.clone(),
                structured: Box::new(structured),
            },
        };
        Ok(StrataConfig {
            backend,
            pool: PoolConfig {
                max_connections: self.max_connections,
                ..PoolConfig::default()
            },
            lock_timeout_ms: self.lock_timeout_ms,
            ..StrataConfig::default()
        })
    }
}

async fn open_store(
    backend: &BackendConfig,
    pool: &PoolConfig,
) -> Result<Arc<dyn QueryBackend>, Box<dyn std::error::Error>> {
    let store: Arc<dyn QueryBackend> = match backend {
        BackendConfig::File { root } => {
            let store = FileStore::new(root);
            store.init().await?;
            tracing::info!(root = ?root, "using file store");
            Arc::new(store)
        }
        BackendConfig::DuckDb { path } => {
            let store = match path {
                Some(path) => DuckDbStorage::open(path)?,
                None => DuckDbStorage::open_in_memory()?,
            };
            tracing::info!(path = ?path, "using duckdb store");
            Arc::new(store)
        }
        BackendConfig::Postgres { url: _url } => {
            #[cfg(feature = "postgres")]
            {
                let store = strata_postgres::PgStorage::connect(_url, pool).await?;
                tracing::info!("using postgres store");
                Arc::new(store)
            }
            #[cfg(not(feature = "postgres"))]
            {
                let _ = pool;
                return Err("PostgreSQL support not enabled. Rebuild with --features postgres".into());
            }
        }
        BackendConfig::Hybrid { root, structured } => {
            let structured = Box::pin(open_store(structured, pool)).await?;
            let store = HybridStore::new(structured, root);
            store.init().await?;
            tracing::info!(root = ?root, "using hybrid store");
            Arc::new(store)
        }
    };
    Ok(store)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("strata=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    let store = open_store(&config.backend, &config.pool).await?;
    let engine = StrataEngine::with_query_backend(store.clone()).with_config(&config);

    let outcome = run(&engine, store.as_ref(), cli.command).await;
    if let Err(e) = store.close().await {
        tracing::warn!(error = %e, "closing store failed");
    }
    outcome
}

async fn run(
    engine: &StrataEngine,
    store: &dyn QueryBackend,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::List {
            prefix,
            template,
            limit,
            offset,
        } => {
            let filter = AgentFilter {
                agent_id_prefix: prefix,
                template_id: template,
                ..Default::default()
            };
            let agents = store
                .query_agents(&filter, &Page::new(limit, offset), &Sort::default())
                .await?;
            print_json(&agents)
        }
        Command::Info { agent_id } => match store.load_info(&agent_id).await? {
            Some(info) => print_json(&info),
            None => Err(format!("agent {agent_id} not found").into()),
        },
        Command::Stats { agent_id } => print_json(&engine.stats(&agent_id).await?),
        Command::Check { agent_id } => {
            let report = engine.check_consistency(&agent_id).await?;
            print_json(&report)?;
            if report.is_consistent() {
                Ok(())
            } else {
                Err(format!("{} consistency violation(s) found", report.violations.len()).into())
            }
        }
        Command::Snapshot { agent_id, id } => {
            let mut request = SnapshotRequest::new(agent_id);
            if let Some(id) = id {
                request = request.with_id(id);
            }
            print_json(&engine.snapshot(request).await?)
        }
        Command::Fork {
            agent_id,
            snapshot_id,
            new_agent_id,
        } => {
            let mut request = ForkRequest::new(agent_id, snapshot_id);
            if let Some(new_agent_id) = new_agent_id {
                request = request.with_new_agent_id(new_agent_id);
            }
            print_json(&engine.fork(request).await?)
        }
        Command::Events {
            agent_id,
            since,
            channels,
            limit,
        } => {
            let channels = if channels.is_empty() {
                None
            } else {
                Some(
                    channels
                        .iter()
                        .map(|c| c.parse::<Channel>())
                        .collect::<Result<Vec<_>, _>>()?,
                )
            };
            let query = EventQuery {
                since: Some(Bookmark {
                    seq: since,
                    timestamp: String::new(),
                }),
                channels,
                limit,
            };
            print_json(&store.read_events(&agent_id, &query).await?)
        }
        Command::Delete { agent_id } => {
            engine.delete_agent(&agent_id).await?;
            tracing::info!(agent_id = %agent_id, "agent deleted");
            Ok(())
        }
        Command::Health => {
            let health = engine.health().await;
            print_json(&serde_json::json!({
                "health": health,
                "metrics": engine.metrics().await?,
            }))
        }
    }
}
