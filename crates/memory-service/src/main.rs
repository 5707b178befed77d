use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use memory_service::config::{CollaboratorConfig, Config, StorageConfig};
use memory_service::{bootstrap, build_router, spawn_health_prober, spawn_outbox_worker, wait_for_startup_health};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CollaboratorMode {
    Mock,
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "memory-serviced", version, about = "Hosted memory vault/search service")]
struct Cli {
    /// Socket address to bind the HTTP API to.
    #[arg(long, default_value = "127.0.0.1:8089", env = "MEMORY_LISTEN_ADDR")]
    listen: SocketAddr,
    /// Storage backend. `auto` picks postgres when DATABASE_URL is set.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "MEMORY_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for vault/memory/entry/context/outbox persistence.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 10, env = "MEMORY_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Hybrid search index backend.
    #[arg(long, value_enum, default_value_t = CollaboratorMode::Mock, env = "MEMORY_SEARCH_INDEX")]
    search_index: CollaboratorMode,
    /// Base url of the external hybrid search index, required when --search-index=http.
    #[arg(long, env = "MEMORY_SEARCH_INDEX_URL")]
    search_index_url: Option<String>,
    /// Embedding provider backend.
    #[arg(long, value_enum, default_value_t = CollaboratorMode::Mock, env = "MEMORY_EMBEDDER")]
    embedder: CollaboratorMode,
    /// Base url of the external embedding provider, required when --embedder=http.
    #[arg(long, env = "MEMORY_EMBEDDER_URL")]
    embedder_url: Option<String>,
    /// Disable the outbox worker, leaving rows pending for a separate process.
    #[arg(long, default_value_t = false)]
    no_outbox_worker: bool,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let database_url = cli.database_url.clone();
    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = database_url
                .ok_or_else(|| anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL"))?;
            StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            }
        }
        StorageMode::Auto => match database_url {
            Some(database_url) => StorageConfig::Postgres {
                database_url,
                max_connections: cli.pg_max_connections,
            },
            None => StorageConfig::Memory,
        },
    };
    Ok(storage)
}

fn resolve_collaborator(
    mode: CollaboratorMode,
    base_url: Option<String>,
    flag_name: &str,
) -> anyhow::Result<CollaboratorConfig> {
    match mode {
        CollaboratorMode::Mock => Ok(CollaboratorConfig::Mock),
        CollaboratorMode::Http => {
            let base_url = base_url
                .ok_or_else(|| anyhow::anyhow!("{flag_name}=http requires the matching --*-url flag"))?;
            Ok(CollaboratorConfig::Http { base_url })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "memory_service=info,info".to_string()))
        .init();

    let cli = Cli::parse();

    let mut config = Config::default();
    config.server.listen_addr = cli.listen;
    config.server.enable_outbox_worker = !cli.no_outbox_worker;
    config.storage = resolve_storage(&cli)?;
    config.search_index = resolve_collaborator(cli.search_index, cli.search_index_url.clone(), "--search-index")?;
    config.embedder = resolve_collaborator(cli.embedder, cli.embedder_url.clone(), "--embedder")?;

    let state = bootstrap(&config).await?;

    spawn_health_prober(state.clone(), config.health.probe_interval());

    let _outbox_worker = if config.server.enable_outbox_worker {
        let (worker, handle) = spawn_outbox_worker(&state, config.outbox_worker.clone());
        Some((worker, handle))
    } else {
        info!("outbox worker disabled by configuration");
        None
    };

    if !wait_for_startup_health(&state, config.health.probe_interval(), config.health.startup_deadline()).await {
        anyhow::bail!("dependencies did not become healthy before the startup deadline");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!("memory-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
