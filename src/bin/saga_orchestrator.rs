//! saga-orchestrator: saga orchestration service
//!
//! Loads saga definitions and unfinished executions from the configured
//! store, resumes them, and serves the dashboard API until Ctrl-C.
//!
//! ## Configuration
//! - `--config` / SAGA_CONFIG: YAML configuration file
//! - SAGA_HOST, SAGA_PORT: listen address
//! - SAGA_STORAGE_KIND (`memory` | `lmdb`), SAGA_STORAGE_PATH
//! - SAGA_LOG_FORMAT (`text` | `json`), RUST_LOG: log filter

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saga_orchestration::config::{Config, LogFormat, StorageKind};
use saga_orchestration::http_invoker::HttpInvoker;
use saga_orchestration::{api, InMemoryStore, SagaEngine};

#[derive(Debug, Parser)]
#[command(name = "saga-orchestrator", version, about = "Saga orchestration engine")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    init_tracing(config.logging.format);

    info!(storage = ?config.storage.kind, "Starting saga-orchestrator");

    let invoker = Arc::new(HttpInvoker::new(config.invoker_config())?);
    let options = config.engine_options();
    let engine = match config.storage.kind {
        StorageKind::Memory => SagaEngine::new(Arc::new(InMemoryStore::new()), invoker, options)?,
        #[cfg(feature = "lmdb")]
        StorageKind::Lmdb => {
            let store = saga_orchestration::LmdbStore::open(&config.storage.path, config.storage.map_size_mb)?;
            SagaEngine::new(Arc::new(store), invoker, options)?
        }
        #[cfg(not(feature = "lmdb"))]
        StorageKind::Lmdb => {
            error!("storage.kind is lmdb but the binary was built without the `lmdb` feature");
            return Err("lmdb storage not available".into());
        }
    };

    let recovered = engine.recover()?;
    info!(
        definitions = engine.definitions().len(),
        recovered, "Engine ready"
    );

    let addr = config.listen_addr()?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };
    api::serve(engine, addr, shutdown).await?;

    Ok(())
}
