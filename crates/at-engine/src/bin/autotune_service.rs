use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use at_engine::{serve, AutoTuneService, EngineSettings, PayloadDelegateFactory};
use at_optimizer::load_predictor;
use at_store::{JobStore, MemoryCatalog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = EngineSettings::from_env().context("invalid AUTOTUNE_* settings")?;
    settings.ensure_dirs()?;

    let store = JobStore::open(&settings.db_path)
        .with_context(|| format!("opening job store {}", settings.db_path.display()))?;
    let catalog = MemoryCatalog::open(&settings.catalog_path)
        .with_context(|| format!("opening catalog {}", settings.catalog_path.display()))?;
    let predictor = load_predictor(&settings.predictor_dir)?;
    let delegates = PayloadDelegateFactory::new(settings.clone());

    let service = AutoTuneService::new(store, Arc::new(catalog), predictor, Arc::new(delegates));
    let interrupted = service.reconcile_stale_jobs()?;
    if interrupted > 0 {
        tracing::warn!(jobs = interrupted, "Failed jobs interrupted by a previous run");
    }

    let listener = TcpListener::bind(&settings.addr).await?;
    tracing::info!(addr = %settings.addr, "AutoTune service listening");
    serve(listener, service).await?;
    Ok(())
}
