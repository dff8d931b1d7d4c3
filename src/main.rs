use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use stevedore::http::{router, AppState};
use stevedore::metadata::{MemoryStore, RegistryStore};
use stevedore::registry::{CleanupScheduler, LogObserver, Registry};
use stevedore::{Config, StorageBackend};

#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .compact()
        .init();

    // load configuration
    let mut config_file = File::open(cli.config_file.unwrap_or("./dev-config.yml".into()))?;
    let mut s = String::new();
    config_file.read_to_string(&mut s)?;
    let config: Config = serde_yaml::from_str(&s)?;

    // initialize the persistence layer
    let (store, volume): (Arc<dyn RegistryStore>, Option<PathBuf>) = match &config.backend {
        StorageBackend::Sqlite(cfg) => {
            let store = cfg.new_store().await?;
            let volume = Some(store.storage_volume().clone());
            tracing::info!("sqlite backend at {}", cfg.path.display());
            (Arc::new(store), volume)
        }
        StorageBackend::Memory => {
            tracing::warn!("in-memory backend selected; contents will not survive a restart");
            (Arc::new(MemoryStore::new()), None)
        }
    };

    let registry = Registry::new(store, config.cleanup.clone());
    registry.subscribe(Arc::new(LogObserver));

    CleanupScheduler::new(registry.clone(), config.cleanup.clone(), volume).spawn();

    let state = AppState {
        registry,
        auth: config.auth.clone(),
    };
    let router = router(state)?;

    tracing::info!("listening on {}", config.listen_address);
    axum::Server::bind(&config.listen_address.parse()?)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
