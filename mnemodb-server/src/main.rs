mod config;
mod logging;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use config::ServerConfig;
use mnemodb_core::{MaintenanceScheduler, MemoryConfig, MemoryStore, StaticMetrics};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = ServerConfig::from_env();
    let memory_config = MemoryConfig::from_env();
    info!("Starting MnemoDB with config: {:?}", config);

    let store = MemoryStore::new(memory_config)?;
    let data_dir = Path::new(&config.data_dir).to_path_buf();
    if data_dir.join(mnemodb_core::storage::METADATA_FILE).exists() {
        if let Err(e) = store.load(&data_dir) {
            warn!(error = %e, "Some categories could not be restored");
        }
    }
    for (name, dimension) in &config.categories {
        if store.categories().contains(name) {
            continue;
        }
        store.create_category(name, *dimension)?;
    }
    info!(categories = ?store.categories(), "Store ready");

    let sweeper = store.spawn_cache_sweeper();
    let scheduler = MaintenanceScheduler::new(store.clone(), Arc::new(StaticMetrics::default()));
    scheduler.start()?;

    let saver = (config.save_interval_ms > 0).then(|| {
        let store = store.clone();
        let dir = data_dir.clone();
        let period = Duration::from_millis(config.save_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (store, dir) = (store.clone(), dir.clone());
                match tokio::task::spawn_blocking(move || store.save(&dir)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Periodic save incomplete"),
                    Err(e) => error!(error = %e, "Periodic save task failed"),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    if let Some(saver) = saver {
        saver.abort();
    }
    scheduler.stop().await?;
    sweeper.stop().await;
    store.shutdown();

    let final_store = store.clone();
    let dir = data_dir.clone();
    tokio::task::spawn_blocking(move || final_store.save(&dir)).await??;
    info!(dir = %data_dir.display(), "Store saved, bye");
    Ok(())
}
