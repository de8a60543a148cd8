use anyhow::Result;
use hem_controller::bus::RedisBus;
use hem_controller::config::AppConfig;
use hem_controller::core_api::HttpCoreApi;
use hem_controller::dispatcher::Dispatcher;
use hem_controller::repo::{LogResultsSink, PgResultsSink, ResultsSink};
use hem_controller::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(2);
        }
    };
    telemetry::init_tracing(&cfg.loglevel);
    info!(core_api = %cfg.core_api_url, "starting home energy management controller");

    let api = Arc::new(HttpCoreApi::new(&cfg.core_api_url, cfg.http_timeout()));
    let sink: Arc<dyn ResultsSink> = match &cfg.tsdb_url {
        Some(url) => Arc::new(PgResultsSink::connect(url).await?),
        None => {
            warn!("no TSDB configured, planner results will only be logged");
            Arc::new(LogResultsSink)
        }
    };
    let bus = RedisBus::connect(&cfg.bus_url)?;
    let dispatcher = Arc::new(Dispatcher::new(
        api,
        sink,
        Arc::new(bus.clone()),
        Arc::new(bus.clone()),
        cfg.clone(),
    ));

    // The subscription reconnects on transient bus failures with a short
    // backoff; only the shutdown signal ends the process cleanly.
    let subscription = {
        let bus = bus.clone();
        let dispatcher = dispatcher.clone();
        async move {
            loop {
                if let Err(e) = bus.run(dispatcher.clone()).await {
                    error!(kind = e.kind(), error = %e, "bus subscription failed, reconnecting");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    };

    tokio::select! {
        _ = subscription => {}
        _ = telemetry::shutdown_signal() => {}
    }
    info!("shutdown complete");
    Ok(())
}
