use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging.
///
/// `RUST_LOG` wins when set; otherwise the `LOGLEVEL` configuration value
/// seeds the default filter, with chatty dependencies capped at warn.
pub fn init_tracing(loglevel: &str) {
    let default_filter = format!(
        "{},hyper=warn,reqwest=warn,sqlx=warn",
        loglevel.to_lowercase()
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Resolve when SIGINT or SIGTERM arrives.
///
/// Controller shutdown is deliberately not graceful beyond this point:
/// the limiter leaves devices in their last commanded state and the next
/// planning cycle of a fresh process overwrites them.
pub async fn shutdown_signal() {
    let interrupt = async {
        signal::ctrl_c().await.expect("SIGINT handler");
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler")
            .recv()
            .await;
        "SIGTERM"
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let received = tokio::select! {
        s = interrupt => s,
        s = terminate => s,
    };
    info!(
        signal = received,
        "shutdown requested, devices keep their last commanded setpoints"
    );
}
