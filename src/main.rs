use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const CONFIG_FILE: &str = "config.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let basic = Arc::new(meridian::config::BasicConfig::from_env());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(basic.log_level.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false)
                .with_ansi(!basic.raw_log_output),
        )
        .init();

    let store = Arc::new(meridian::config::ConfigStore::load(CONFIG_FILE)?);
    let scheduler = Arc::new(meridian::ChannelScheduler::new(Arc::clone(&store), &basic));
    scheduler.spawn_cooldown_sweeper();
    {
        let scheduler = Arc::clone(&scheduler);
        store.spawn_reload_watcher(Arc::new(move |diff| scheduler.apply_swap_diff(&diff)));
    }

    let engine = Arc::new(meridian::proxy::ProxyEngine::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::clone(&basic),
    ));
    let state = meridian::server::router::AppState::new(engine);
    let app = meridian::server::router::app_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], basic.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
