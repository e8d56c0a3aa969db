use std::sync::Arc;

use anyhow::Context;
use bg_classifier::server::{self, ServerOptions};
use bg_classifier::{BackgroundClassifier, ImageFetcher, ModelStore, ServiceConfig};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    install_panic_hook();

    let config = ServiceConfig::parse();
    let api_token = config.validate().context("Invalid configuration")?.to_string();

    info!("Loading model from {}...", config.model_path.display());
    let store = ModelStore::global();
    store
        .load(&config.model_path, &config.load_options())
        .context("Failed to load model")?;
    info!("Model loaded successfully");

    let classifier = BackgroundClassifier::builder()
        .with_store(store)
        .with_policy(config.decision_policy())
        .with_reclaim_every(config.reclaim_every)
        .build()?;
    let classifier = Arc::new(classifier);
    let reclaim_task = classifier.reclaimer().spawn_periodic(config.reclaim_interval());

    let fetcher = ImageFetcher::new(config.fetch_timeout(), config.max_image_bytes)?;
    let app = server::router(
        classifier,
        fetcher,
        ServerOptions {
            api_token,
            public_base64: config.public_base64,
        },
    );

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Background classifier service listening on {}", addr);
    info!("Health check: http://localhost:{}/health", config.port);
    info!("Predict endpoint: POST http://localhost:{}/predict", config.port);

    server::serve(listener, app, shutdown_signal()).await?;
    reclaim_task.abort();
    info!("Server stopped");
    Ok(())
}

/// Logs panics before the process goes down.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Unrecoverable fault: {}", panic_info);
        default_hook(panic_info);
        std::process::abort();
    }));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
