use anyhow::{Context, Result};
use keg_scale::config::Config;
use keg_scale::http::{self, HttpState};
use keg_scale::ingest::Ingestor;
use keg_scale::scale::{Scale, VenueMonitor};
use keg_scale::store;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,keg_scale=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!("failed to bind keg-scale listener on {addr}: port already in use");
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind keg-scale listener on {addr}"))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let store = store::open_store(&config)
        .with_context(|| format!("failed to open store in {}", config.data_dir.display()))?;
    let scale = Scale::new(&config, store);
    scale.restore_from_store().await;

    let cancel = CancellationToken::new();
    let monitor =
        VenueMonitor::new(scale.clone(), config.recheck_interval).start(cancel.clone());

    let app = http::router(HttpState::new(Ingestor::new(scale), &config.auth_token));
    let listener = bind_listener(&config.http_bind).await?;
    tracing::info!(
        bind=%config.http_bind,
        capacity = config.buffer_size,
        store = ?config.store,
        "keg-scale HTTP listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");

    cancel.cancel();
    if let Err(err) = monitor.await {
        tracing::warn!(error=%err, "venue monitor task failed");
    }
    served
}

#[cfg(test)]
mod tests {
    use super::bind_listener;
    use anyhow::Result;

    #[tokio::test]
    async fn reports_port_in_use() -> Result<()> {
        let held = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = held.local_addr()?.to_string();
        let err = bind_listener(&addr).await.unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");
        Ok(())
    }
}
