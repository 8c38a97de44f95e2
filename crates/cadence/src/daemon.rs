//! The long-running scheduler process.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::{error, info};

use cadence_scheduler::{Beat, BeatConfig, Context, Settings};
use cadence_web::create_router;

/// Beat timing from settings, with command-line overrides applied.
fn beat_config(
    settings: &Settings,
    tick_interval: Option<u64>,
    refresh_interval: Option<u64>,
) -> Result<BeatConfig> {
    let mut config = BeatConfig::from(&settings.beat);
    if let Some(secs) = tick_interval {
        if secs == 0 {
            return Err(miette::miette!("--tick-interval must be positive"));
        }
        config.tick_interval = Duration::from_secs(secs);
    }
    if let Some(mins) = refresh_interval {
        config.refresh_interval = Duration::from_secs(mins.saturating_mul(60));
    }
    Ok(config)
}

/// Run the beat loop and the web endpoints until ctrl-c.
pub async fn run(
    settings_path: &Path,
    port: u16,
    tick_interval: Option<u64>,
    refresh_interval: Option<u64>,
) -> Result<()> {
    info!(settings = %settings_path.display(), "starting Cadence daemon");

    let settings = Settings::load(settings_path)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let config = beat_config(&settings, tick_interval, refresh_interval)?;
    let context =
        Arc::new(Context::from_settings(&settings).map_err(|e| miette::miette!("{}", e))?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!("event stream listening on http://0.0.0.0:{}/events", port);

    let router = create_router(Arc::clone(&context));
    let mut web_shutdown = shutdown_rx.clone();
    let web_handle = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while web_shutdown.changed().await.is_ok() {
                    if *web_shutdown.borrow() {
                        break;
                    }
                }
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "web server failed");
        }
    });

    let beat = Beat::new(context, config);
    let beat_result = beat.run(shutdown_rx).await;

    // stop the web server if the beat exited on its own
    let _ = shutdown_tx.send(true);
    let _ = web_handle.await;

    beat_result.map_err(|e| miette::miette!("{}", e))?;
    info!("Cadence daemon stopped");
    Ok(())
}
