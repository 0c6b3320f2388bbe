use std::sync::Arc;

use cwatcher::app::App;
use cwatcher::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::load_from_env().unwrap_or_else(|e| {
        eprintln!("failed to load config: {e}");
        std::process::exit(1);
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())))
        .init();

    let app = match App::build(config) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            tracing::error!(error = %e, "failed to build application");
            std::process::exit(1);
        }
    };

    app.register_default_tasks();

    let broadcast_handle = tokio::spawn(app.hub.clone().run_broadcast_loop());

    let push_handle = tokio::spawn(app.push.clone().run(app.shutdown_signal()));
    let scheduler_handle = tokio::spawn(
        app.scheduler
            .clone()
            .run_forever(app.config.push.tick_s.max(1), app.shutdown_signal()),
    );
    let coordinator_handle = {
        let app_for_signals = app.clone();
        tokio::spawn(app.coordinator.clone().run_forever(
            move || cwatcher::coordinator::LoadSignals {
                buffer_fill_ratio: app_for_signals.batch.pending() as f64 / app_for_signals.config.batch.size.max(1) as f64,
                connection_count: app_for_signals.hub.connection_count(),
                pending_tasks: 0,
                max_consecutive_task_failures: 0,
            },
            app.shutdown_signal(),
        ))
    };

    let heartbeat_hub = app.hub.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            heartbeat_hub.run_heartbeat_tick();
        }
    });

    tracing::info!("cwatcher started");
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    // Ordering matters: stop producing new work (scheduler, then push)
    // before flushing buffered rows and tearing down the hub/pools.
    let _ = app.shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    let _ = push_handle.await;
    let _ = coordinator_handle.await;
    heartbeat_handle.abort();

    app.batch.flush();
    app.hub.shutdown();
    let _ = broadcast_handle.await;

    tracing::info!("cwatcher stopped");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
