use std::sync::Arc;

use hive_control::config::ControlConfig;
use hive_control::state::AppState;
use sea_orm_migration::MigratorTrait;
use tokio::sync::watch;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = ControlConfig::from_env()?;
    tokio::fs::create_dir_all(&cfg.data_root).await?;

    let db = hive_db::connect(&cfg.database_url).await?;
    // Apply migrations on boot (idempotent).
    hive_migration::Migrator::up(&db, None).await?;

    let listen_addr = cfg.listen_addr;
    let (state, crash_rx) = AppState::new(cfg, Arc::new(db))?;

    let auto_start = state.registry.reconcile_on_boot().await?;
    tracing::info!(
        count = auto_start.len(),
        port_range = ?state.registry.ports().range(),
        "registry reconciled"
    );
    for inst in auto_start {
        let sup = state.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = sup.start(inst.id).await {
                tracing::warn!(instance_id = %inst.id, error = %e, "auto-start on boot failed");
            }
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let monitor = state.monitor.clone().spawn(crash_rx, stop_rx);
    let supervisor = state.supervisor.clone();

    let app = hive_control::app(state);
    tracing::info!(addr = %listen_addr, "hive-control HTTP listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "health monitor task ended abnormally");
    }
    supervisor.shutdown().await;
    tracing::info!("hive-control stopped");
    Ok(())
}
