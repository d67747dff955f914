use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use api::{PositionReport, WorkerId, DELIVERY_CAPABILITY};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, EnvFilter};

use fleet_sim::config::Config;
use fleet_sim::dispatch::{Coordinator, CoordinatorConfig};
use fleet_sim::metrics::Metrics;
use fleet_sim::net::LocalDirectory;
use fleet_sim::store::FleetStateStore;
use fleet_sim::worker::{WorkerConfig, WorkerUnit};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(config = ?config, "Loaded configuration");

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(FleetStateStore::new());
    let directory = Arc::new(LocalDirectory::new());

    let mut seeder = match config.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    // The coordinator's inbox carries delivery confirmations from the fleet.
    let (owner_tx, owner_rx) = mpsc::unbounded_channel();

    // Spawn the worker fleet and register every unit in the directory.
    let step_interval = Duration::from_millis(config.step_interval_ms);
    let mut worker_handles = Vec::with_capacity(config.num_workers as usize);
    for i in 0..config.num_workers {
        let mut rng = StdRng::seed_from_u64(seeder.gen());
        let start = citygrid::random_intersection(&mut rng);
        let worker_config = WorkerConfig {
            id: WorkerId(u64::from(i) + 1),
            start,
            step_interval,
        };
        let (handle, join) = WorkerUnit::spawn(
            worker_config,
            owner_tx.clone(),
            store.clone(),
            metrics.clone(),
            rng,
            shutdown_rx.clone(),
        );
        directory.register(DELIVERY_CAPABILITY, handle);
        worker_handles.push(join);
    }
    drop(owner_tx);
    metrics.workers_active.set(i64::from(config.num_workers));

    // Spawn the dispatch coordinator.
    let coordinator_handle = {
        let coordinator = Coordinator::new(
            CoordinatorConfig {
                task_period: Duration::from_millis(config.task_period_ms),
                auction_window: Duration::from_millis(config.auction_window_ms),
            },
            directory.clone(),
            store.clone(),
            metrics.clone(),
            StdRng::seed_from_u64(seeder.gen()),
        );
        tokio::spawn(coordinator.run(owner_rx, shutdown_rx.clone()))
    };

    // Spawn the metrics server.
    let metrics_handle = {
        let router = metrics.router();
        let addr: std::net::SocketAddr = config
            .metrics_listen_addr
            .parse()
            .context("Failed to parse FLEET_METRICS_LISTEN_ADDR")?;
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(address = %addr, "Metrics server started");
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    // Spawn the fleet-summary observer: snapshot readers of the state store.
    let summary_handle = {
        let store = store.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let period = Duration::from_secs(config.summary_interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let vehicles = store.vehicles();
                        let deliveries: u64 =
                            vehicles.iter().map(|(_, v)| v.deliveries_completed).sum();
                        for (id, view) in &vehicles {
                            let report = PositionReport {
                                world_x: view.reported_position.world_x(),
                                world_y: view.reported_position.world_y(),
                                status: view.status,
                                deliveries_completed: view.deliveries_completed,
                            };
                            tracing::debug!(vehicle = %id, report = %report.encode(), "Vehicle report");
                        }
                        tracing::info!(
                            workers = vehicles.len(),
                            live_tasks = store.task_count(),
                            deliveries,
                            "Fleet summary"
                        );
                    }
                }
            }
        })
    };

    tracing::info!("All services started. Awaiting shutdown signal...");

    shutdown_signal().await;

    tracing::info!("Shutdown signal received. Terminating services...");
    // The drop of the sender delivers the shutdown signal to every receiver.
    drop(shutdown_tx);

    let (coordinator_res, metrics_res, summary_res, worker_res) = tokio::join!(
        coordinator_handle,
        metrics_handle,
        summary_handle,
        futures::future::join_all(worker_handles)
    );

    if let Err(e) = coordinator_res {
        tracing::error!(error = %e, "Coordinator task failed.");
    }
    match metrics_res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Metrics server failed."),
        Err(e) => tracing::error!(error = %e, "Metrics server task panicked."),
    }
    if let Err(e) = summary_res {
        tracing::error!(error = %e, "Fleet summary task failed.");
    }
    for res in worker_res {
        if let Err(e) = res {
            tracing::error!(error = %e, "Worker task failed.");
        }
    }

    tracing::info!("Simulator shut down gracefully.");
    Ok(())
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
