//! Operator control surface over HTTP.
//!
//! Actix runs on its own thread with its own system so the pipeline threads
//! never touch the async runtime. Handlers only call the coordinator's
//! operator API, which is cheap and never blocks on the line.

use std::{net::SocketAddr, sync::Arc, thread};

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result};
use inspection::{InspectionCoordinator, IntakeState, telemetry};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info};

type Coordinator = web::Data<Arc<InspectionCoordinator>>;

/// Handle for the control server thread.
pub(crate) struct ControlServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ControlServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("control server thread panicked");
            }
        }
    }
}

/// Bind `addr` and serve the operator API until [`ControlServer::stop`].
pub(crate) fn spawn_control_server(
    addr: SocketAddr,
    coordinator: Arc<InspectionCoordinator>,
) -> Result<ControlServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = oneshot::channel::<std::io::Result<()>>();
    let handle = telemetry::spawn_thread("control-server", move || {
        let outcome = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(coordinator.clone()))
                    .route("/health", web::get().to(health_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .route("/alerts", web::get().to(alerts_handler))
                    .route("/stats", web::get().to(stats_handler))
                    .route("/pause", web::post().to(pause_handler))
                    .route("/resume", web::post().to(resume_handler))
            })
            .workers(1)
            .bind(addr)
            {
                Ok(server) => {
                    let _ = bound_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = bound_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = outcome {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn control server thread")?;

    match bound_rx.blocking_recv() {
        Ok(Ok(())) => info!("control surface listening on http://{addr}"),
        Ok(Err(err)) => {
            let _ = handle.join();
            return Err(err).with_context(|| format!("failed to bind control surface to {addr}"));
        }
        Err(_) => {
            let _ = handle.join();
            anyhow::bail!("control server thread exited before binding");
        }
    }
    Ok(ControlServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

#[derive(Serialize)]
struct IntakeResponse {
    intake: IntakeState,
}

async fn health_handler(coordinator: Coordinator) -> HttpResponse {
    HttpResponse::Ok().json(coordinator.health())
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn alerts_handler(coordinator: Coordinator) -> HttpResponse {
    HttpResponse::Ok().json(coordinator.alerts())
}

async fn stats_handler(coordinator: Coordinator) -> HttpResponse {
    HttpResponse::Ok().json(coordinator.stats())
}

async fn pause_handler(coordinator: Coordinator) -> HttpResponse {
    HttpResponse::Ok().json(IntakeResponse {
        intake: coordinator.pause(),
    })
}

async fn resume_handler(coordinator: Coordinator) -> HttpResponse {
    HttpResponse::Ok().json(IntakeResponse {
        intake: coordinator.resume(),
    })
}
