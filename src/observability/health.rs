//! Health check HTTP server for container orchestration
//!
//! Serves `/health`, `/ready`, `/live` and `/metrics` from the connection
//! state watch and the global metrics collector. Nothing here can change
//! ingestor state.

use crate::ingestor::state_machine::ConnectionState;
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    service_name: String,
    port: u16,
    state_rx: watch::Receiver<ConnectionState>,
}

impl HealthServer {
    pub fn new(
        service_name: impl Into<String>,
        port: u16,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            state_rx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route table, separate from `start` so it can be exercised in tests
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - connection and storage checks
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let status = server.get_health_status();
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /ready - only while the broker session is up
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let state = server.state_rx.borrow().clone();
                    let response = ReadinessResponse {
                        ready: state.is_connected(),
                        state: state.label().to_string(),
                        timestamp: current_timestamp(),
                    };
                    let code = if response.ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /metrics - JSON snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        health_route.or(ready_route).or(live_route).or(metrics_route)
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let routes = self.clone().routes();

        let (bound, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })?;

        info!(address = %bound, "Health server listening");
        server.await;
        info!("Health server stopped");
        Ok(())
    }

    fn get_health_status(&self) -> HealthStatus {
        let snapshot = metrics().get_metrics();
        let now = current_timestamp();

        let mut checks = BTreeMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health(now));
        checks.insert(
            "storage".to_string(),
            check_storage_health(
                snapshot.ingest.records_stored,
                snapshot.ingest.storage_failures,
                now,
            ),
        );

        let overall_healthy = checks.values().all(|check| check.status == "healthy");
        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            service: self.service_name.clone(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt_health(&self, now: u64) -> HealthCheck {
        let state = self.state_rx.borrow().clone();
        if state.is_connected() {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("MQTT connection established".to_string()),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(format!("MQTT session is {}", state.label())),
                last_check: now,
            }
        }
    }
}

/// Storage is unhealthy only when every insert so far has failed
fn check_storage_health(stored: u64, failures: u64, now: u64) -> HealthCheck {
    if failures > 0 && stored == 0 {
        HealthCheck {
            status: "failing".to_string(),
            message: Some(format!("{failures} inserts failed, none succeeded")),
            last_check: now,
        }
    } else {
        HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!("{stored} records stored, {failures} failed")),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    state: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
