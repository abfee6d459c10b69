//! Liveness, readiness and status endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::web::{Data, Json};
use poem::{Endpoint, EndpointExt, Route, Server, handler};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::info;

use crate::policy::PolicySyncReport;
use crate::reconciler::{InstanceReport, SealState};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Unix seconds of the last completed tick
    pub last_tick: Option<u64>,
    pub ticks: u64,
    pub instances: Vec<InstanceReport>,
    pub remediations: u64,
    pub initializations: u64,
    pub policy_sync: Option<PolicySyncReport>,
}

/// Shared snapshot written by the loops and read by the server.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl HealthState {
    pub async fn record_tick(&self, reports: Vec<InstanceReport>) {
        let mut snapshot = self.inner.write().await;
        snapshot.ticks += 1;
        snapshot.last_tick = Some(unix_now());
        snapshot.remediations += count(&reports, |r| r.remediated);
        snapshot.initializations += count(&reports, |r| r.initialized_now);
        snapshot.instances = reports;
    }

    pub async fn record_policy_sync(&self, report: PolicySyncReport) {
        self.inner.write().await.policy_sync = Some(report);
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.read().await.clone()
    }

    /// Ready once the last tick saw an unsealed instance.
    pub async fn is_ready(&self) -> bool {
        self.inner
            .read()
            .await
            .instances
            .iter()
            .any(|report| report.seal == Some(SealState::Unsealed))
    }
}

fn count(reports: &[InstanceReport], predicate: impl Fn(&InstanceReport) -> bool) -> u64 {
    reports.iter().filter(|r| predicate(r)).map(|_| 1).sum()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

async fn resolve_readiness(state: &HealthState) -> (StatusCode, String) {
    if state.is_ready().await {
        (StatusCode::OK, "ready".to_string())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "no unsealed instance".to_string(),
        )
    }
}

#[handler]
fn healthz() -> &'static str {
    "ok"
}

#[handler]
async fn readyz(Data(state): Data<&HealthState>) -> (StatusCode, String) {
    resolve_readiness(state).await
}

#[handler]
async fn status_snapshot(Data(state): Data<&HealthState>) -> Json<StatusSnapshot> {
    Json(state.snapshot().await)
}

fn routes(state: HealthState) -> impl Endpoint {
    Route::new()
        .at("/healthz", poem::get(healthz))
        .at("/readyz", poem::get(readyz))
        .at("/status", poem::get(status_snapshot))
        .data(state)
}

/// Serves until `shutdown` flips to true.
///
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    listen_addr: SocketAddr,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = routes(state);

    info!("Starting health server on {}", listen_addr);
    Server::new(TcpListener::bind(listen_addr))
        .run_with_graceful_shutdown(
            app,
            async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            },
            None,
        )
        .await?;
    Ok(())
}
