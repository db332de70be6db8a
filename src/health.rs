//! Health/readiness endpoints, adapted from the teacher's `health.rs`:
//! same three-tier shape (`/health/live`, `/health/ready`, `/health`), the
//! database check replaced with a credential-store reachability probe and
//! the actor-system check replaced with a multiplexer connection-count
//! summary across the five named instances.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::credentials::CredentialStore;
use crate::registry::MuxRegistry;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: u64,
    version: String,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    credential_store: CheckStatus,
    mux: MuxHealthStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    credential_store: bool,
    mux: bool,
}

/// Connection-count summary across the five named multiplexer instances.
#[derive(Debug, Serialize)]
pub struct MuxHealthStatus {
    active_connections: usize,
    status: CheckStatus,
    healthy: bool,
}

/// Liveness probe: the process is up and scheduling tasks.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

pub async fn readiness(
    State(store): State<Arc<dyn CredentialStore>>,
    State(registry): State<Arc<MuxRegistry>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let store_ready = check_credential_store(store.as_ref()).await;
    let mux_health = check_mux_health(&registry).await;
    let mux_ready = mux_health.healthy;

    let ready = store_ready && mux_ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            checks: ReadinessChecks {
                credential_store: store_ready,
                mux: mux_ready,
            },
        }),
    )
}

pub async fn health(
    State(store): State<Arc<dyn CredentialStore>>,
    State(registry): State<Arc<MuxRegistry>>,
) -> (StatusCode, Json<HealthResponse>) {
    let store_healthy = check_credential_store(store.as_ref()).await;
    let store_status = if store_healthy {
        CheckStatus::Healthy
    } else {
        CheckStatus::Unhealthy
    };

    let mux_health = check_mux_health(&registry).await;

    let overall_healthy = store_healthy && mux_health.healthy;
    let status = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    (
        status,
        Json(HealthResponse {
            status: if overall_healthy {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                credential_store: store_status,
                mux: mux_health,
            },
        }),
    )
}

/// A missing record is a healthy backend answering "not found"; only a
/// backend error means the store itself is unreachable.
async fn check_credential_store(store: &dyn CredentialStore) -> bool {
    use crate::credentials::CredentialStoreError;

    match store.get("__health_check__").await {
        Ok(_) => true,
        Err(CredentialStoreError::NotFound(_)) => true,
        Err(CredentialStoreError::Undecipherable) => true,
        Err(CredentialStoreError::Backend(_)) => false,
    }
}

async fn check_mux_health(registry: &MuxRegistry) -> MuxHealthStatus {
    let active_connections = registry.quotes.connection_count().await
        + registry.bars.connection_count().await
        + registry.market_depth.connection_count().await
        + registry.positions.connection_count().await
        + registry.orders.connection_count().await;

    MuxHealthStatus {
        active_connections,
        status: CheckStatus::Healthy,
        healthy: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
