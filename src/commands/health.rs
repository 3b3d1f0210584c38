use crate::session::Session;
use crate::state::ClientState;
use crate::store::DocumentStore;
use serde::Serialize;
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub backend: &'static str,
    pub store: &'static str,
}

pub async fn build_health_response(
    started_at: Instant,
    store: &dyn DocumentStore,
    session: &Session,
    collection: &str,
) -> HealthResponse {
    let store_status = match store.ping(session, collection).await {
        Ok(()) => "ok",
        Err(error) => {
            warn!(backend = store.backend_name(), error = %error, "store health check failed");
            "error"
        }
    };

    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        backend: store.backend_name(),
        store: store_status,
    }
}

pub async fn health(state: &ClientState) -> HealthResponse {
    build_health_response(
        state.started_at,
        state.store.as_ref(),
        &state.session(),
        &state.config.collection,
    )
    .await
}
