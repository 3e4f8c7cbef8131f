//! Operational HTTP surface: liveness plus the open-room listing. The
//! router is generic over a status port so it stays decoupled from the
//! coordinator's internals.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub rooms: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRoomEntry {
    pub room_id: String,
    pub game_id: u64,
    pub stake: u128,
    pub time_budget_seconds: u64,
    pub host: String,
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn health(&self) -> HealthResponse;
    async fn open_rooms(&self) -> Vec<OpenRoomEntry>;
}

pub fn build_router(source: Arc<dyn StatusSource>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rooms", get(open_rooms))
        .with_state(source)
}

async fn health(State(source): State<Arc<dyn StatusSource>>) -> Json<HealthResponse> {
    info!(route = "/health", "ops http request");
    Json(source.health().await)
}

async fn open_rooms(State(source): State<Arc<dyn StatusSource>>) -> Json<Vec<OpenRoomEntry>> {
    info!(route = "/rooms", "ops http request");
    Json(source.open_rooms().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStatus;

    #[async_trait]
    impl StatusSource for FixedStatus {
        async fn health(&self) -> HealthResponse {
            HealthResponse {
                ok: true,
                service: "coffeechess-coordinator".to_string(),
                rooms: 3,
                sessions: 5,
            }
        }

        async fn open_rooms(&self) -> Vec<OpenRoomEntry> {
            vec![OpenRoomEntry {
                room_id: "room-1".to_string(),
                game_id: 7,
                stake: 1000,
                time_budget_seconds: 300,
                host: "0xAb".to_string(),
            }]
        }
    }

    #[tokio::test]
    async fn router_builds_and_status_port_answers() {
        let source: Arc<dyn StatusSource> = Arc::new(FixedStatus);
        let _router = build_router(Arc::clone(&source));
        let health = source.health().await;
        assert!(health.ok);
        assert_eq!(health.rooms, 3);
        let rooms = source.open_rooms().await;
        let json = serde_json::to_value(&rooms).expect("json");
        assert_eq!(json[0]["gameId"], 7);
        assert_eq!(json[0]["timeBudgetSeconds"], 300);
    }
}
