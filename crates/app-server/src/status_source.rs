use std::sync::Arc;

use async_trait::async_trait;
use coordinator::Coordinator;
use ops_http::{HealthResponse, OpenRoomEntry, StatusSource};

/// Adapts the coordinator's registries to the ops surface.
pub struct CoordinatorStatusSource {
    coordinator: Arc<Coordinator>,
    service_name: String,
}

impl CoordinatorStatusSource {
    pub fn new(coordinator: Arc<Coordinator>, service_name: impl Into<String>) -> Self {
        Self {
            coordinator,
            service_name: service_name.into(),
        }
    }
}

#[async_trait]
impl StatusSource for CoordinatorStatusSource {
    async fn health(&self) -> HealthResponse {
        let (rooms, sessions) = self.coordinator.counts().await;
        HealthResponse {
            ok: true,
            service: self.service_name.clone(),
            rooms,
            sessions,
        }
    }

    async fn open_rooms(&self) -> Vec<OpenRoomEntry> {
        self.coordinator
            .list_open_rooms()
            .await
            .into_iter()
            .map(|summary| OpenRoomEntry {
                room_id: summary.room_id.0.to_string(),
                game_id: summary.game_id,
                stake: summary.stake,
                time_budget_seconds: summary.time_budget_seconds,
                host: summary.host,
            })
            .collect()
    }
}
