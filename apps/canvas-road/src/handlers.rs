use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::registry::RoomStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct RoomsResponse {
    pub active_rooms: usize,
    pub active_connections: usize,
    pub rooms: Vec<RoomStats>,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn rooms_handler(State(state): State<Arc<AppState>>) -> Json<RoomsResponse> {
    let rooms = state.registry.stats().await;
    Json(RoomsResponse {
        active_rooms: rooms.len(),
        active_connections: rooms.iter().map(|room| room.connections).sum(),
        rooms,
    })
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
