//! # GET /health
//!
//! 稼働状況の公開エンドポイント。

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use relay_types::HealthResponse;

use crate::config::RelayState;

/// GET /health: 保持中のセッション数と稼働時間を返す。
pub async fn handle_health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.registry.size().await,
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_state;

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state("http://127.0.0.1:9/hook", dir.path());

        drop(state.registry.get_or_create(Some("a")).await);
        drop(state.registry.get_or_create(Some("b")).await);

        let health = handle_health(State(state)).await.0;
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_sessions, 2);
        assert!(health.uptime >= 0.0);
    }
}
