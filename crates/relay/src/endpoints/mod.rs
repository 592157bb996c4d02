//! # Relayエンドポイント
//!
//! - `POST /upload`: ファイル受信・セッション更新・完了時の転送
//! - `GET /health`: 稼働状況

pub mod health;
pub mod upload;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;

pub use health::handle_health;
pub use upload::handle_upload;

use crate::config::RelayState;

/// axumルーターを構築する。
///
/// `/upload` はボディサイズの既定上限（2MB）を無効化し、
/// ファイル単位の上限をハンドラ側で適用する。
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/upload",
            axum::routing::post(handle_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/health", axum::routing::get(handle_health))
        .with_state(state)
}
