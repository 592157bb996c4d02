//! # Relay エラー型
//!
//! 全エンドポイント・全コンポーネントで共通のエラー型。

use axum::http::StatusCode;
use axum::Json;
use relay_types::ErrorResponse;

/// Relayエラー型。
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// 不正なリクエスト（multipartのパース失敗、不正なセッションID）
    #[error("不正なリクエスト: {0}")]
    BadRequest(String),
    /// ファイルサイズ上限超過
    #[error("ファイルサイズが上限を超えています: {name} (上限: {limit} bytes)")]
    PayloadTooLarge { name: String, limit: u64 },
    /// セッションあたりのファイル数上限超過
    #[error("セッションのファイル数が上限を超えます: {requested} 件 (上限: {limit} 件)")]
    TooManyFiles { requested: usize, limit: usize },
    /// ストレージ操作に失敗
    #[error("ストレージ操作に失敗: {0}")]
    Storage(String),
    /// Webhookへの転送に失敗
    #[error("Webhookへの転送に失敗: {0}")]
    Forward(String),
    /// 内部エラー
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl RelayError {
    /// 対応するHTTPステータス。
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_)
            | RelayError::PayloadTooLarge { .. }
            | RelayError::TooManyFiles { .. } => StatusCode::BAD_REQUEST,
            RelayError::Storage(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::Forward(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
