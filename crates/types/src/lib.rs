//! # Upload Relay 共有型定義
//!
//! アップロードリレーのHTTP境界で受け渡しされるデータ構造を提供する。
//!
//! ## 命名規則
//! - 受信フォームフィールド: snake_case（`session_id`, `is_last` 等）
//! - レスポンスJSON: camelCase（`sessionId`, `filesReceived` 等）

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// フォームフィールド名 (POST /upload)
// ---------------------------------------------------------------------------

/// セッションIDフィールド。省略時はサーバーが新規IDを発行する。
pub const FIELD_SESSION_ID: &str = "session_id";
/// 完了シグナルフィールド。真値ならセッションを即時転送する。
pub const FIELD_IS_LAST: &str = "is_last";
/// コンテキスト（任意のメタデータ）
pub const FIELD_CONTEXT: &str = "context";
/// テーマ強制指定（任意のメタデータ）
pub const FIELD_FORCE_THEME: &str = "force_theme";
/// 種別強制指定（任意のメタデータ）
pub const FIELD_FORCE_TYPE: &str = "force_type";

// ---------------------------------------------------------------------------
// セッションメタデータ
// ---------------------------------------------------------------------------

/// セッションに付随するメタデータ。
///
/// 複数リクエストにまたがってマージされる。空文字列は既存の値を上書きしない。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_type: Option<String>,
}

impl SessionMetadata {
    /// `partial` の空でないフィールドで自身を上書きする。
    pub fn merge(&mut self, partial: &SessionMetadata) {
        fn overwrite(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                *slot = Some(v.to_string());
            }
        }
        overwrite(&mut self.context, &partial.context);
        overwrite(&mut self.force_theme, &partial.force_theme);
        overwrite(&mut self.force_type, &partial.force_type);
    }

    /// 空でないフィールドを (フォームフィールド名, 値) の順序付きリストで返す。
    /// 転送ペイロードのテキストパート構築に使用する。
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            (FIELD_CONTEXT, self.context.as_deref()),
            (FIELD_FORCE_THEME, self.force_theme.as_deref()),
            (FIELD_FORCE_TYPE, self.force_type.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.filter(|v| !v.is_empty()).map(|v| (name, v)))
        .collect()
    }
}

// ---------------------------------------------------------------------------
// レスポンス
// ---------------------------------------------------------------------------

/// POST /upload の正常レスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    /// 後続リクエストで再利用するセッションID
    pub session_id: String,
    /// バッファ済み（非完了時）または転送済み（完了時）のファイル数
    pub files_received: usize,
    pub message: String,
}

/// エラーレスポンス。全エンドポイント共通。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

/// GET /health のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// 常に "ok"
    pub status: String,
    /// 現在保持しているセッション数
    pub active_sessions: usize,
    /// プロセス起動からの経過秒数
    pub uptime: f64,
}
