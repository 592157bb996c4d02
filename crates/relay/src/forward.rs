//! # 転送エンジン
//!
//! セッションに蓄積されたファイルとメタデータを1つのmultipartリクエストに組み立て、
//! 下流のWebhookへPOSTする。外部へのネットワーク通信を行う唯一のコンポーネント。
//!
//! ## ペイロード構成
//! 1. FileRecordごとに `files` パート（記録順、元のファイル名・Content-Type付き、ストレージからストリーミング）
//! 2. 空でないメタデータごとにテキストパート（`context`, `force_theme`, `force_type`）
//!
//! 転送は完了トリガーごとに1回だけ試行し、内部リトライは行わない。
//! 成否にかかわらず、最後にセッションのファイルを削除する。

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};

use crate::error::RelayError;
use crate::session::{Session, SessionRegistry};
use crate::storage::BlobStore;

/// 転送ペイロードでファイルパートに使用するフィールド名
pub const FORWARD_FILE_FIELD: &str = "files";

/// 転送成功時の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardReport {
    pub session_id: String,
    /// 転送したファイル数
    pub files_forwarded: usize,
    /// WebhookのHTTPステータス
    pub status: u16,
}

/// 転送エンジン。
pub struct ForwardingEngine {
    /// HTTPクライアント（プロキシ無効、送信タイムアウト付き）
    http_client: reqwest::Client,
    /// 下流WebhookのURL
    webhook_url: String,
    /// Webhook認証トークン（Bearer）
    auth_token: Option<String>,
    blob_store: Arc<dyn BlobStore>,
}

impl ForwardingEngine {
    /// 転送エンジンを構築する。
    ///
    /// ペイロードサイズの上限は設けない。`send_timeout` はリクエスト全体
    /// （接続・送信・レスポンス受信）に適用される。
    pub fn new(
        webhook_url: impl Into<String>,
        auth_token: Option<String>,
        send_timeout: Duration,
        blob_store: Arc<dyn BlobStore>,
    ) -> Result<Self, RelayError> {
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .timeout(send_timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("HTTPクライアント構築失敗: {e}")))?;

        Ok(Self {
            http_client,
            webhook_url: webhook_url.into(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
            blob_store,
        })
    }

    /// セッションのmultipartペイロードを組み立てる。
    async fn build_form(&self, session: &Session) -> Result<Form, RelayError> {
        let mut form = Form::new();

        for file in &session.files {
            let (stream, len) = self.blob_store.open(&file.storage_path).await?;
            let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), len)
                .file_name(file.original_name.clone())
                .mime_str(&file.content_type)
                .map_err(|e| {
                    RelayError::Forward(format!(
                        "Content-Typeが不正です ({}): {e}",
                        file.content_type
                    ))
                })?;
            form = form.part(FORWARD_FILE_FIELD, part);
        }

        for (name, value) in session.metadata.fields() {
            form = form.text(name, value.to_string());
        }

        Ok(form)
    }

    /// セッションをWebhookへ転送する。
    ///
    /// 通信失敗・タイムアウト・2xx以外のレスポンスは `RelayError::Forward`。
    pub async fn forward(&self, session: &Session) -> Result<ForwardReport, RelayError> {
        let form = self.build_form(session).await?;

        let mut request = self.http_client.post(&self.webhook_url).multipart(form);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::Forward(format!("Webhookへの送信がタイムアウトしました: {e}"))
            } else {
                RelayError::Forward(format!("HTTP送信失敗: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Forward(format!(
                "Webhookがエラーを返しました: HTTP {} - {}",
                status, body
            )));
        }

        Ok(ForwardReport {
            session_id: session.id.clone(),
            files_forwarded: session.files.len(),
            status: status.as_u16(),
        })
    }

    /// セッションを取り出して転送し、後始末まで行う。
    ///
    /// タイマー発火経路から呼ばれる。
    /// `remove` が `None` を返した場合（他方の経路が既に取り出した場合）は何もせず `None` を返す。
    pub async fn complete(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
    ) -> Option<Result<ForwardReport, RelayError>> {
        let session = registry.remove(session_id).await?;
        Some(self.deliver(session).await)
    }

    /// 取り出し済みのセッションを転送し、成否にかかわらず後始末する。
    pub async fn deliver(&self, session: Session) -> Result<ForwardReport, RelayError> {
        tracing::info!(
            session_id = %session.id,
            files = session.files.len(),
            "セッションの転送を開始します"
        );

        let result = self.forward(&session).await;
        match &result {
            Ok(report) => tracing::info!(
                session_id = %report.session_id,
                files = report.files_forwarded,
                status = report.status,
                "セッションを転送しました"
            ),
            Err(e) => tracing::error!(
                session_id = %session.id,
                files = session.files.len(),
                error = %e,
                "セッションの転送に失敗しました"
            ),
        }

        self.cleanup(&session).await;
        result
    }

    /// セッションが記録したファイルを削除する。失敗してもログのみでリトライしない。
    ///
    /// 同じIDの後継セッションが同じディレクトリに保存したファイルは残す。
    pub async fn cleanup(&self, session: &Session) {
        let paths: Vec<_> = session.files.iter().map(|f| f.storage_path.clone()).collect();
        if let Err(e) = self.blob_store.delete_files(&session.id, &paths).await {
            tracing::warn!(
                session_id = %session.id,
                error = %e,
                "セッションファイルの削除に失敗しました（次回起動時のスイープで回収）"
            );
        }
    }
}
