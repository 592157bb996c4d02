//! # POST /upload
//!
//! ファイル受信とセッション状態遷移。
//!
//! ## 処理順序
//! 1. セッションID解決（`session_id` 優先、省略時は新規発行してレスポンスで返す）
//! 2. 上限チェック（ファイルサイズ・セッションあたりのファイル数）。違反時はリクエスト全体を拒否
//! 3. ファイルを保存し、保存完了したものから順にセッションへ追加。メタデータをマージ
//! 4. `is_last` が真ならロックを保持したままセッションを取り出し、同期的に転送してその結果を返す
//! 5. それ以外は完了タイマーを張り直し、即座にバッファ済み件数を返す

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use bytes::{Bytes, BytesMut};
use relay_types::*;

use crate::config::RelayState;
use crate::error::RelayError;
use crate::session::FileRecord;
use crate::storage::validate_session_id;

/// 受信した1ファイル（保存前）。
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub original_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// デコード済みのアップロードリクエスト。
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub session_id: Option<String>,
    pub is_last: bool,
    pub metadata: SessionMetadata,
    pub files: Vec<IncomingFile>,
}

/// 真偽値フラグを解釈する。`true` / `1` / `yes` / `on`（大文字小文字を区別しない）が真。
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// 呼び出し元指定のContent-Typeが有効ならそれを、なければ拡張子から推定する。
fn resolve_content_type(declared: Option<&str>, file_name: &str) -> String {
    declared
        .filter(|ct| ct.parse::<mime_guess::mime::Mime>().is_ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
}

/// multipartボディをデコードする。
///
/// ファイルサイズ上限は読み取り中に適用し、超過したパートを最後までバッファしない。
pub async fn read_upload_request(
    mut multipart: Multipart,
    max_file_size: u64,
) -> Result<UploadRequest, RelayError> {
    let mut request = UploadRequest::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::BadRequest(format!("multipartの読み取りに失敗: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if let Some(file_name) = field.file_name().map(str::to_string) {
            // ブラウザは未選択のファイル入力を空のファイル名で送る
            if file_name.is_empty() {
                continue;
            }
            let content_type = resolve_content_type(field.content_type(), &file_name);

            let mut buf = BytesMut::new();
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| RelayError::BadRequest(format!("ファイルの読み取りに失敗: {e}")))?
            {
                if (buf.len() + chunk.len()) as u64 > max_file_size {
                    return Err(RelayError::PayloadTooLarge {
                        name: file_name,
                        limit: max_file_size,
                    });
                }
                buf.extend_from_slice(&chunk);
            }

            request.files.push(IncomingFile {
                original_name: file_name,
                content_type,
                data: buf.freeze(),
            });
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| RelayError::BadRequest(format!("フィールド {name} の読み取りに失敗: {e}")))?;

        match name.as_str() {
            FIELD_SESSION_ID => {
                let trimmed = value.trim();
                request.session_id = (!trimmed.is_empty()).then(|| trimmed.to_string());
            }
            FIELD_IS_LAST => request.is_last = parse_flag(&value),
            FIELD_CONTEXT => request.metadata.context = Some(value),
            FIELD_FORCE_THEME => request.metadata.force_theme = Some(value),
            FIELD_FORCE_TYPE => request.metadata.force_type = Some(value),
            other => tracing::debug!(field = %other, "未知のフィールドを無視します"),
        }
    }

    Ok(request)
}

/// デコード済みリクエストをセッションに反映する。
pub async fn ingest(state: &RelayState, request: UploadRequest) -> Result<UploadResponse, RelayError> {
    if let Some(id) = &request.session_id {
        validate_session_id(id)?;
    }

    let limit = state.limits.max_files_per_session;
    // 新規セッションを作成する前に判定できる分はここで拒否する
    if request.files.len() > limit {
        return Err(RelayError::TooManyFiles {
            requested: request.files.len(),
            limit,
        });
    }

    let (mut session, is_new) = state.registry.get_or_create(request.session_id.as_deref()).await;
    let session_id = session.id.clone();
    if is_new {
        tracing::info!(session_id = %session_id, "新規セッションを作成しました");
    }

    let requested = session.files.len() + request.files.len();
    if requested > limit {
        return Err(RelayError::TooManyFiles { requested, limit });
    }

    let incoming = request.files.len();
    let mut storage_error = None;
    for file in request.files {
        let size = file.data.len() as u64;
        match state
            .blob_store
            .put(&session_id, &file.original_name, file.data)
            .await
        {
            Ok(storage_path) => session.append_files([FileRecord {
                storage_path,
                original_name: file.original_name,
                content_type: file.content_type,
                size,
            }]),
            Err(e) => {
                storage_error = Some(e);
                break;
            }
        }
    }
    session.merge_metadata(&request.metadata);

    // 保存済みのファイルはロールバックしない。セッションが宙に浮かないようタイマーは張る。
    if let Some(e) = storage_error {
        tracing::error!(
            session_id = %session_id,
            buffered = session.files.len(),
            error = %e,
            "ファイルの保存に失敗しました"
        );
        if is_new && session.files.is_empty() {
            // ロックを保持したまま取り出し、待機中の同一IDのリクエストには新規セッションを作らせる
            let discarded = state.registry.detach(session).await;
            state.engine.cleanup(&discarded).await;
        } else {
            state.scheduler.schedule(&mut session);
        }
        return Err(e);
    }

    let buffered = session.files.len();

    if request.is_last {
        // 発火済みのタイマーがあっても、ロックを保持している側が取り出す
        let claimed = state.registry.detach(session).await;
        let report = state.engine.deliver(claimed).await?;
        return Ok(UploadResponse {
            success: true,
            session_id,
            files_received: report.files_forwarded,
            message: format!("{}件のファイルを転送しました", report.files_forwarded),
        });
    }

    state.scheduler.schedule(&mut session);
    tracing::info!(
        session_id = %session_id,
        received = incoming,
        buffered,
        "ファイルをバッファしました"
    );

    Ok(UploadResponse {
        success: true,
        session_id,
        files_received: buffered,
        message: format!(
            "{}件のファイルをバッファしました（{}ms操作がなければ自動転送）",
            buffered,
            state.scheduler.idle().as_millis()
        ),
    })
}

/// POST /upload: ファイル受信。
pub async fn handle_upload(
    State(state): State<Arc<RelayState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, RelayError> {
    let multipart = multipart
        .map_err(|e| RelayError::BadRequest(format!("multipart/form-dataではありません: {e}")))?;

    let request = read_upload_request(multipart, state.limits.max_file_size).await?;
    let response = ingest(&state, request).await?;
    Ok(Json(response))
}
