//! # Blob Store
//!
//! セッション単位でアップロードファイルのバイト列を保持するストレージの抽象インターフェース。
//! ローカルディスク実装は `local` サブモジュールを参照。
//!
//! レイアウト: `<root>/<session_id>/<original name>`。
//! ディレクトリツリーそのものが永続状態であり、インデックスやマニフェストは持たない。

pub mod local;

pub use local::LocalBlobStore;

use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

use crate::error::RelayError;

/// ストレージから読み出すバイトストリーム。
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

/// セッションIDの最大長
const MAX_SESSION_ID_LEN: usize = 128;

/// Blob Storeの抽象インターフェース。
///
/// 書き込みは常に `put` の完了をもってディスクに反映済みとみなす。
/// セッションレジストリはこの完了後にのみFileRecordを追加する。
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// セッション配下にファイルを保存し、保存先パスを返す。
    ///
    /// 同一セッション内で名前が衝突した場合は別名で保存し、既存のファイルを上書きしない。
    async fn put(&self, session_id: &str, file_name: &str, data: Bytes)
        -> Result<PathBuf, RelayError>;

    /// 保存済みファイルをストリームとして開く。戻り値の `u64` はバイト長。
    async fn open(&self, path: &Path) -> Result<(ByteStream, u64), RelayError>;

    /// `put` が返したパスのファイルを削除し、セッションディレクトリが空になれば取り除く。
    ///
    /// 同じIDで作り直された後継セッションのファイルには触れない。
    /// 既に存在しないファイル・ディレクトリは成功扱い。
    async fn delete_files(&self, session_id: &str, paths: &[PathBuf]) -> Result<(), RelayError>;
}

/// セッションIDがディレクトリ名として安全に使えるかを検証する。
///
/// 英数字・`-`・`_`・`.` のみ許可し、`.` と `..` は拒否する。
pub fn validate_session_id(session_id: &str) -> Result<(), RelayError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(RelayError::BadRequest(format!(
            "session_idに使用できない文字が含まれています: {session_id:?}"
        )))
    }
}

/// 呼び出し元のファイル名からパス成分を除去する。
///
/// `/` と `\` の両方を区切りとみなし、最後の成分を返す。
/// 空・`.`・`..` になる場合は `"file"` を返す。
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or_default().trim();
    match base {
        "" | "." | ".." => "file".to_string(),
        other => other.to_string(),
    }
}
