//! # ローカルディスク Blob Store
//!
//! `UPLOAD_DIR` 配下にセッションごとのディレクトリを作成してファイルを保存する。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{sanitize_file_name, BlobStore, ByteStream};
use crate::error::RelayError;

/// 名前衝突時に試行する別名の最大数
const MAX_NAME_ATTEMPTS: usize = 10_000;

/// ローカルディスクによるBlob Store実装。
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// ストレージのルートディレクトリ。
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// セッションのディレクトリパス。
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }
}

/// 衝突回避用の候補名。0番目は元の名前そのもの。
fn candidate_name(base: &str, attempt: usize) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        format!("{attempt}_{base}")
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        session_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> Result<PathBuf, RelayError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            RelayError::Storage(format!("ディレクトリ作成失敗 ({}): {e}", dir.display()))
        })?;

        let base = sanitize_file_name(file_name);
        let mut attempt = 0;
        let mut dir_recreated = false;

        while attempt < MAX_NAME_ATTEMPTS {
            let path = dir.join(candidate_name(&base, attempt));

            // create_newで既存ファイルの上書きを防ぐ
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    attempt += 1;
                    continue;
                }
                // 同じIDの前セッションの後始末で空ディレクトリが消された
                Err(e) if e.kind() == ErrorKind::NotFound && !dir_recreated => {
                    dir_recreated = true;
                    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                        RelayError::Storage(format!("ディレクトリ作成失敗 ({}): {e}", dir.display()))
                    })?;
                    continue;
                }
                Err(e) => {
                    return Err(RelayError::Storage(format!(
                        "ファイル作成失敗 ({}): {e}",
                        path.display()
                    )))
                }
            };

            let written = async {
                file.write_all(&data).await?;
                file.flush().await?;
                file.sync_all().await
            }
            .await;

            if let Err(e) = written {
                // 書きかけのファイルを残さない
                let _ = tokio::fs::remove_file(&path).await;
                return Err(RelayError::Storage(format!(
                    "ファイル書き込み失敗 ({}): {e}",
                    path.display()
                )));
            }

            return Ok(path);
        }

        Err(RelayError::Storage(format!(
            "ファイル名の衝突を解消できません: {base}"
        )))
    }

    async fn open(&self, path: &Path) -> Result<(ByteStream, u64), RelayError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            RelayError::Storage(format!("ファイル読み込み失敗 ({}): {e}", path.display()))
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| {
                RelayError::Storage(format!("メタデータ取得失敗 ({}): {e}", path.display()))
            })?
            .len();

        let stream: ByteStream = Box::pin(ReaderStream::new(file));
        Ok((stream, len))
    }

    async fn delete_files(&self, session_id: &str, paths: &[PathBuf]) -> Result<(), RelayError> {
        let mut failures = Vec::new();

        for path in paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("{}: {e}", path.display())),
            }
        }

        // 後継セッションのファイルが残っていればディレクトリは残す
        let dir = self.session_dir(session_id);
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) => {}
            Err(e) => failures.push(format!("{}: {e}", dir.display())),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Storage(format!(
                "ファイル削除失敗: {}",
                failures.join(", ")
            )))
        }
    }
}
