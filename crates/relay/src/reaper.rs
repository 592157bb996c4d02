//! # 起動時スイープ
//!
//! 前回プロセスの実行中に転送されずに残ったセッションディレクトリを削除する。
//! リスナーがトラフィックを受け付ける前に一度だけ実行する。
//!
//! 経過時間はメモリ上の `created_at` ではなくディレクトリの更新時刻で判定する
//! （セッション状態はプロセス再起動を跨がないため）。

use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::error::RelayError;

/// スイープ結果。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    /// 削除したディレクトリ数
    pub removed: usize,
    /// 保持期間内のため残したディレクトリ数
    pub kept: usize,
    /// 削除に失敗したディレクトリ数
    pub failed: usize,
}

/// `root` 直下のディレクトリのうち、更新時刻が `max_age` より古いものを再帰的に削除する。
///
/// - `root` が存在しない場合は何もしない
/// - 個々のディレクトリの削除失敗はログに記録し、残りのスイープを継続する
/// - ディレクトリ以外のエントリは対象外
pub async fn sweep(root: &Path, max_age: Duration) -> Result<ReapReport, RelayError> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(root = %root.display(), "アップロードディレクトリが存在しないためスイープをスキップします");
            return Ok(ReapReport::default());
        }
        Err(e) => {
            return Err(RelayError::Storage(format!(
                "ディレクトリ一覧取得失敗 ({}): {e}",
                root.display()
            )))
        }
    };

    let now = SystemTime::now();
    let mut report = ReapReport::default();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RelayError::Storage(format!("ディレクトリ走査失敗 ({}): {e}", root.display())))?
    {
        let path = entry.path();

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "メタデータ取得に失敗しました");
                report.failed += 1;
                continue;
            }
        };
        if !metadata.is_dir() {
            continue;
        }

        // 更新時刻が未来・取得不可の場合は経過0とみなして残す
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age <= max_age {
            report.kept += 1;
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(
                    path = %path.display(),
                    age_secs = age.as_secs(),
                    "古いセッションディレクトリを削除しました"
                );
                report.removed += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "セッションディレクトリの削除に失敗しました");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
