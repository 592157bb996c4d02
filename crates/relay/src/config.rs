//! # Relay設定・共有状態
//!
//! 環境変数からの設定読み込みとRelayの共有状態の定義。
//!
//! ## 環境変数
//! | 変数 | 既定値 | 内容 |
//! |---|---|---|
//! | `PORT` | 3000 | リッスンポート |
//! | `UPLOAD_DIR` | `./uploads` | セッションディレクトリのルート |
//! | `WEBHOOK_URL` | （必須） | 転送先WebhookのURL |
//! | `WEBHOOK_AUTH_TOKEN` | なし | Webhook認証トークン（Bearer） |
//! | `SESSION_TIMEOUT_MS` | 30000 | 無操作タイムアウト（ミリ秒） |
//! | `MAX_FILE_SIZE` | 100MB | 1ファイルの最大サイズ（バイト） |
//! | `MAX_FILES_PER_SESSION` | 50 | セッションあたりの最大ファイル数 |
//! | `CLEANUP_MAX_AGE_SECS` | 3600 | 起動時スイープの保持期間（秒） |
//! | `FORWARD_TIMEOUT_SECS` | 600 | Webhook送信タイムアウト（秒） |

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::RelayError;
use crate::forward::ForwardingEngine;
use crate::scheduler::CompletionScheduler;
use crate::session::SessionRegistry;
use crate::storage::{BlobStore, LocalBlobStore};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_UPLOAD_DIR: &str = "./uploads";
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
/// 100MB
const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_FILES_PER_SESSION: usize = 50;
/// 1時間
const DEFAULT_CLEANUP_MAX_AGE_SECS: u64 = 3600;
/// 10分
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 600;

/// Relayの設定。
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub webhook_url: String,
    pub webhook_auth_token: Option<String>,
    pub session_timeout: Duration,
    pub max_file_size: u64,
    pub max_files_per_session: usize,
    pub cleanup_max_age: Duration,
    pub forward_timeout: Duration,
}

/// 値が設定されていればパースし、未設定なら既定値を返す。
fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key}の値が不正です: {raw:?}")),
        None => Ok(default),
    }
}

impl RelayConfig {
    /// 環境変数から読み込む。
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意のキー参照関数から読み込む。
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let webhook_url = lookup("WEBHOOK_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("WEBHOOK_URLが設定されていません"))?;

        let upload_dir = lookup("UPLOAD_DIR")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_UPLOAD_DIR.to_string());

        let max_files_per_session =
            parse_or(&lookup, "MAX_FILES_PER_SESSION", DEFAULT_MAX_FILES_PER_SESSION)?;
        if max_files_per_session == 0 {
            anyhow::bail!("MAX_FILES_PER_SESSIONは1以上である必要があります");
        }

        Ok(Self {
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            upload_dir: PathBuf::from(upload_dir),
            webhook_url,
            webhook_auth_token: lookup("WEBHOOK_AUTH_TOKEN").filter(|v| !v.is_empty()),
            session_timeout: Duration::from_millis(parse_or(
                &lookup,
                "SESSION_TIMEOUT_MS",
                DEFAULT_SESSION_TIMEOUT_MS,
            )?),
            max_file_size: parse_or(&lookup, "MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?,
            max_files_per_session,
            cleanup_max_age: Duration::from_secs(parse_or(
                &lookup,
                "CLEANUP_MAX_AGE_SECS",
                DEFAULT_CLEANUP_MAX_AGE_SECS,
            )?),
            forward_timeout: Duration::from_secs(parse_or(
                &lookup,
                "FORWARD_TIMEOUT_SECS",
                DEFAULT_FORWARD_TIMEOUT_SECS,
            )?),
        })
    }

    /// 受信時に適用する上限値。
    pub fn limits(&self) -> IngestLimits {
        IngestLimits {
            max_file_size: self.max_file_size,
            max_files_per_session: self.max_files_per_session,
        }
    }
}

/// 受信時に適用する上限値。
#[derive(Debug, Clone, Copy)]
pub struct IngestLimits {
    /// 1ファイルの最大サイズ（バイト）
    pub max_file_size: u64,
    /// セッション生存期間中の最大ファイル数
    pub max_files_per_session: usize,
}

/// Relayの共有状態。
pub struct RelayState {
    /// セッションレジストリ
    pub registry: Arc<SessionRegistry>,
    /// Blob Store（トレイトで抽象化）
    pub blob_store: Arc<dyn BlobStore>,
    /// 転送エンジン
    pub engine: Arc<ForwardingEngine>,
    /// 完了スケジューラ
    pub scheduler: CompletionScheduler,
    /// 受信時の上限値
    pub limits: IngestLimits,
    /// 起動時刻（/healthのuptime用）
    pub started_at: Instant,
}

impl RelayState {
    /// 設定から共有状態を構築する。ストレージはローカルディスク。
    pub fn from_config(config: &RelayConfig) -> Result<Self, RelayError> {
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&config.upload_dir));
        Self::new(config, blob_store)
    }

    /// 任意のBlob Storeで共有状態を構築する。
    pub fn new(config: &RelayConfig, blob_store: Arc<dyn BlobStore>) -> Result<Self, RelayError> {
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(ForwardingEngine::new(
            config.webhook_url.clone(),
            config.webhook_auth_token.clone(),
            config.forward_timeout,
            blob_store.clone(),
        )?);
        let scheduler = CompletionScheduler::new(&registry, engine.clone(), config.session_timeout);

        Ok(Self {
            registry,
            blob_store,
            engine,
            scheduler,
            limits: config.limits(),
            started_at: Instant::now(),
        })
    }
}
