//! # Upload Relay
//!
//! ## API エンドポイント
//! - `POST /upload`: ファイル受信（セッション単位でバッファ）
//! - `GET /health`: 稼働状況

use std::sync::Arc;

use upload_relay::config::{RelayConfig, RelayState};
use upload_relay::{endpoints, reaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = RelayConfig::from_env()?;

    // 前回プロセスの取り残しを、トラフィック受付前に回収する
    match reaper::sweep(&config.upload_dir, config.cleanup_max_age).await {
        Ok(report) => tracing::info!(
            removed = report.removed,
            kept = report.kept,
            failed = report.failed,
            "起動時スイープが完了しました"
        ),
        Err(e) => tracing::warn!(error = %e, "起動時スイープに失敗しました"),
    }

    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let state = Arc::new(RelayState::from_config(&config)?);
    let app = endpoints::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(
        webhook_url = %config.webhook_url,
        upload_dir = %config.upload_dir.display(),
        session_timeout_ms = config.session_timeout.as_millis() as u64,
        "Relayを {} で起動します",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
