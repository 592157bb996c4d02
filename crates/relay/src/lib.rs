//! # Upload Relay
//!
//! クライアントからのファイルアップロードをセッション単位でバッファし、
//! セッション完了時に1つのmultipartリクエストとして下流のWebhookへ転送する。
//!
//! ## セッション完了の契機
//! - 明示的な完了シグナル（`is_last`）
//! - 無操作タイムアウト
//!
//! どちらの経路でも転送はセッションごとに高々1回。

pub mod config;
pub mod endpoints;
pub mod error;
pub mod forward;
pub mod reaper;
pub mod scheduler;
pub mod session;
pub mod storage;

#[cfg(test)]
mod test_helpers;
