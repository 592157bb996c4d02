//! # 完了スケジューラ
//!
//! 「最後の変更から一定時間操作がない」ことを、セッションの転送を起動する
//! 一度きりのコールバックに変換する。
//!
//! タイマーはセッションへの変更ごとにリセットされ（加算ではなく張り直し）、
//! セッションの取り出し時に取り消される。発火経路も明示的な完了経路と同じく
//! `ForwardingEngine::complete`（＝`remove` が先）を通るため、二重転送は起きない。

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::forward::ForwardingEngine;
use crate::session::{FireCallback, FireFuture, Session, SessionRegistry};

/// 完了スケジューラ。
pub struct CompletionScheduler {
    registry: Weak<SessionRegistry>,
    engine: Arc<ForwardingEngine>,
    /// 無操作タイムアウト
    idle: Duration,
}

impl CompletionScheduler {
    pub fn new(registry: &Arc<SessionRegistry>, engine: Arc<ForwardingEngine>, idle: Duration) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            engine,
            idle,
        }
    }

    /// 無操作タイムアウト。
    pub fn idle(&self) -> Duration {
        self.idle
    }

    /// 発火時にセッションを取り出して転送するコールバック。
    ///
    /// タイマー経由の転送失敗は呼び出し元が存在しないため、`complete` 内のログ出力のみとなる。
    fn fire_callback(&self) -> FireCallback {
        let registry = self.registry.clone();
        let engine = self.engine.clone();
        Arc::new(move |session_id: String| -> FireFuture {
            let registry = registry.clone();
            let engine = engine.clone();
            Box::pin(async move {
                // レジストリが破棄済み（シャットダウン中）なら何もしない
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                tracing::info!(
                    session_id = %session_id,
                    "無操作タイムアウトによりセッションを完了します"
                );
                if engine.complete(&registry, &session_id).await.is_none() {
                    tracing::debug!(
                        session_id = %session_id,
                        "セッションは既に他の経路で取り出されていました"
                    );
                }
            })
        })
    }

    /// ロック中のセッションにタイマーを（再）設定する。
    pub fn schedule(&self, session: &mut Session) {
        session.arm_timer(self.idle, self.fire_callback());
    }

    /// IDを指定してタイマーを（再）設定する。セッションが存在しなければ `false`。
    pub async fn schedule_id(&self, session_id: &str) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        registry
            .arm_timer(session_id, self.idle, self.fire_callback())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use crate::test_helpers::{start_mock_webhook, store_file, wait_until};

    /// 無操作タイムアウト後に自動転送されることを確認
    #[tokio::test]
    async fn test_idle_session_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()));
        let webhook = start_mock_webhook(200).await;
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(
            ForwardingEngine::new(webhook.url(), None, Duration::from_secs(10), store.clone())
                .unwrap(),
        );
        let scheduler = CompletionScheduler::new(&registry, engine, Duration::from_millis(100));

        let (mut session, _) = registry.get_or_create(Some("idle")).await;
        session.append_files([store_file(store.as_ref(), "idle", "a.mp3", b"A").await]);
        scheduler.schedule(&mut session);
        drop(session);

        assert!(wait_until(Duration::from_secs(3), || webhook.requests().len() == 1).await);
        assert_eq!(webhook.requests()[0].file_names(), vec!["a.mp3"]);

        assert!(wait_until(Duration::from_secs(3), || !store.session_dir("idle").exists()).await);
        assert_eq!(registry.size().await, 0);
    }

    /// 明示的な完了とタイマー発火が競合しても転送は1回だけであることを確認
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_once_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()));
        let webhook = start_mock_webhook(200).await;
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(
            ForwardingEngine::new(webhook.url(), None, Duration::from_secs(10), store.clone())
                .unwrap(),
        );
        let scheduler = CompletionScheduler::new(&registry, engine.clone(), Duration::from_millis(5));
        let rounds = 20;

        let mut explicit = Vec::new();
        for round in 0..rounds {
            let id = format!("race-{round}");
            let (mut session, _) = registry.get_or_create(Some(&id)).await;
            session.append_files([store_file(store.as_ref(), &id, "a.mp3", b"A").await]);
            scheduler.schedule(&mut session);
            drop(session);

            let registry = registry.clone();
            let engine = engine.clone();
            explicit.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                engine.complete(&registry, &id).await.is_some()
            }));
        }
        for handle in explicit {
            handle.await.unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || webhook.requests().len() >= rounds).await);
        // 遅れて到着する重複がないことを確認するため少し待つ
        tokio::time::sleep(Duration::from_millis(300)).await;

        let requests = webhook.requests();
        assert_eq!(requests.len(), rounds);
        assert!(requests.iter().all(|r| r.files.len() == 1));
        assert_eq!(registry.size().await, 0);
    }

    /// ID指定のスケジュールが存在しないセッションでは何もしないことを確認
    #[tokio::test]
    async fn test_schedule_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path()));
        let webhook = start_mock_webhook(200).await;
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(
            ForwardingEngine::new(webhook.url(), None, Duration::from_secs(10), store).unwrap(),
        );
        let scheduler = CompletionScheduler::new(&registry, engine, Duration::from_millis(50));

        assert!(!scheduler.schedule_id("missing").await);

        drop(registry.get_or_create(Some("s")).await);
        assert!(scheduler.schedule_id("s").await);
        assert!(wait_until(Duration::from_secs(3), || webhook.requests().len() == 1).await);
    }
}
