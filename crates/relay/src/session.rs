//! # セッションレジストリ
//!
//! セッションID → セッション状態のプロセス内マップ。
//!
//! ## 排他制御
//! - セッションごとに `tokio::sync::Mutex` を持ち、同一IDへの操作（追加・マージ・タイマー再設定・削除）を直列化する。
//! - ID → スロットのマップ自体のロックはルックアップの間だけ保持し、I/O中には保持しない。
//!   異なるIDの操作が互いをブロックすることはない。
//!
//! ## 状態遷移
//! `ACTIVE`（マップに存在）→ `COMPLETING`（`remove` で取り出し済み、転送中）→ 消滅。
//! 取り出しは `remove`（IDで指定）か `detach`（ロック保持中のハンドルを渡す）のどちらか一方のみが成功し、
//! 同一セッションが転送処理に引き渡されるのは高々1回。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use relay_types::SessionMetadata;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::AbortHandle;

/// 受理済みの1ファイル。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// 保存先パス（セッションディレクトリ配下）
    pub storage_path: PathBuf,
    /// 呼び出し元が指定したファイル名。転送時にそのまま使用する。
    pub original_name: String,
    /// MIMEタイプ
    pub content_type: String,
    /// バイト長
    pub size: u64,
}

/// タイマー発火時に呼ばれるコールバックの戻り値。
pub type FireFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// タイマー発火時のコールバック。引数はセッションID。
pub type FireCallback = Arc<dyn Fn(String) -> FireFuture + Send + Sync>;

/// 設定中の完了タイマー。
struct PendingTimer {
    abort: AbortHandle,
    duration: Duration,
    on_fire: FireCallback,
}

/// 1つの論理的なマルチファイルアップロード。
pub struct Session {
    pub id: String,
    /// 到着順。同名ファイルも重複排除しない。
    pub files: Vec<FileRecord>,
    pub metadata: SessionMetadata,
    pub created_at: SystemTime,
    pending_timer: Option<PendingTimer>,
    /// `detach` 後にスロットに残る抜け殻
    retired: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("files", &self.files)
            .field("metadata", &self.metadata)
            .field("created_at", &self.created_at)
            .field("timer_armed", &self.timer_armed())
            .finish()
    }
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            files: Vec::new(),
            metadata: SessionMetadata::default(),
            created_at: SystemTime::now(),
            pending_timer: None,
            retired: false,
        }
    }

    fn tombstone(id: String) -> Self {
        Self {
            retired: true,
            ..Self::new(id)
        }
    }

    /// 完了タイマーが設定されているか。
    pub fn timer_armed(&self) -> bool {
        self.pending_timer.is_some()
    }

    /// ファイルを到着順に追加する。タイマー設定中なら無操作時間をリセットする。
    pub fn append_files(&mut self, files: impl IntoIterator<Item = FileRecord>) {
        self.files.extend(files);
        self.touch();
    }

    /// 空でないメタデータを上書きする。タイマー設定中なら無操作時間をリセットする。
    pub fn merge_metadata(&mut self, partial: &SessionMetadata) {
        self.metadata.merge(partial);
        self.touch();
    }

    /// 既存のタイマーを取り消し、`duration` 後に一度だけ `on_fire` を呼ぶタイマーを設定する。
    ///
    /// コールバックは別タスクで起動されるため、発火後のタイマー取り消しが
    /// 実行中の転送を中断することはない。
    ///
    /// 発火済み（コールバック起動済み）のタイマーは以後の `touch` では止まらない。
    /// 発火とほぼ同時に届いたリクエストは、応答後すぐにそのコールバックによって転送されうる。
    /// ただし、そのリクエストが `detach` で自ら取り出した場合はコールバック側が `None` を受け取り何もしない。
    pub fn arm_timer(&mut self, duration: Duration, on_fire: FireCallback) {
        self.cancel_timer();

        let id = self.id.clone();
        let callback = on_fire.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tokio::spawn(callback(id));
        });

        self.pending_timer = Some(PendingTimer {
            abort: handle.abort_handle(),
            duration,
            on_fire,
        });
    }

    /// 設定中のタイマーを取り消す。
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            timer.abort.abort();
        }
    }

    /// 設定中のタイマーを同じ時間・コールバックで張り直す。
    fn touch(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            timer.abort.abort();
            self.arm_timer(timer.duration, timer.on_fire);
        }
    }
}

/// `None` は `remove` 済み（転送処理に引き渡し済み）を表す。
type Slot = Arc<Mutex<Option<Session>>>;

/// セッションの排他ロックを保持したハンドル。
///
/// ドロップするまで同一セッションへの他の操作（`remove` を含む）は待機する。
pub struct SessionGuard {
    slot: Slot,
    guard: OwnedMappedMutexGuard<Option<Session>, Session>,
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

/// 取り出し済みでなければセッションのロックを返す。
async fn lock_live(slot: Slot) -> Option<SessionGuard> {
    let guard = slot.clone().lock_owned().await;
    OwnedMutexGuard::try_map(guard, |session| session.as_mut().filter(|s| !s.retired))
        .ok()
        .map(|guard| SessionGuard { slot, guard })
}

/// セッションレジストリ。
///
/// 起動時に1つ構築して `RelayState` に保持する。テストではケースごとに独立に構築できる。
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// セッションを取得または作成し、そのロックを返す。
    ///
    /// - `id` あり・存在する → 既存セッション
    /// - `id` あり・存在しない → そのIDで新規作成
    /// - `id` なし（または空） → UUIDを発行して新規作成
    ///
    /// 戻り値の `bool` は新規作成されたかどうか。
    pub async fn get_or_create(&self, id: Option<&str>) -> (SessionGuard, bool) {
        let id = id
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        loop {
            let (slot, is_new) = {
                let mut sessions = self.sessions.lock().await;
                match sessions.get(&id) {
                    Some(slot) => (slot.clone(), false),
                    None => {
                        let slot: Slot = Arc::new(Mutex::new(Some(Session::new(id.clone()))));
                        sessions.insert(id.clone(), slot.clone());
                        (slot, true)
                    }
                }
            };

            if let Some(guard) = lock_live(slot).await {
                return (guard, is_new);
            }

            // ルックアップ後にremoveされた。同じIDで新しいセッションを作り直す。
            tracing::debug!(session_id = %id, "転送に引き渡されたセッションを検出、新規作成します");
        }
    }

    /// 既存セッションのロックを取得する。存在しなければ `None`。
    async fn lock_existing(&self, id: &str) -> Option<SessionGuard> {
        let slot = self.sessions.lock().await.get(id).cloned()?;
        lock_live(slot).await
    }

    /// ファイルを追加する。セッションが既に存在しない場合は何もせず `false` を返す。
    pub async fn append_files(&self, id: &str, files: Vec<FileRecord>) -> bool {
        match self.lock_existing(id).await {
            Some(mut session) => {
                session.append_files(files);
                true
            }
            None => {
                tracing::warn!(
                    session_id = %id,
                    files = files.len(),
                    "転送済みセッションへの遅延到着を無視しました"
                );
                false
            }
        }
    }

    /// メタデータをマージする。セッションが既に存在しない場合は `false`。
    pub async fn merge_metadata(&self, id: &str, partial: &SessionMetadata) -> bool {
        match self.lock_existing(id).await {
            Some(mut session) => {
                session.merge_metadata(partial);
                true
            }
            None => {
                tracing::warn!(session_id = %id, "転送済みセッションへのメタデータ更新を無視しました");
                false
            }
        }
    }

    /// 完了タイマーを（再）設定する。セッションが既に存在しない場合は `false`。
    pub async fn arm_timer(&self, id: &str, duration: Duration, on_fire: FireCallback) -> bool {
        match self.lock_existing(id).await {
            Some(mut session) => {
                session.arm_timer(duration, on_fire);
                true
            }
            None => false,
        }
    }

    /// セッションをアトミックに取り出す。
    ///
    /// 実行中の同一セッションへの操作の完了を待ってから取り出し、タイマーを取り消す。
    /// 同じIDに対して2回目以降は `None` を返す。
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let slot = self.sessions.lock().await.remove(id)?;
        let mut session = slot.lock().await.take().filter(|s| !s.retired)?;
        session.cancel_timer();
        Some(session)
    }

    /// ロック保持中のセッションをそのまま取り出す。
    ///
    /// ロックを解放せずにマップから外すため、ロック待ちの他のリクエストや
    /// 発火済みタイマーの `remove` がこのセッションを受け取ることはない
    /// （待っていたリクエストは同じIDで新規セッションを作成する）。
    pub async fn detach(&self, mut guard: SessionGuard) -> Session {
        {
            let mut sessions = self.sessions.lock().await;
            // 既に `remove` がマップから外し、同じIDで別のセッションが作られている場合は触らない
            if sessions
                .get(&guard.id)
                .is_some_and(|slot| Arc::ptr_eq(slot, &guard.slot))
            {
                sessions.remove(&guard.id);
            }
        }

        let tombstone = Session::tombstone(guard.id.clone());
        let mut session = std::mem::replace(&mut *guard, tombstone);
        session.cancel_timer();
        session
    }

    /// 保持中のセッション数。
    pub async fn size(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
