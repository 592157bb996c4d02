//! テスト用の共通ヘルパー（モックWebhook・テスト用状態・multipartリクエスト生成）。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::config::{RelayConfig, RelayState};
use crate::error::RelayError;
use crate::session::FileRecord;
use crate::storage::{BlobStore, ByteStream, LocalBlobStore};

/// モックWebhookが受信したファイルパート。
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// モックWebhookが受信したリクエスト。
#[derive(Debug, Clone, Default)]
pub struct ReceivedRequest {
    pub files: Vec<ReceivedFile>,
    pub fields: Vec<(String, String)>,
    pub authorization: Option<String>,
}

impl ReceivedRequest {
    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }
}

#[derive(Clone)]
struct MockState {
    status: StatusCode,
    /// 受信記録後、応答を返すまでの遅延
    delay: Duration,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

/// 受信内容を記録し、固定ステータスを返すWebhook。
pub struct MockWebhook {
    port: u16,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockWebhook {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/hook", self.port)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.received.lock().unwrap().clone()
    }
}

async fn record_request(
    State(state): State<MockState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> StatusCode {
    let mut request = ReceivedRequest {
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };

    // パートが0件のフォームでも受信記録は残す
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                assert_eq!(name, "files");
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.unwrap().to_vec();
                request.files.push(ReceivedFile {
                    name: file_name,
                    content_type,
                    data,
                });
            }
            None => {
                let value = field.text().await.unwrap();
                request.fields.push((name, value));
            }
        }
    }

    state.received.lock().unwrap().push(request);
    tokio::time::sleep(state.delay).await;
    state.status
}

/// モックWebhookを起動する。
pub async fn start_mock_webhook(status: u16) -> MockWebhook {
    start_slow_webhook(status, Duration::ZERO).await
}

/// 受信を記録してから `delay` 後に応答するモックWebhookを起動する。
pub async fn start_slow_webhook(status: u16, delay: Duration) -> MockWebhook {
    let received = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        status: StatusCode::from_u16(status).unwrap(),
        delay,
        received: received.clone(),
    };
    let app = axum::Router::new()
        .route("/hook", axum::routing::post(record_request))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockWebhook { port, received }
}

/// Blob Storeにファイルを保存し、対応するFileRecordを返す。
pub async fn store_file(store: &dyn BlobStore, session_id: &str, name: &str, data: &[u8]) -> FileRecord {
    let storage_path = store
        .put(session_id, name, Bytes::copy_from_slice(data))
        .await
        .unwrap();
    FileRecord {
        storage_path,
        original_name: name.to_string(),
        content_type: "audio/mpeg".to_string(),
        size: data.len() as u64,
    }
}

/// 指定回目の `put` を失敗させる・遅らせるBlob Store。それ以外はローカルディスクに委譲する。
pub struct FaultyBlobStore {
    inner: LocalBlobStore,
    /// 失敗させる `put` の回数目（1始まり）
    fail_on: Option<usize>,
    put_delay: Duration,
    puts: AtomicUsize,
}

impl FaultyBlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalBlobStore::new(root),
            fail_on: None,
            put_delay: Duration::ZERO,
            puts: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, nth_put: usize) -> Self {
        self.fail_on = Some(nth_put);
        self
    }

    pub fn with_put_delay(mut self, put_delay: Duration) -> Self {
        self.put_delay = put_delay;
        self
    }
}

#[async_trait::async_trait]
impl BlobStore for FaultyBlobStore {
    async fn put(&self, session_id: &str, file_name: &str, data: Bytes) -> Result<PathBuf, RelayError> {
        let nth = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.put_delay).await;
        if self.fail_on == Some(nth) {
            return Err(RelayError::Storage(format!("ディスクフル: {file_name}")));
        }
        self.inner.put(session_id, file_name, data).await
    }

    async fn open(&self, path: &Path) -> Result<(ByteStream, u64), RelayError> {
        self.inner.open(path).await
    }

    async fn delete_files(&self, session_id: &str, paths: &[PathBuf]) -> Result<(), RelayError> {
        self.inner.delete_files(session_id, paths).await
    }
}

/// 条件が真になるまでポーリングする。タイムアウトした場合は `false`。
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// テスト用の設定（タイマーが途中で発火しない長めの無操作タイムアウト）。
pub fn test_config(webhook_url: &str, root: &Path) -> RelayConfig {
    RelayConfig {
        port: 0,
        upload_dir: root.to_path_buf(),
        webhook_url: webhook_url.to_string(),
        webhook_auth_token: None,
        session_timeout: Duration::from_secs(30),
        max_file_size: 1024 * 1024,
        max_files_per_session: 10,
        cleanup_max_age: Duration::from_secs(3600),
        forward_timeout: Duration::from_secs(10),
    }
}

pub fn test_state(webhook_url: &str, root: &Path) -> Arc<RelayState> {
    test_state_with(webhook_url, root, |_| {})
}

/// 設定を書き換えてから共有状態を構築する。
pub fn test_state_with(
    webhook_url: &str,
    root: &Path,
    customize: impl FnOnce(&mut RelayConfig),
) -> Arc<RelayState> {
    let mut config = test_config(webhook_url, root);
    customize(&mut config);
    Arc::new(RelayState::from_config(&config).unwrap())
}

/// 任意のBlob Storeで共有状態を構築する。
pub fn test_state_with_store(
    webhook_url: &str,
    blob_store: Arc<dyn BlobStore>,
    customize: impl FnOnce(&mut RelayConfig),
) -> Arc<RelayState> {
    let mut config = test_config(webhook_url, Path::new("."));
    customize(&mut config);
    Arc::new(RelayState::new(&config, blob_store).unwrap())
}

/// multipartフォームの1パート。
pub enum FormPart<'a> {
    Text(&'a str, &'a str),
    /// (ファイル名, Content-Type, 内容)
    File(&'a str, &'a str, &'a [u8]),
}

const TEST_BOUNDARY: &str = "relay-test-boundary";

/// `POST /upload` のmultipartリクエストを組み立てる。
pub fn multipart_request(parts: &[FormPart<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{TEST_BOUNDARY}\r\n").as_bytes());
        match part {
            FormPart::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            FormPart::File(file_name, content_type, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\n\
                         Content-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{TEST_BOUNDARY}--\r\n").as_bytes());

    Request::post("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={TEST_BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

/// レスポンスボディをJSONとしてデコードする。
pub async fn read_json<T: DeserializeOwned>(response: Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
