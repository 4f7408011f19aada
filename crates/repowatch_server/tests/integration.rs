//! Integration tests against a running server on a loopback socket.

use repowatch_core::{
    CheckOutcome, Coordinator, EntityKey, Executor, ExecutorError, MockExecutor, OperationRunner,
    PluginState,
};
use repowatch_server::{ServerConfig, StateServer};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    executor: Arc<MockExecutor>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        let coordinator = Arc::new(Coordinator::default());
        let executor = Arc::new(MockExecutor::new());
        let runner = OperationRunner::new(
            Arc::clone(&coordinator),
            Arc::clone(&executor) as Arc<dyn Executor>,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = StateServer::new(Arc::clone(&coordinator), runner, config);
        tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            coordinator,
            executor,
            shutdown: Some(tx),
        }
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();

        let status = text[9..12].parse().unwrap();
        let (_, payload) = text.split_once("\r\n\r\n").unwrap();
        let value = serde_json::from_str(payload).unwrap_or(Value::Null);
        (status, value)
    }

    /// Opens the change stream and returns the socket after the headers.
    async fn open_stream(&self, last_event_id: Option<u64>) -> TcpStream {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let resume = last_event_id
            .map(|id| format!("Last-Event-ID: {id}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "GET /events HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n{resume}\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Reads from the stream until `needle` shows up. Field separators are
/// normalized to `name:value` so needles do not depend on spacing.
async fn read_until(stream: &mut TcpStream, buffer: &mut String, needle: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 4096];
    while !buffer.contains(needle) {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for stream data")
            .unwrap();
        assert!(read > 0, "stream closed before {needle:?}");
        buffer.push_str(&String::from_utf8_lossy(&chunk[..read]));
        *buffer = buffer.replace(": ", ":");
    }
}

fn widget() -> EntityKey {
    EntityKey::parse("acme/widget").unwrap()
}

#[tokio::test]
async fn health_and_listing() {
    let server = TestServer::start(ServerConfig::default()).await;
    server
        .coordinator
        .request_transition(&widget(), PluginState::Checking, None, false)
        .unwrap();

    let (status, body) = server.request("GET", "/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["entities"], 1);
    assert_eq!(body["latest_sequence"], 1);

    let (status, body) = server.request("GET", "/entities", None).await;
    assert_eq!(status, 200);
    assert_eq!(body[0]["entity"], "acme/widget");
    assert_eq!(body[0]["state"], "checking");
}

#[tokio::test]
async fn transitions_over_http() {
    let server = TestServer::start(ServerConfig::default()).await;

    let (status, body) = server
        .request(
            "POST",
            "/entities/acme/widget/transition",
            Some(json!({ "to": "available" })),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["to"], "available");

    // Illegal transitions are not errors.
    let (status, body) = server
        .request(
            "POST",
            "/entities/acme/widget/transition",
            Some(json!({ "to": "checking" })),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["to"], "available");

    let (status, body) = server
        .request(
            "POST",
            "/entities/acme/widget/transition",
            Some(json!({ "to": "enriching" })),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("enriching"));

    let (status, body) = server.request("GET", "/events/log?limit=10", None).await;
    assert_eq!(status, 200);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["status"], "rejected");
}

#[tokio::test]
async fn invalid_key_is_bad_request() {
    let server = TestServer::start(ServerConfig::default()).await;
    let (status, body) = server.request("GET", "/entities/acme/wid%20get", None).await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("invalid entity key"));
}

#[tokio::test]
async fn busy_entity_is_conflict() {
    let server = TestServer::start(ServerConfig::default()).await;
    let _guard = server.coordinator.lease_guard(&widget()).unwrap();

    let (status, body) = server
        .request("POST", "/entities/acme/widget/recheck", None)
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"], "operation already in progress for acme/widget");
}

#[tokio::test]
async fn operations_and_refresh() {
    let server = TestServer::start(ServerConfig::default()).await;
    server.executor.push_check(Ok(CheckOutcome::Available));

    let (status, body) = server
        .request("POST", "/entities/acme/widget/recheck", None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["state"], "available");

    let (_, body) = server
        .request("POST", "/entities/acme/widget/install", None)
        .await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["state"], "installed_inactive");

    server
        .executor
        .push_activate(Err(ExecutorError::new("plugin raised a fatal error")));
    let (_, body) = server
        .request("POST", "/entities/acme/widget/activate", None)
        .await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["type"], "activation");

    let (status, body) = server
        .request(
            "PUT",
            "/entities/acme/widget/metadata/protected",
            Some(json!(true)),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["previous"], Value::Null);

    let (status, body) = server
        .request("GET", "/entities/acme/widget/refresh", None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["repository"], "acme/widget");
    assert_eq!(body["state"], "error");
    assert_eq!(body["metadata"]["protected"], true);
    assert_eq!(body["error"]["guidance"]["title"], "Activation failed");
    assert!(body["html"].as_str().unwrap().contains("protected"));

    let (status, _) = server
        .request(
            "PUT",
            "/entities/acme/widget/metadata/state",
            Some(json!("installed_active")),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = server
        .request("DELETE", "/entities/acme/widget/metadata/protected", None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["previous"], true);
}

#[tokio::test]
async fn stream_replays_then_pushes_live() {
    let server = TestServer::start(ServerConfig::default()).await;
    server
        .coordinator
        .request_transition(&widget(), PluginState::Checking, None, false)
        .unwrap();

    let mut stream = server.open_stream(None).await;
    let mut buffer = String::new();
    read_until(&mut stream, &mut buffer, "id:1\n").await;
    assert!(buffer.contains("200 OK"));
    assert!(buffer.contains("text/event-stream"));
    assert!(buffer.contains("event:state_change"));
    assert!(buffer.contains(r#""repository":"acme/widget""#));

    // Rejected attempts are not pushed.
    server
        .coordinator
        .request_transition(&widget(), PluginState::InstalledActive, None, false)
        .unwrap();
    server
        .coordinator
        .request_transition(&widget(), PluginState::Available, None, false)
        .unwrap();

    read_until(&mut stream, &mut buffer, "id:3\n").await;
    assert!(!buffer.contains("id:2\n"));
    assert!(buffer.contains(r#""to":"available""#));
}

#[tokio::test]
async fn stream_resumes_after_last_event_id() {
    let server = TestServer::start(ServerConfig::default()).await;
    for to in [
        PluginState::Checking,
        PluginState::Available,
        PluginState::Installing,
    ] {
        server
            .coordinator
            .request_transition(&widget(), to, None, false)
            .unwrap();
    }

    let mut stream = server.open_stream(Some(2)).await;
    let mut buffer = String::new();
    read_until(&mut stream, &mut buffer, "id:3\n").await;
    assert!(!buffer.contains("id:1\n"));
    assert!(!buffer.contains("id:2\n"));
    assert!(buffer.contains(r#""to":"installing""#));
}

#[tokio::test]
async fn disabled_stream_is_not_found() {
    let server = TestServer::start(ServerConfig::default().with_stream(false)).await;
    let (status, body) = server.request("GET", "/events", None).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "change stream is disabled");
}
