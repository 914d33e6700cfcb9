//! In-process fake of the media-analysis service.
//!
//! Serves the HTTP contract and a Socket.IO endpoint on an ephemeral port so
//! the real `HttpMediaService` and `SocketIoConnector` can be exercised
//! without a running service.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use lookout_core::config::{Config, ServiceConfig};

pub const NAMESPACE: &str = "/stream";

/// A request the fake service received.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Health,
    Cleanup,
    DetectImage {
        field: String,
        file_name: String,
        content_type: String,
        len: usize,
        conf_threshold: String,
    },
    SubmitVideo {
        field: String,
        file_name: String,
        len: usize,
        conf_threshold: String,
        save_output: String,
    },
    VideoStatus(String),
    StartStream { conf_threshold: String },
    StopStream(String),
    Artifact(String),
}

/// How the fake Socket.IO endpoint behaves for new connections.
#[derive(Debug, Clone)]
pub struct SocketBehavior {
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Send pings at all. Without them the client gives up after the deadline.
    pub send_pings: bool,
    /// Answer the namespace join with a connect error.
    pub refuse_namespace: bool,
}

impl Default for SocketBehavior {
    fn default() -> Self {
        Self {
            ping_interval_ms: 25_000,
            ping_timeout_ms: 20_000,
            send_pings: true,
            refuse_namespace: false,
        }
    }
}

/// Canned response of the fake service.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Value),
    /// Failed envelope with the given HTTP status.
    Fail(StatusCode, &'static str, String),
    /// Non-envelope body with the given HTTP status.
    Raw(StatusCode, String),
}

pub struct FakeState {
    received: Mutex<Vec<Received>>,
    statuses: Mutex<VecDeque<Value>>,
    image_reply: Mutex<Option<Reply>>,
    video_reply: Mutex<Option<Reply>>,
    start_reply: Mutex<Option<Reply>>,
    health_delay: Mutex<Option<Duration>>,
    socket: Mutex<SocketBehavior>,
    /// Client-to-server Engine.IO packets, in order.
    packets: Mutex<Vec<String>>,
    /// Server-to-client Engine.IO packets for every open socket.
    outbound: broadcast::Sender<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl FakeState {
    fn new() -> Self {
        let (outbound, _) = broadcast::channel(64);
        Self {
            received: Mutex::new(Vec::new()),
            statuses: Mutex::new(VecDeque::new()),
            image_reply: Mutex::new(None),
            video_reply: Mutex::new(None),
            start_reply: Mutex::new(None),
            health_delay: Mutex::new(None),
            socket: Mutex::new(SocketBehavior::default()),
            packets: Mutex::new(Vec::new()),
            outbound,
        }
    }

    fn record(&self, request: Received) {
        lock(&self.received).push(request);
    }
}

/// Handle to a running fake service.
pub struct FakeService {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeService {
    /// Bind an ephemeral port and start serving.
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::new());
        let router = Router::new()
            .route("/api/v1/health", get(health))
            .route("/api/v1/cleanup", post(cleanup))
            .route("/api/v1/detect/image", post(detect_image))
            .route("/api/v1/detect/video", post(submit_video))
            .route("/api/v1/detect/video/status/{task_id}", get(video_status))
            .route("/api/v1/stream/start", post(start_stream))
            .route("/api/v1/stream/stop/{stream_id}", post(stop_stream))
            .route("/static/results/{name}", get(artifact))
            .route("/socket.io/", get(socket))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake service");
        let addr = listener.local_addr().expect("Failed to read local address");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("Fake service stopped");
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            base_url: self.base_url(),
            request_timeout_secs: 1,
            ..Default::default()
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config {
            service: self.service_config(),
            ..Default::default()
        };
        config.stream.connect_timeout_secs = 2;
        config.video.poll_interval_ms = 50;
        config
    }

    pub fn received(&self) -> Vec<Received> {
        lock(&self.state.received).clone()
    }

    pub fn count(&self, matches: impl Fn(&Received) -> bool) -> usize {
        lock(&self.state.received).iter().filter(|r| matches(r)).count()
    }

    /// Queue `data` payloads for the status endpoint; the last one repeats.
    pub fn push_statuses(&self, statuses: Vec<Value>) {
        lock(&self.state.statuses).extend(statuses);
    }

    pub fn set_image_reply(&self, reply: Reply) {
        *lock(&self.state.image_reply) = Some(reply);
    }

    pub fn set_video_reply(&self, reply: Reply) {
        *lock(&self.state.video_reply) = Some(reply);
    }

    pub fn set_start_reply(&self, reply: Reply) {
        *lock(&self.state.start_reply) = Some(reply);
    }

    pub fn set_health_delay(&self, delay: Duration) {
        *lock(&self.state.health_delay) = Some(delay);
    }

    pub fn set_socket_behavior(&self, behavior: SocketBehavior) {
        *lock(&self.state.socket) = behavior;
    }

    /// Engine.IO packets received from clients.
    pub fn packets(&self) -> Vec<String> {
        lock(&self.state.packets).clone()
    }

    /// Send a raw Engine.IO packet to every open socket.
    pub fn send_raw(&self, packet: impl Into<String>) {
        let _ = self.state.outbound.send(packet.into());
    }

    /// Emit a Socket.IO event on the stream namespace.
    pub fn emit(&self, event: &str, payload: Value) {
        self.send_raw(format!("42{},{}", NAMESPACE, json!([event, payload])));
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn envelope(reply: Reply) -> Response {
    match reply {
        Reply::Ok(data) => Json(json!({"success": true, "data": data})).into_response(),
        Reply::Fail(status, code, message) => (
            status,
            Json(json!({"success": false, "error": {"code": code, "message": message}})),
        )
            .into_response(),
        Reply::Raw(status, body) => (status, body).into_response(),
    }
}

async fn health(State(state): State<Arc<FakeState>>) -> Response {
    state.record(Received::Health);
    let delay = *lock(&state.health_delay);
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    envelope(Reply::Ok(json!({"status": "healthy"})))
}

async fn cleanup(State(state): State<Arc<FakeState>>) -> Response {
    state.record(Received::Cleanup);
    envelope(Reply::Ok(json!({"status": "cleaned"})))
}

struct Upload {
    field: String,
    file_name: String,
    content_type: String,
    len: usize,
    params: Vec<(String, String)>,
}

impl Upload {
    fn param(&self, name: &str) -> String {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }
}

async fn read_upload(mut multipart: Multipart) -> Upload {
    let mut upload = Upload {
        field: String::new(),
        file_name: String::new(),
        content_type: String::new(),
        len: 0,
        params: Vec::new(),
    };

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        match field.file_name().map(|s| s.to_string()) {
            Some(file_name) => {
                upload.field = name;
                upload.file_name = file_name;
                upload.content_type = field.content_type().unwrap_or("").to_string();
                upload.len = field.bytes().await.map(|b| b.len()).unwrap_or(0);
            }
            None => {
                let text = field.text().await.unwrap_or_default();
                upload.params.push((name, text));
            }
        }
    }
    upload
}

async fn detect_image(State(state): State<Arc<FakeState>>, multipart: Multipart) -> Response {
    let upload = read_upload(multipart).await;
    state.record(Received::DetectImage {
        field: upload.field.clone(),
        file_name: upload.file_name.clone(),
        content_type: upload.content_type.clone(),
        len: upload.len,
        conf_threshold: upload.param("conf_threshold"),
    });

    let reply = lock(&state.image_reply).take();
    envelope(reply.unwrap_or_else(|| {
        Reply::Ok(json!({
            "processed_image_url": format!("/static/results/result_{}", upload.file_name),
            "detections": [
                {"class_name": "person", "confidence": 0.9312},
                {"class_name": "dog", "confidence": 0.5}
            ],
            "processing_time": 0.25
        }))
    }))
}

async fn submit_video(State(state): State<Arc<FakeState>>, multipart: Multipart) -> Response {
    let upload = read_upload(multipart).await;
    state.record(Received::SubmitVideo {
        field: upload.field.clone(),
        file_name: upload.file_name.clone(),
        len: upload.len,
        conf_threshold: upload.param("conf_threshold"),
        save_output: upload.param("save_output"),
    });

    let reply = lock(&state.video_reply).take();
    envelope(reply.unwrap_or_else(|| Reply::Ok(json!({"task_id": Uuid::new_v4().to_string()}))))
}

async fn video_status(
    State(state): State<Arc<FakeState>>,
    Path(task_id): Path<String>,
) -> Response {
    state.record(Received::VideoStatus(task_id.clone()));

    let mut statuses = lock(&state.statuses);
    let status = if statuses.len() > 1 {
        statuses.pop_front()
    } else {
        statuses.front().cloned()
    };
    match status {
        Some(status) => envelope(Reply::Ok(status)),
        None => envelope(Reply::Fail(
            StatusCode::NOT_FOUND,
            "status_error",
            format!("Task with ID {} not found", task_id),
        )),
    }
}

async fn start_stream(
    State(state): State<Arc<FakeState>>,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    let conf_threshold = params
        .into_iter()
        .find(|(k, _)| k == "conf_threshold")
        .map(|(_, v)| v)
        .unwrap_or_default();
    state.record(Received::StartStream { conf_threshold });

    let reply = lock(&state.start_reply).take();
    envelope(reply.unwrap_or_else(|| Reply::Ok(json!({"stream_id": "stream-abc"}))))
}

async fn stop_stream(
    State(state): State<Arc<FakeState>>,
    Path(stream_id): Path<String>,
) -> Response {
    state.record(Received::StopStream(stream_id.clone()));
    envelope(Reply::Ok(json!({"stream_id": stream_id, "status": "stopped"})))
}

async fn artifact(State(state): State<Arc<FakeState>>, Path(name): Path<String>) -> Response {
    state.record(Received::Artifact(name.clone()));
    if name.starts_with("missing") {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    (StatusCode::OK, format!("bytes of {}", name)).into_response()
}

async fn socket(ws: WebSocketUpgrade, State(state): State<Arc<FakeState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<FakeState>) {
    let behavior = lock(&state.socket).clone();
    let mut outbound = state.outbound.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let open = json!({
        "sid": Uuid::new_v4().to_string(),
        "upgrades": [],
        "pingInterval": behavior.ping_interval_ms,
        "pingTimeout": behavior.ping_timeout_ms,
        "maxPayload": 1_000_000
    });
    if sender
        .send(Message::Text(format!("0{}", open).into()))
        .await
        .is_err()
    {
        return;
    }

    let mut ping = tokio::time::interval(Duration::from_millis(behavior.ping_interval_ms));
    ping.tick().await;

    loop {
        let reply = tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                lock(&state.packets).push(text.clone());

                if text == format!("40{},", NAMESPACE) {
                    if behavior.refuse_namespace {
                        Some(format!("44{},{}", NAMESPACE, json!({"message": "Not allowed"})))
                    } else {
                        Some(format!("40{},{}", NAMESPACE, json!({"sid": Uuid::new_v4().to_string()})))
                    }
                } else {
                    None
                }
            }
            packet = outbound.recv() => match packet {
                Ok(packet) => Some(packet),
                Err(broadcast::error::RecvError::Lagged(_)) => None,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ping.tick(), if behavior.send_pings => Some("2".to_string()),
        };

        if let Some(reply) = reply {
            if sender.send(Message::Text(reply.into())).await.is_err() {
                break;
            }
        }
    }
}
