use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use lookout_core::agent::AgentRecord;

pub const TEST_PASSWORD: &str = "sekret";
const SESSION_COOKIE: &str = "lookout_session=1";

/// In-process stub gateway speaking the manage/auth API the client consumes.
/// Streams are controllable from the test: push lines, end with the
/// sentinel, or kill the subscription to simulate a transport drop.
pub struct TestGateway {
    pub addr: SocketAddr,
    state: GatewayState,
    _serve: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct GatewayState {
    roster: Arc<RwLock<Vec<AgentRecord>>>,
    forwarders: Arc<RwLock<HashMap<String, ForwarderSlot>>>,
    created: Arc<RwLock<Vec<String>>>,
    unauthorized: Arc<AtomicBool>,
}

#[derive(Default)]
struct ForwarderSlot {
    current: Option<mpsc::UnboundedSender<String>>,
}

impl TestGateway {
    pub async fn new() -> Self {
        let state = GatewayState {
            roster: Arc::new(RwLock::new(Vec::new())),
            forwarders: Arc::new(RwLock::new(HashMap::new())),
            created: Arc::new(RwLock::new(Vec::new())),
            unauthorized: Arc::new(AtomicBool::new(false)),
        };

        let app = Router::new()
            .route("/api/v1/auth/login", axum::routing::post(auth_login))
            .route("/api/v1/auth/logout", axum::routing::post(auth_logout))
            .route("/api/v1/auth/check", axum::routing::get(auth_check))
            .route("/api/v1/manage/data", axum::routing::get(get_roster))
            .route("/api/v1/manage/data", axum::routing::delete(delete_record))
            .route("/api/v1/manage/connect", axum::routing::post(connect_agent))
            .route(
                "/api/v1/manage/forwarder/{id}",
                axum::routing::get(stream_forwarder),
            )
            .route(
                "/api/v1/manage/forwarder/{id}",
                axum::routing::delete(release_forwarder),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serve = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            state,
            _serve: serve,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    pub async fn set_roster(&self, agents: Vec<AgentRecord>) {
        *self.state.roster.write().await = agents;
    }

    pub async fn roster_names(&self) -> Vec<String> {
        self.state
            .roster
            .read()
            .await
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn set_unauthorized(&self, value: bool) {
        self.state.unauthorized.store(value, Ordering::SeqCst);
    }

    /// Forwarder ids issued so far, in creation order.
    pub async fn issued_forwarders(&self) -> Vec<String> {
        self.state.created.read().await.clone()
    }

    pub async fn forwarder_count(&self) -> usize {
        self.state.forwarders.read().await.len()
    }

    /// Push one payload line to the active subscription of a forwarder.
    pub async fn push_line(&self, forwarder_id: &str, line: &str) {
        let forwarders = self.state.forwarders.read().await;
        let slot = forwarders.get(forwarder_id).expect("unknown forwarder");
        slot.current
            .as_ref()
            .expect("no active subscription")
            .send(line.to_string())
            .unwrap();
    }

    /// End the stream normally with the sentinel frame.
    pub async fn end_stream(&self, forwarder_id: &str) {
        self.push_line(forwarder_id, "[STREAM_END]").await;
    }

    /// Drop the active subscription without the sentinel, simulating a
    /// transport failure. The forwarder stays addressable for reconnects.
    pub async fn kill_stream(&self, forwarder_id: &str) {
        let mut forwarders = self.state.forwarders.write().await;
        if let Some(slot) = forwarders.get_mut(forwarder_id) {
            slot.current = None;
        }
    }

    /// Release a forwarder server-side, as an agent-initiated close would.
    pub async fn remove_forwarder(&self, forwarder_id: &str) {
        self.state.forwarders.write().await.remove(forwarder_id);
    }

    /// Wait until a forwarder has an active subscription.
    pub async fn wait_for_subscriber(&self, forwarder_id: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let forwarders = self.state.forwarders.read().await;
                    if let Some(slot) = forwarders.get(forwarder_id)
                        && slot.current.is_some()
                    {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a subscriber");
    }
}

pub fn agent(name: &str, polled_time: f64) -> AgentRecord {
    AgentRecord {
        name: name.to_string(),
        polled_time,
        uptime: None,
        cpu_usage: None,
        memory_usage: None,
        disk_usage: None,
        temperature: None,
    }
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "message": "unauthenticated" })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct LoginBody {
    password: String,
}

async fn auth_login(Json(body): Json<LoginBody>) -> Response {
    if body.password == TEST_PASSWORD {
        (
            StatusCode::OK,
            [(header::SET_COOKIE, format!("{SESSION_COOKIE}; Path=/"))],
            Json(serde_json::json!({ "message": "ok", "authenticated": true })),
        )
            .into_response()
    } else {
        unauthorized_response()
    }
}

async fn auth_logout() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "message": "logged out" })),
    )
        .into_response()
}

async fn auth_check(headers: HeaderMap) -> Response {
    let has_session = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|cookies| cookies.contains(SESSION_COOKIE));
    if has_session {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "authenticated": true })),
        )
            .into_response()
    } else {
        unauthorized_response()
    }
}

async fn get_roster(State(state): State<GatewayState>) -> Response {
    if state.unauthorized.load(Ordering::SeqCst) {
        return unauthorized_response();
    }
    let roster = state.roster.read().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "data": &*roster })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

async fn delete_record(
    State(state): State<GatewayState>,
    Json(body): Json<NameBody>,
) -> Response {
    if state.unauthorized.load(Ordering::SeqCst) {
        return unauthorized_response();
    }
    let mut roster = state.roster.write().await;
    let before = roster.len();
    roster.retain(|a| a.name != body.name);
    let message = if roster.len() < before {
        format!("Data for '{}' deleted successfully", body.name)
    } else {
        "No data found to delete".to_string()
    };
    (StatusCode::OK, Json(serde_json::json!({ "message": message }))).into_response()
}

async fn connect_agent(
    State(state): State<GatewayState>,
    Json(body): Json<NameBody>,
) -> Response {
    if state.unauthorized.load(Ordering::SeqCst) {
        return unauthorized_response();
    }
    let known = state
        .roster
        .read()
        .await
        .iter()
        .any(|a| a.name == body.name);
    if !known {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "message": "agent unknown" })),
        )
            .into_response();
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    state
        .forwarders
        .write()
        .await
        .insert(id.clone(), ForwarderSlot::default());
    state.created.write().await.push(id.clone());
    (
        StatusCode::OK,
        Json(serde_json::json!({ "forwarderId": id })),
    )
        .into_response()
}

async fn stream_forwarder(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    if state.unauthorized.load(Ordering::SeqCst) {
        return Err(unauthorized_response());
    }
    let mut forwarders = state.forwarders.write().await;
    let slot = forwarders.get_mut(&id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "detail": "Job not found" })),
        )
            .into_response()
    })?;
    let (tx, rx) = mpsc::unbounded_channel();
    slot.current = Some(tx);
    let stream = UnboundedReceiverStream::new(rx)
        .map(|line| Ok(SseEvent::default().data(line)));
    Ok(Sse::new(stream))
}

async fn release_forwarder(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    if state.unauthorized.load(Ordering::SeqCst) {
        return unauthorized_response();
    }
    if state.forwarders.write().await.remove(&id).is_some() {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "message": "Job cancelled successfully" })),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "detail": "Job not found" })),
        )
            .into_response()
    }
}
