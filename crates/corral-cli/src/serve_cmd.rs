//! `corral serve`: the HTTP API and the agent control channel.
//!
//! Both run in one process around a shared [`Coordinator`]. The API listens
//! on `api_port`; agents connect to `cc_port`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use corral_core::coordinator::{CancelOutcome, CoordinatorStatus};
use corral_core::leader::{AlwaysLeader, LeaseBackend, PgLease, holder_identity};
use corral_core::token::guard;
use corral_core::{Coordinator, CoordinatorError, TaskId};
use corral_db::models::{Agent, Task, TaskType};
use corral_db::queries::tasks::TaskCounts;
use corral_db::queries::{pools as pool_db, tasks as task_db, workspaces as workspace_db};

use crate::config::CorralConfig;
use crate::ws;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::AuthFailed(_) => Self::unauthorized(err.to_string()),
            CoordinatorError::NotConnected(_) => Self::conflict(err.to_string()),
            CoordinatorError::Store(e) => Self::internal(e),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<guard::GuardError> for AppError {
    fn from(err: guard::GuardError) -> Self {
        Self::unauthorized(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub task_type: Option<TaskType>,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    #[serde(flatten)]
    pub agent: Agent,
    /// Whether the agent has a live control session on this process.
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub coordinator: CoordinatorStatus,
    pub tasks: TaskCounts,
}

#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    pub agent_id: String,
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

/// End-user and operator API.
pub fn build_api_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/v1/agents/register", post(register_agent))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/tasks/{id}", get(get_task))
        .route("/api/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/api/v1/tasks/{id}/output", get(task_output))
        .route("/api/v1/tasks/{id}/output/text", get(task_output_text))
        .route("/api/v1/pools/{id}/credentials/refresh", post(refresh_credentials))
        .route("/api/v1/pools/{id}/credentials/acks", get(credential_acks))
        .route("/api/v1/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

/// Agent control channel.
pub fn build_control_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/api/v1/agents/control", get(control_channel))
        .with_state(coordinator)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, config: CorralConfig) -> Result<()> {
    let CorralConfig {
        token_config,
        server,
        coordinator: coordinator_config,
        holder_identity: holder,
        ..
    } = config;

    let backend: Arc<dyn LeaseBackend> = match &coordinator_config.lease_name {
        Some(name) => {
            info!(lease = %name, "leader election through the database lease");
            Arc::new(PgLease::new(pool.clone()))
        }
        None => {
            warn!("no lease name configured; running as the sole leader");
            Arc::new(AlwaysLeader)
        }
    };
    let holder = holder.unwrap_or_else(holder_identity);

    let coordinator = Coordinator::new(pool, token_config, coordinator_config);
    let cancel = CancellationToken::new();

    let api_addr: SocketAddr = format!("{}:{}", server.bind, server.api_port)
        .parse()
        .with_context(|| format!("invalid api address {}:{}", server.bind, server.api_port))?;
    let cc_addr: SocketAddr = format!("{}:{}", server.bind, server.cc_port)
        .parse()
        .with_context(|| format!("invalid control address {}:{}", server.bind, server.cc_port))?;
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind api listener on {api_addr}"))?;
    let cc_listener = tokio::net::TcpListener::bind(cc_addr)
        .await
        .with_context(|| format!("failed to bind control listener on {cc_addr}"))?;

    let runner = tokio::spawn(Arc::clone(&coordinator).run(backend, holder.clone(), cancel.clone()));
    tokio::spawn(shutdown_signal(cancel.clone()));

    info!(%holder, "corral api listening on http://{api_addr}");
    info!("corral control channel listening on ws://{cc_addr}/api/v1/agents/control");

    let api = axum::serve(api_listener, build_api_router(Arc::clone(&coordinator)))
        .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let cc = axum::serve(cc_listener, build_control_router(Arc::clone(&coordinator)))
        .with_graceful_shutdown(cancel.clone().cancelled_owned());
    let (api_result, cc_result) = tokio::join!(api, cc);

    cancel.cancel();
    if let Err(e) = runner.await {
        error!(error = %e, "coordinator task panicked");
    }
    api_result.context("api server failed")?;
    cc_result.context("control server failed")?;
    info!("corral serve shut down");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        }
    }
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

// ---------------------------------------------------------------------------
// Agent handlers
// ---------------------------------------------------------------------------

async fn register_agent(
    State(coordinator): State<Arc<Coordinator>>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<corral_core::registry::Registration>, AppError> {
    let bearer = guard::bearer_from_header(authorization(&headers))?;
    let registration = coordinator.registry().register(&body.name, bearer).await?;
    Ok(Json(registration))
}

async fn list_agents(
    State(coordinator): State<Arc<Coordinator>>,
) -> Result<Json<Vec<AgentResponse>>, AppError> {
    let agents = coordinator.registry().list().await.map_err(AppError::internal)?;
    let agents = agents
        .into_iter()
        .map(|agent| AgentResponse {
            connected: coordinator.sessions().get(&agent.agent_id).is_some(),
            agent,
        })
        .collect();
    Ok(Json(agents))
}

/// Authenticate before upgrading, so a bad credential is a plain 401.
async fn control_channel(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<ControlQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let bearer = guard::bearer_from_header(authorization(&headers))?;
    let agent = match coordinator.registry().authenticate(&query.agent_id, bearer).await {
        Ok(agent) => agent,
        Err(e) => {
            warn!(agent_id = %query.agent_id, error = %e, "control channel rejected");
            return Err(e.into());
        }
    };

    Ok(upgrade.on_upgrade(move |socket| async move {
        let (sink, source) = ws::split(socket);
        let reason = coordinator.connect_agent(&agent, sink, source).await;
        debug!(agent_id = %agent.agent_id, %reason, "control connection ended");
    }))
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

async fn submit_task(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<SubmitRequest>,
) -> Result<Response, AppError> {
    let ws = workspace_db::get_workspace(coordinator.pool(), &body.workspace_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workspace {} not found", body.workspace_id)))?;
    if ws.pool_id.is_none() {
        return Err(AppError::bad_request(format!(
            "workspace {} is not bound to a pool",
            ws.workspace_id
        )));
    }

    let task = coordinator
        .submit_task(&ws.workspace_id, body.task_type.unwrap_or(TaskType::Plan))
        .await
        .map_err(AppError::internal)?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn load_task(coordinator: &Coordinator, id: TaskId) -> Result<Task, AppError> {
    task_db::get_task(coordinator.pool(), id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))
}

async fn get_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(load_task(&coordinator, id).await?))
}

/// Only the leader runs dispatchers, so only the leader can cancel.
async fn cancel_task(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
) -> Result<Json<CancelResponse>, AppError> {
    if !coordinator.is_leader() {
        return Err(AppError::conflict("this coordinator is not the leader"));
    }
    let outcome = coordinator.cancel_task(id).await.map_err(AppError::internal)?;
    if outcome == CancelOutcome::NotFound {
        return Err(AppError::not_found(format!("task {id} not found")));
    }
    Ok(Json(CancelResponse {
        task_id: id,
        outcome,
    }))
}

async fn task_output(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let task = load_task(&coordinator, id).await?;
    let live = !task.status.is_terminal();
    Ok(upgrade.on_upgrade(move |socket| stream_output(coordinator, id, live, socket)))
}

/// Forward buffered history, then live frames until the stream ends or the
/// client goes away.
async fn stream_output(coordinator: Arc<Coordinator>, task_id: TaskId, live: bool, socket: WebSocket) {
    let client_id = Uuid::new_v4().to_string();
    let mut subscription = coordinator.subscribe_output(task_id, &client_id);
    let (mut tx, mut rx) = socket.split();

    let forwarded: Result<()> = async {
        for line in &subscription.history {
            send_json(&mut tx, serde_json::to_value(line)?).await?;
        }
        if !live {
            return Ok(());
        }
        loop {
            tokio::select! {
                event = subscription.events.recv() => match event {
                    Some(event) => send_json(&mut tx, event.to_json()).await?,
                    None => break,
                },
                incoming = rx.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        Ok(())
    }
    .await;

    coordinator.unsubscribe_output(task_id, &client_id);
    if let Err(e) = forwarded {
        debug!(task_id, client_id = %client_id, error = %e, "output subscriber dropped");
    }
    let _ = tx.send(Message::Close(None)).await;
}

async fn send_json(
    tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    value: serde_json::Value,
) -> Result<()> {
    tx.send(Message::Text(value.to_string().into()))
        .await
        .context("output subscriber write failed")
}

async fn task_output_text(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<TaskId>,
) -> Result<Response, AppError> {
    let text = coordinator
        .hub()
        .buffered_text(id)
        .ok_or_else(|| AppError::not_found(format!("no buffered output for task {id}")))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

// ---------------------------------------------------------------------------
// Pool and status handlers
// ---------------------------------------------------------------------------

async fn refresh_credentials(
    State(coordinator): State<Arc<Coordinator>>,
    Path(pool_id): Path<String>,
) -> Result<Response, AppError> {
    pool_db::get_pool(coordinator.pool(), &pool_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("pool {pool_id} not found")))?;
    let report = coordinator.broadcast_credentials(&pool_id);
    Ok(Json(report).into_response())
}

async fn credential_acks(
    State(coordinator): State<Arc<Coordinator>>,
    Path(pool_id): Path<String>,
) -> Response {
    Json(coordinator.credential_acks(&pool_id)).into_response()
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Result<Json<StatusResponse>, AppError> {
    let tasks = task_db::task_counts(coordinator.pool())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(StatusResponse {
        coordinator: coordinator.status(),
        tasks,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod control_channel_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use tokio_util::sync::CancellationToken;

    use corral_core::leader::AlwaysLeader;
    use corral_core::protocol::{
        AgentFrame, CoordinatorFrame, Heartbeat, LineKind, LogStream, TaskCompleted,
    };
    use corral_core::token::{TokenConfig, generate_pool_token};
    use corral_core::{Coordinator, CoordinatorConfig, TaskId};
    use corral_db::models::{TaskStatus, TaskType};
    use corral_db::queries::tasks as task_db;
    use corral_test_utils::{create_test_db, drop_test_db, seed_pool_and_workspace};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn serve(router: axum::Router, cancel: CancellationToken) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
                .unwrap();
        });
        addr
    }

    async fn connect_agent(
        addr: std::net::SocketAddr,
        agent_id: &str,
        token: &str,
    ) -> Result<Socket, tokio_tungstenite::tungstenite::Error> {
        let mut request = format!("ws://{addr}/api/v1/agents/control?agent_id={agent_id}")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {token}").parse().unwrap());
        connect_async(request).await.map(|(socket, _)| socket)
    }

    async fn send_frame(socket: &mut Socket, frame: AgentFrame) {
        socket
            .send(Message::Text(frame.encode().unwrap().into()))
            .await
            .unwrap();
    }

    async fn next_frame(socket: &mut Socket) -> CoordinatorFrame {
        loop {
            let msg = tokio::time::timeout(WAIT, socket.next())
                .await
                .expect("frame within timeout")
                .expect("socket open")
                .unwrap();
            if msg.is_text() {
                return CoordinatorFrame::decode(msg.to_text().unwrap()).unwrap();
            }
        }
    }

    async fn next_json(socket: &mut Socket) -> Option<serde_json::Value> {
        loop {
            let msg = tokio::time::timeout(WAIT, socket.next()).await.expect("message within timeout")?;
            match msg.unwrap() {
                Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    async fn wait_status(pool: &sqlx::PgPool, id: TaskId, status: TaskStatus) {
        tokio::time::timeout(WAIT, async {
            loop {
                let task = task_db::get_task(pool, id).await.unwrap().unwrap();
                if task.status == status {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task {id} never reached {status}"));
    }

    #[tokio::test]
    async fn agent_runs_a_task_over_websockets() {
        let (pool, db_name) = create_test_db().await;
        seed_pool_and_workspace(&pool, "p1", "ws1").await;
        let tokens = TokenConfig::new(b"ws-test-secret".to_vec());
        let config = CoordinatorConfig {
            schedule_tick: Duration::from_millis(100),
            heartbeat_check_interval: Duration::from_millis(50),
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::new(pool.clone(), tokens.clone(), config);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&coordinator).run(
            Arc::new(AlwaysLeader),
            "ws-test".to_string(),
            cancel.clone(),
        ));
        let api = serve(super::build_api_router(Arc::clone(&coordinator)), cancel.clone()).await;
        let cc = serve(super::build_control_router(Arc::clone(&coordinator)), cancel.clone()).await;

        let token = generate_pool_token(&tokens, "p1");
        let reg = coordinator.registry().register("ws-runner", &token).await.unwrap();

        let rejected = connect_agent(cc, &reg.agent_id, "corral_pt_p1_00ff").await;
        match rejected {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                assert_eq!(resp.status().as_u16(), 401);
            }
            other => panic!("expected a 401 handshake failure, got {:?}", other.map(|_| ())),
        }

        let mut agent = connect_agent(cc, &reg.agent_id, &token).await.unwrap();
        send_frame(
            &mut agent,
            AgentFrame::Heartbeat(Heartbeat {
                plan_running: 0,
                plan_limit: 3,
                apply_running: false,
                current_tasks: vec![],
                cpu_usage: 0.0,
                mem_usage: 0.0,
                status: "ok".to_string(),
                timestamp: None,
            }),
        )
        .await;
        tokio::time::timeout(WAIT, async {
            while !coordinator
                .sessions()
                .get(&reg.agent_id)
                .is_some_and(|s| s.has_heartbeat())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("heartbeat recorded");

        let task = coordinator.submit_task("ws1", TaskType::Plan).await.unwrap();
        match next_frame(&mut agent).await {
            CoordinatorFrame::RunTask(run) => assert_eq!(run.task_id, task.id),
            other => panic!("expected run_task, got {other:?}"),
        }

        let (mut viewer, _) = connect_async(format!("ws://{api}/api/v1/tasks/{}/output", task.id))
            .await
            .unwrap();
        assert_eq!(
            next_frame(&mut agent).await,
            CoordinatorFrame::StartRealtimeStream(corral_core::protocol::TaskRef { task_id: task.id })
        );

        send_frame(
            &mut agent,
            AgentFrame::LogStream(LogStream {
                task_id: task.id,
                kind: LineKind::Output,
                line: "Plan: 1 to add".to_string(),
                line_num: Some(1),
                stage: None,
                status: None,
            }),
        )
        .await;
        send_frame(&mut agent, AgentFrame::TaskCompleted(TaskCompleted { task_id: task.id })).await;

        let first = next_json(&mut viewer).await.expect("log line");
        assert_eq!(first["line"], "Plan: 1 to add");
        let last = next_json(&mut viewer).await.expect("final line");
        assert_eq!(last["type"], "completed");
        assert!(next_json(&mut viewer).await.is_none(), "stream ends after the final line");

        wait_status(&pool, task.id, TaskStatus::Succeeded).await;

        agent.close(None).await.unwrap();
        cancel.cancel();
        let _ = tokio::time::timeout(WAIT, run).await;
        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
