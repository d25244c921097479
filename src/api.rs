//! HTTP 服务层
//!
//! POST /api/chat/stream 接收查询并以 SSE 推送流程事件（10s keep-alive 防空闲断连）；
//! GET /api/conversations[/:id] 提供历史回放；DELETE 为软删除，/purge 物理清除；
//! POST /api/jobs/:job_id/reconcile 触发（或幂等跳过）渲染任务对账。
//! 客户端中途断开是正常提前终止：流程任务继续跑完并 finalize。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::flows::{FlowRequest, FlowRuntime};
use crate::jobs::{pending_job_reference, JobWatcher};
use crate::llm::OpenAiClient;
use crate::render::HttpRenderer;
use crate::store::{
    ChatStore, Conversation, ConversationStatus, ConversationSummary, MemoryChatStore,
    SqliteChatStore, StoredMessage,
};
use crate::tools::{
    ContentRetrieverTool, ContentSaverTool, McpClient, ToolExecutor, ToolRegistry, WebScraperTool,
    WebSearchTool,
};

/// 服务共享状态
pub struct AppState {
    pub runtime: Arc<FlowRuntime>,
    pub store: Arc<dyn ChatStore>,
    pub watcher: Arc<JobWatcher>,
    pub cfg: AppConfig,
}

/// 组装全部协作方：存储（SQLite / 内存）、LLM、工具、渲染客户端、任务监视器、流程运行时
pub fn build_state(cfg: AppConfig) -> anyhow::Result<Arc<AppState>> {
    let store: Arc<dyn ChatStore> = match &cfg.app.database_path {
        Some(path) => Arc::new(SqliteChatStore::open(path)?),
        None => Arc::new(MemoryChatStore::new()),
    };

    let llm = Arc::new(OpenAiClient::from_config(&cfg.llm));

    let mcp = Arc::new(McpClient::new(&cfg.tools.mcp_url, cfg.tools.call_timeout_secs));
    let mut registry = ToolRegistry::new();
    registry.register(WebSearchTool::new(Arc::clone(&mcp)));
    registry.register(WebScraperTool::new(Arc::clone(&mcp)));
    registry.register(ContentRetrieverTool::new(Arc::clone(&mcp)));
    registry.register(ContentSaverTool::new(Arc::clone(&mcp)));
    let executor = Arc::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs));

    let renderer = Arc::new(HttpRenderer::from_config(&cfg.renderer));
    let watcher = Arc::new(JobWatcher::new(
        Arc::clone(&store),
        renderer.clone(),
        &cfg.renderer,
    ));

    let runtime = Arc::new(FlowRuntime::new(
        llm,
        executor,
        renderer,
        Arc::clone(&watcher),
        Arc::clone(&store),
        cfg.flows.clone(),
        cfg.renderer.clone(),
        cfg.llm.temperature,
    ));

    Ok(Arc::new(AppState {
        runtime,
        store,
        watcher,
        cfg,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/conversations", get(list_conversations))
        .route(
            "/api/conversations/:id",
            get(get_conversation).delete(soft_delete_conversation),
        )
        .route("/api/conversations/:id/archive", post(archive_conversation))
        .route("/api/conversations/:id/purge", delete(purge_conversation))
        .route("/api/jobs/:job_id/reconcile", post(reconcile_job))
        .with_state(state)
}

/// GET /health：服务与协作方配置快照
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": state.cfg.app.name.as_deref().unwrap_or("mentor"),
        "status": "healthy",
        "collaborators": {
            "renderer": state.cfg.renderer.base_url,
            "tools": state.cfg.tools.mcp_url,
        }
    }))
}

/// POST /api/chat/stream：执行流程并以 SSE 推送事件。
/// 流程在后台任务中运行，连接断开不影响持久化收尾；
/// 终止帧（finish）发出后通道关闭，响应随之结束。
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<FlowRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)>
{
    if req.query.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "query is required".to_string()));
    }
    if req.conversation_id.is_empty() {
        req.conversation_id = uuid::Uuid::new_v4().to_string();
    }

    let rx = Arc::clone(&state.runtime).execute(req);
    let event_stream = stream::unfold(rx, |mut rx| async move {
        let ev = rx.recv().await?;
        let event = Event::default()
            .json_data(&ev)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok::<_, Infallible>(event), rx))
    });

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text(crate::stream::KEEP_ALIVE_TEXT),
    ))
}

/// GET /api/conversations：对话摘要列表（软删除不出现）
async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConversationSummary>>, (StatusCode, String)> {
    state
        .store
        .conversation_summaries()
        .await
        .map(Json)
        .map_err(internal)
}

/// GET /api/conversations/:id：完整消息与步骤日志，供回放重建。
/// 回放方对每条智能体消息做 pending_job_reference 检查即可重入对账。
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, (StatusCode, String)> {
    let conv = state.store.conversation(&id).await.map_err(internal)?;
    match conv {
        Some(c) if c.status != ConversationStatus::Deleted => Ok(Json(c)),
        _ => Err((StatusCode::NOT_FOUND, "conversation not found".to_string())),
    }
}

/// DELETE /api/conversations/:id：软删除（数据保留）
async fn soft_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let found = state
        .store
        .set_status(&id, ConversationStatus::Deleted)
        .await
        .map_err(internal)?;
    if !found {
        return Err((StatusCode::NOT_FOUND, "conversation not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// POST /api/conversations/:id/archive：归档（列表仍可见，状态变更）
async fn archive_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let found = state
        .store
        .set_status(&id, ConversationStatus::Archived)
        .await
        .map_err(internal)?;
    if !found {
        return Err((StatusCode::NOT_FOUND, "conversation not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "archived": true })))
}

/// DELETE /api/conversations/:id/purge：物理删除
async fn purge_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let found = state.store.purge(&id).await.map_err(internal)?;
    if !found {
        return Err((StatusCode::NOT_FOUND, "conversation not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "purged": true })))
}

#[derive(Deserialize)]
struct ReconcileRequest {
    conversation_id: String,
    #[serde(default)]
    message_id: Option<String>,
}

/// POST /api/jobs/:job_id/reconcile：为指定 job 启动后台对账。
/// 未给 message_id 时在对话里按未终态的 job 引用定位；重复触发是 no-op。
async fn reconcile_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let message_id = match req.message_id {
        Some(id) => id,
        None => {
            let conv = state
                .store
                .conversation(&req.conversation_id)
                .await
                .map_err(internal)?
                .ok_or((StatusCode::NOT_FOUND, "conversation not found".to_string()))?;
            conv.messages
                .iter()
                .find_map(|m| match m {
                    StoredMessage::Agent(am)
                        if pending_job_reference(am).as_deref() == Some(job_id.as_str()) =>
                    {
                        Some(am.id.clone())
                    }
                    _ => None,
                })
                .ok_or((
                    StatusCode::NOT_FOUND,
                    "no pending reference to this job".to_string(),
                ))?
        }
    };

    let started = state.watcher.reconcile(&job_id, &message_id).await;
    Ok(Json(serde_json::json!({ "started": started })))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
