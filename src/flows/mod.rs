//! 流程状态机
//!
//! 三个流程变体共用一个形状：线性或带循环的阶段序列，每个阶段要么驱动一个
//! 有界子智能体（runner），要么提交外部渲染任务。阶段事件统一经 FlowContext
//! 多路复用：一路发给客户端（SSE），一路转成 Step 落库；两路都不会阻断对方。
//! 流程在后台任务中执行，客户端断开不影响收尾 finalize。

pub mod content;
pub mod doubt;
pub mod prompts;
pub mod query;
pub mod worksheet;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{FlowsSection, RendererSection};
use crate::jobs::JobWatcher;
use crate::llm::LlmClient;
use crate::render::RendererApi;
use crate::runner::{run_sub_agent, AgentEvent, FinishReason, SubAgentOutcome, SubAgentSpec};
use crate::store::{AgentMessageFinal, ChatStore, ResearchFindings};
use crate::tools::{ToolContext, ToolExecutor};

pub use crate::store::{FlowKind, Phase};

/// 工具返回在事件流中的预览上限（完整结果只进模型上下文）
const TOOL_RESULT_PREVIEW_CHARS: usize = 500;

/// 研究模式：限定研究阶段的工具调用预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    Simple,
    Moderate,
    Deep,
}

impl ResearchMode {
    /// 预算作为子智能体的 max_steps 硬上限执行
    pub fn max_tool_calls(&self, cfg: &FlowsSection) -> usize {
        match self {
            ResearchMode::Simple => cfg.simple_tool_calls,
            ResearchMode::Moderate => cfg.moderate_tool_calls,
            ResearchMode::Deep => cfg.deep_tool_calls,
        }
    }
}

impl Default for ResearchMode {
    fn default() -> Self {
        ResearchMode::Moderate
    }
}

/// 流程终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Completed,
    /// 尽力而为：精修预算用尽仍未通过校验，带警告完成而非硬失败
    CompletedWithWarnings,
    Error,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Completed => "completed",
            FlowStatus::CompletedWithWarnings => "completed_with_warnings",
            FlowStatus::Error => "error",
        }
    }
}

/// 一次流程调用的输入
#[derive(Debug, Clone, Deserialize)]
pub struct FlowRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub classroom_id: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    pub query: String,
    pub flow: FlowKind,
    #[serde(default)]
    pub research_mode: ResearchMode,
}

/// 流程级事件信封：type 字段区分事件，多阶段流程带 phase 标签。
/// 每个事件同时是一条持久化 Step（event_type = type，payload = 整个信封）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStart {
        flow: FlowKind,
        conversation_id: String,
        message_id: String,
    },
    PhaseStart {
        phase: Phase,
    },
    ToolCall {
        phase: Phase,
        tool: String,
        args: serde_json::Value,
    },
    ToolResult {
        phase: Phase,
        tool: String,
        result: String,
    },
    TextDelta {
        phase: Phase,
        text: String,
    },
    /// 子智能体阶段收尾（流程级 finish 另有恰好一条）
    PhaseEnd {
        phase: Phase,
        reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// 代码校验结果（content_creation 流程）
    ValidationResult {
        attempt: usize,
        is_valid: bool,
        diagnostics: String,
    },
    /// 精修轮：把校验反馈注入下一轮生成
    Refinement {
        attempt: usize,
        feedback: String,
    },
    /// 渲染任务已提交；流自此不再等待渲染完成
    JobSubmitted {
        job_id: String,
    },
    /// 流程终止帧：每次调用恰好一条（成功或失败）
    Finish {
        status: FlowStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl FlowEvent {
    /// 持久化用的事件类型标签（与 serde tag 一致）
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::FlowStart { .. } => "flow_start",
            FlowEvent::PhaseStart { .. } => "phase_start",
            FlowEvent::ToolCall { .. } => "tool_call",
            FlowEvent::ToolResult { .. } => "tool_result",
            FlowEvent::TextDelta { .. } => "text_delta",
            FlowEvent::PhaseEnd { .. } => "phase_end",
            FlowEvent::ValidationResult { .. } => "validation_result",
            FlowEvent::Refinement { .. } => "refinement",
            FlowEvent::JobSubmitted { .. } => "job_submitted",
            FlowEvent::Finish { .. } => "finish",
        }
    }

    /// 事件归属阶段（落库用）
    pub fn step_phase(&self) -> Phase {
        match self {
            FlowEvent::FlowStart { .. } => Phase::Chat,
            FlowEvent::PhaseStart { phase } => *phase,
            FlowEvent::ToolCall { phase, .. } => *phase,
            FlowEvent::ToolResult { phase, .. } => *phase,
            FlowEvent::TextDelta { phase, .. } => *phase,
            FlowEvent::PhaseEnd { phase, .. } => *phase,
            FlowEvent::ValidationResult { .. } => Phase::Evaluation,
            FlowEvent::Refinement { .. } => Phase::Refinement,
            FlowEvent::JobSubmitted { .. } => Phase::Video,
            FlowEvent::Finish { .. } => Phase::Completion,
        }
    }
}

/// 各流程向边界返回的产出；错误路径由边界统一收尾
pub(crate) struct FlowOutput {
    pub status: FlowStatus,
    pub detail: Option<String>,
    pub findings: ResearchFindings,
    pub content: String,
    pub files_processed: u64,
}

/// 单次流程的事件出口与累计量
pub(crate) struct FlowContext {
    store: Arc<dyn ChatStore>,
    tx: mpsc::UnboundedSender<FlowEvent>,
    pub message_id: String,
    stats: std::sync::Mutex<FlowStats>,
}

#[derive(Default)]
pub(crate) struct FlowStats {
    pub tool_calls: u64,
    pub errors: u64,
    pub sources: Vec<String>,
}

impl FlowContext {
    /// 多路复用：先发客户端（断开即静默失败），再落一条 Step。
    /// 落库失败只记日志：瞬时存储抖动不应中断一次本来成功的直播流。
    pub async fn emit(&self, ev: FlowEvent) {
        let _ = self.tx.send(ev.clone());
        let payload = serde_json::to_value(&ev).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self
            .store
            .append_step(&self.message_id, ev.step_phase(), ev.event_type(), payload)
            .await
        {
            tracing::warn!(message_id = %self.message_id, "step append failed: {}", e);
        }
    }

    pub fn add_source(&self, source: String) {
        let mut stats = self.stats.lock().unwrap();
        if !stats.sources.contains(&source) {
            stats.sources.push(source);
        }
    }

    pub fn sources(&self) -> Vec<String> {
        self.stats.lock().unwrap().sources.clone()
    }

    fn bump(&self, tool_calls: u64, errors: u64) {
        let mut stats = self.stats.lock().unwrap();
        stats.tool_calls += tool_calls;
        stats.errors += errors;
    }

    fn counters(&self) -> (u64, u64) {
        let stats = self.stats.lock().unwrap();
        (stats.tool_calls, stats.errors)
    }
}

/// 流程运行时：持有所有协作方，按请求派发流程变体
pub struct FlowRuntime {
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) renderer: Arc<dyn RendererApi>,
    pub(crate) watcher: Arc<JobWatcher>,
    pub(crate) store: Arc<dyn ChatStore>,
    pub(crate) flows_cfg: FlowsSection,
    pub(crate) renderer_cfg: RendererSection,
    pub(crate) temperature: f32,
}

impl FlowRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        renderer: Arc<dyn RendererApi>,
        watcher: Arc<JobWatcher>,
        store: Arc<dyn ChatStore>,
        flows_cfg: FlowsSection,
        renderer_cfg: RendererSection,
        temperature: f32,
    ) -> Self {
        Self {
            llm,
            executor,
            renderer,
            watcher,
            store,
            flows_cfg,
            renderer_cfg,
            temperature,
        }
    }

    /// 启动流程，返回事件接收端。流程体在独立任务中运行：
    /// 接收端被丢弃（客户端断开）不会阻止 finalize 收尾。
    pub fn execute(self: Arc<Self>, req: FlowRequest) -> mpsc::UnboundedReceiver<FlowEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            self.run(req, tx).await;
        });
        rx
    }

    async fn run(&self, req: FlowRequest, tx: mpsc::UnboundedSender<FlowEvent>) {
        let (clean_query, files) = query::extract_file_references(&req.query);

        if let Err(e) = self
            .store
            .add_user_message(&req.conversation_id, &req.query, &files)
            .await
        {
            tracing::error!("failed to persist user message: {}", e);
            let _ = tx.send(FlowEvent::Finish {
                status: FlowStatus::Error,
                detail: Some(format!("store error: {}", e)),
            });
            return;
        }

        // 占位记录先行：崩溃发生在任何阶段，对话里都留有可恢复的局部记录
        let message_id = match self
            .store
            .init_agent_message(&req.conversation_id, req.flow)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("failed to init agent message: {}", e);
                let _ = tx.send(FlowEvent::Finish {
                    status: FlowStatus::Error,
                    detail: Some(format!("store error: {}", e)),
                });
                return;
            }
        };

        let ctx = FlowContext {
            store: Arc::clone(&self.store),
            tx,
            message_id: message_id.clone(),
            stats: std::sync::Mutex::new(FlowStats::default()),
        };
        for f in &files {
            ctx.add_source(f.clone());
        }

        ctx.emit(FlowEvent::FlowStart {
            flow: req.flow,
            conversation_id: req.conversation_id.clone(),
            message_id: message_id.clone(),
        })
        .await;

        let result = match req.flow {
            FlowKind::DoubtClearance => doubt::run(self, &ctx, &req, &clean_query, &files).await,
            FlowKind::Worksheet => worksheet::run(self, &ctx, &req, &clean_query, &files).await,
            FlowKind::ContentCreation => content::run(self, &ctx, &req, &clean_query, &files).await,
        };

        let (tool_calls, errors) = ctx.counters();
        match result {
            Ok(out) => {
                let fin = AgentMessageFinal {
                    success: true,
                    status: out.status.as_str().to_string(),
                    findings: out.findings,
                    content: out.content,
                    tool_calls,
                    error_count: errors,
                    files_processed: out.files_processed,
                };
                if let Err(e) = self.store.finalize(&message_id, fin).await {
                    tracing::error!("finalize failed: {}", e);
                }
                ctx.emit(FlowEvent::Finish {
                    status: out.status,
                    detail: out.detail,
                })
                .await;
            }
            Err(e) => {
                // 失败路径同样收尾：占位消息绝不悬空
                let fin = AgentMessageFinal {
                    success: false,
                    status: "error".to_string(),
                    findings: ResearchFindings {
                        text: String::new(),
                        sources: ctx.sources(),
                    },
                    content: String::new(),
                    tool_calls,
                    error_count: errors + 1,
                    files_processed: files.len() as u64,
                };
                if let Err(fe) = self.store.finalize(&message_id, fin).await {
                    tracing::error!("finalize failed on error path: {}", fe);
                }
                ctx.emit(FlowEvent::Finish {
                    status: FlowStatus::Error,
                    detail: Some(e.to_string()),
                })
                .await;
            }
        }
    }

    /// 驱动一个子智能体阶段：runner 与事件泵并发跑，事件按产生顺序转发 + 落库
    pub(crate) async fn drive_phase(
        &self,
        ctx: &FlowContext,
        phase: Phase,
        spec: SubAgentSpec,
    ) -> SubAgentOutcome {
        ctx.emit(FlowEvent::PhaseStart { phase }).await;

        let (atx, mut arx) = mpsc::unbounded_channel::<AgentEvent>();
        let runner = async {
            let outcome = run_sub_agent(self.llm.as_ref(), self.executor.as_ref(), &spec, &atx).await;
            drop(atx); // 关闭通道，事件泵随之退出
            outcome
        };
        let pump = async {
            while let Some(ev) = arx.recv().await {
                match ev {
                    AgentEvent::ToolCall { name, args } => {
                        ctx.emit(FlowEvent::ToolCall {
                            phase,
                            tool: name,
                            args,
                        })
                        .await;
                    }
                    AgentEvent::ToolResult { name, result } => {
                        for s in extract_sources(&result) {
                            ctx.add_source(s);
                        }
                        ctx.emit(FlowEvent::ToolResult {
                            phase,
                            tool: name,
                            result: preview(&result, TOOL_RESULT_PREVIEW_CHARS),
                        })
                        .await;
                    }
                    AgentEvent::TextDelta { text } => {
                        ctx.emit(FlowEvent::TextDelta { phase, text }).await;
                    }
                    AgentEvent::Finish { reason, message } => {
                        ctx.emit(FlowEvent::PhaseEnd {
                            phase,
                            reason,
                            message,
                        })
                        .await;
                    }
                }
            }
        };
        let (outcome, ()) = tokio::join!(runner, pump);
        ctx.bump(outcome.tool_calls, outcome.errors);
        outcome
    }

    /// 查询引用了 @文件 时，先以这些文件为必选上下文做一次检索，
    /// 保证文档语境先于任何网络搜索进入研究阶段
    pub(crate) async fn seed_retrieval(
        &self,
        ctx: &FlowContext,
        phase: Phase,
        query: &str,
        files: &[String],
        tool_ctx: &ToolContext,
    ) -> Option<String> {
        if files.is_empty() {
            return None;
        }
        let mut args = serde_json::json!({
            "query": query,
            "filenames": files,
            "top_k": 5,
        });
        if let (Some(args_obj), serde_json::Value::Object(base)) =
            (args.as_object_mut(), tool_ctx.base_args())
        {
            for (k, v) in base {
                args_obj.entry(k).or_insert(v);
            }
        }

        ctx.emit(FlowEvent::ToolCall {
            phase,
            tool: "retrieve_content".to_string(),
            args: args.clone(),
        })
        .await;
        let observation = match self.executor.execute("retrieve_content", args).await {
            Ok(r) => {
                ctx.bump(1, 0);
                r
            }
            Err(e) => {
                ctx.bump(1, 1);
                format!("Error: {}", e)
            }
        };
        ctx.emit(FlowEvent::ToolResult {
            phase,
            tool: "retrieve_content".to_string(),
            result: preview(&observation, TOOL_RESULT_PREVIEW_CHARS),
        })
        .await;
        Some(observation)
    }

    pub(crate) fn tool_context(&self, req: &FlowRequest) -> ToolContext {
        ToolContext {
            conversation_id: req.conversation_id.clone(),
            classroom_id: req.classroom_id.clone(),
            subject_id: req.subject_id.clone(),
        }
    }
}

/// 截断预览
pub(crate) fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 从工具返回的 JSON 里浅层收集来源（url / source / filename 字段）
pub(crate) fn extract_sources(result: &str) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(result) else {
        return out;
    };
    collect_sources(&value, &mut out, 0);
    out
}

fn collect_sources(value: &serde_json::Value, out: &mut Vec<String>, depth: usize) {
    if depth > 3 || out.len() >= 20 {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for key in ["url", "source", "filename"] {
                if let Some(serde_json::Value::String(s)) = map.get(key) {
                    if !out.contains(s) {
                        out.push(s.clone());
                    }
                }
            }
            for v in map.values() {
                collect_sources(v, out, depth + 1);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                collect_sources(v, out, depth + 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_research_mode_budgets() {
        let cfg = FlowsSection::default();
        assert_eq!(ResearchMode::Simple.max_tool_calls(&cfg), 3);
        assert_eq!(ResearchMode::Moderate.max_tool_calls(&cfg), 7);
        assert_eq!(ResearchMode::Deep.max_tool_calls(&cfg), 10);
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let ev = FlowEvent::TextDelta {
            phase: Phase::Research,
            text: "x".to_string(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], ev.event_type());

        let ev = FlowEvent::JobSubmitted {
            job_id: "j1".to_string(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "job_submitted");
        assert_eq!(v["job_id"], "j1");
    }

    #[test]
    fn test_extract_sources_from_tool_result() {
        let result = r#"{"results": [{"title": "a", "url": "https://x.test/a"},
                          {"title": "b", "url": "https://x.test/b"}],
                         "source": "web_search"}"#;
        let sources = extract_sources(result);
        assert!(sources.contains(&"https://x.test/a".to_string()));
        assert!(sources.contains(&"https://x.test/b".to_string()));
    }
}
