//! 流程集成测试
//!
//! 用脚本化 Mock LLM、桩工具与桩渲染服务驱动三个流程变体，
//! 验证终止帧唯一、步骤序号连续、finalize 恰好一次、回放一致等性质。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use mentor::config::{FlowsSection, RendererSection};
use mentor::flows::{FlowEvent, FlowRequest, FlowRuntime, FlowStatus, Phase, ResearchMode};
use mentor::jobs::JobWatcher;
use mentor::llm::MockLlmClient;
use mentor::render::{RenderJobStatus, RenderSubmission, RendererApi, Validation};
use mentor::store::{replay_text, ChatStore, FlowKind, MemoryChatStore, StoredMessage};
use mentor::tools::{Tool, ToolExecutor, ToolRegistry};

struct StubSearchTool;

#[async_trait]
impl Tool for StubSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "stub web search"
    }
    async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
        Ok(r#"{"results": [{"title": "ref", "url": "https://example.test/a"}]}"#.to_string())
    }
}

struct StubRetrieveTool;

#[async_trait]
impl Tool for StubRetrieveTool {
    fn name(&self) -> &str {
        "retrieve_content"
    }
    fn description(&self) -> &str {
        "stub document retrieval"
    }
    async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
        Ok("relevant chunks from the referenced documents".to_string())
    }
}

struct StubSaveTool;

#[async_trait]
impl Tool for StubSaveTool {
    fn name(&self) -> &str {
        "save_content"
    }
    fn description(&self) -> &str {
        "stub content saver"
    }
    async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
        Ok(r#"{"success": true, "filename": "worksheet.pdf"}"#.to_string())
    }
}

/// 桩渲染服务：校验结果按脚本弹出（耗尽后默认通过），任务状态立即 completed
struct StubRenderer {
    validations: std::sync::Mutex<std::collections::VecDeque<Validation>>,
}

impl StubRenderer {
    fn validations(results: Vec<(bool, &str)>) -> Self {
        Self {
            validations: std::sync::Mutex::new(
                results
                    .into_iter()
                    .map(|(is_valid, diagnostics)| Validation {
                        is_valid,
                        diagnostics: diagnostics.to_string(),
                    })
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl RendererApi for StubRenderer {
    async fn validate(&self, _code: &str) -> Result<Validation, String> {
        Ok(self
            .validations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Validation {
                is_valid: true,
                diagnostics: String::new(),
            }))
    }

    async fn submit(&self, _submission: &RenderSubmission) -> Result<String, String> {
        Ok("job-render-1".to_string())
    }

    async fn job_status(&self, _job_id: &str) -> Result<RenderJobStatus, String> {
        Ok(RenderJobStatus::Completed {
            output_file: Some("out.mp4".to_string()),
            message: "done".to_string(),
        })
    }
}

struct Harness {
    runtime: Arc<FlowRuntime>,
    store: Arc<MemoryChatStore>,
    watcher: Arc<JobWatcher>,
}

fn harness(llm: MockLlmClient, renderer: StubRenderer) -> Harness {
    let store = Arc::new(MemoryChatStore::new());
    let renderer: Arc<dyn RendererApi> = Arc::new(renderer);

    let mut registry = ToolRegistry::new();
    registry.register(StubSearchTool);
    registry.register(StubRetrieveTool);
    registry.register(StubSaveTool);
    let executor = Arc::new(ToolExecutor::new(registry, 5));

    let renderer_cfg = RendererSection {
        poll_interval_secs: 0,
        poll_max_attempts: 3,
        ..Default::default()
    };
    let watcher = Arc::new(JobWatcher::new(
        store.clone() as Arc<dyn ChatStore>,
        Arc::clone(&renderer),
        &renderer_cfg,
    ));

    let runtime = Arc::new(FlowRuntime::new(
        Arc::new(llm),
        executor,
        renderer,
        Arc::clone(&watcher),
        store.clone() as Arc<dyn ChatStore>,
        FlowsSection::default(),
        renderer_cfg,
        0.7,
    ));
    Harness {
        runtime,
        store,
        watcher,
    }
}

fn request(flow: FlowKind, query: &str) -> FlowRequest {
    FlowRequest {
        conversation_id: "c1".to_string(),
        classroom_id: Some("cls-1".to_string()),
        subject_id: None,
        query: query.to_string(),
        flow,
        research_mode: ResearchMode::Simple,
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

fn finish_frames(events: &[FlowEvent]) -> Vec<(FlowStatus, Option<String>)> {
    events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::Finish { status, detail } => Some((*status, detail.clone())),
            _ => None,
        })
        .collect()
}

async fn agent_message(store: &MemoryChatStore) -> mentor::store::AgentMessage {
    let conv = store.conversation("c1").await.unwrap().unwrap();
    conv.messages
        .iter()
        .find_map(|m| match m {
            StoredMessage::Agent(am) => Some(am.clone()),
            _ => None,
        })
        .expect("agent message present")
}

const LONG_FINDINGS: &str = "Photosynthesis converts light energy into chemical energy. \
Chlorophyll absorbs mostly red and blue light. The light reactions split water and \
produce ATP and NADPH, which the Calvin cycle uses to fix carbon dioxide into sugar.";

#[tokio::test]
async fn test_worksheet_flow_streams_persists_and_replays() {
    let llm = MockLlmClient::scripted(vec![
        Ok(r#"{"tool": "web_search", "args": {"query": "photosynthesis grade 8"}}"#.to_string()),
        Ok(LONG_FINDINGS.to_string()),
        Ok(r##"{"tool": "save_content", "args": {"content": "# Worksheet", "title": "Photosynthesis"}}"##.to_string()),
        Ok("Worksheet created and saved as worksheet.pdf".to_string()),
    ]);
    let h = harness(llm, StubRenderer::validations(vec![]));

    let rx = h
        .runtime
        .clone()
        .execute(request(FlowKind::Worksheet, "make a photosynthesis worksheet"));
    let events = collect(rx).await;

    // 流程级 finish 恰好一条，且是最后一帧
    let finishes = finish_frames(&events);
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].0, FlowStatus::Completed);
    assert!(matches!(events.last().unwrap(), FlowEvent::Finish { .. }));
    assert!(matches!(events.first().unwrap(), FlowEvent::FlowStart { .. }));

    // 现场流的文本累计
    let live_text: String = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::TextDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    let msg = agent_message(&h.store).await;
    // finalize 恰好一次：摘要已写入且成功
    let summary = msg.summary.as_ref().expect("finalized");
    assert!(summary.success);
    assert_eq!(summary.status, "completed");
    assert!(summary.tool_calls >= 2);

    // 步骤序号严格递增无空洞
    for (i, s) in msg.steps.iter().enumerate() {
        assert_eq!(s.seq, i as u64);
    }

    // 回放重建的文本与现场流逐字节一致
    assert_eq!(replay_text(&msg.steps), live_text);

    // 研究产出与来源入库
    assert_eq!(msg.findings.text, LONG_FINDINGS);
    assert!(msg
        .findings
        .sources
        .contains(&"https://example.test/a".to_string()));

    let conv = h.store.conversation("c1").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 2);
    assert_eq!(conv.query_count, 1);
    assert_eq!(conv.response_count, 1);
}

#[tokio::test]
async fn test_worksheet_flow_aborts_on_short_findings() {
    // 研究只给出 40 字符：必须在进入生成前失败
    let llm = MockLlmClient::scripted(vec![Ok("only forty characters of findings here.."
        .to_string())]);
    let h = harness(llm, StubRenderer::validations(vec![]));

    let rx = h
        .runtime
        .clone()
        .execute(request(FlowKind::Worksheet, "make a worksheet"));
    let events = collect(rx).await;

    let finishes = finish_frames(&events);
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].0, FlowStatus::Error);
    assert!(finishes[0]
        .1
        .as_deref()
        .unwrap()
        .contains("insufficient research findings"));

    // 生成阶段从未开始
    assert!(!events
        .iter()
        .any(|e| matches!(e, FlowEvent::PhaseStart { phase: Phase::Generation })));

    // 错误路径同样 finalize（占位消息不悬空）
    let msg = agent_message(&h.store).await;
    let summary = msg.summary.as_ref().expect("finalized on error path");
    assert!(!summary.success);
    assert_eq!(summary.status, "error");
}

#[tokio::test]
async fn test_content_flow_best_effort_after_exhausted_refinement() {
    let code = "```python\nfrom manim import *\n\nclass Orbit(Scene):\n    def construct(self):\n        pass\n```";
    let llm = MockLlmClient::scripted(vec![
        Ok(LONG_FINDINGS.to_string()),
        Ok(code.to_string()),
        Ok(code.to_string()),
        Ok(code.to_string()),
    ]);
    let h = harness(
        llm,
        StubRenderer::validations(vec![
            (false, "missing construct"),
            (false, "still missing construct"),
            (false, "nope"),
        ]),
    );

    let rx = h
        .runtime
        .clone()
        .execute(request(FlowKind::ContentCreation, "animate planetary orbits"));
    let events = collect(rx).await;

    // 生成尝试不超过上限 3
    let attempts = events
        .iter()
        .filter(|e| matches!(e, FlowEvent::PhaseStart { phase: Phase::Code }))
        .count();
    assert_eq!(attempts, 3);
    let validations = events
        .iter()
        .filter(|e| matches!(e, FlowEvent::ValidationResult { .. }))
        .count();
    assert_eq!(validations, 3);

    // 从未通过校验仍然提交渲染，并以 completed_with_warnings 收场
    let job_id = events
        .iter()
        .find_map(|e| match e {
            FlowEvent::JobSubmitted { job_id } => Some(job_id.clone()),
            _ => None,
        })
        .expect("render submitted");
    assert_eq!(job_id, "job-render-1");

    let finishes = finish_frames(&events);
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].0, FlowStatus::CompletedWithWarnings);
    assert!(finishes[0].1.as_deref().unwrap().contains("best_effort_render"));

    // 后台对账注入恰好一条终态；再次触发是 no-op
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let msg = agent_message(&h.store).await;
    let terminals = msg
        .steps
        .iter()
        .filter(|s| s.event_type == "job_completed")
        .count();
    assert_eq!(terminals, 1);
    assert!(!h.watcher.reconcile("job-render-1", &msg.id).await);

    let summary = msg.summary.as_ref().unwrap();
    assert!(summary.success);
    assert_eq!(summary.status, "completed_with_warnings");
}

#[tokio::test]
async fn test_content_flow_first_attempt_valid() {
    let code = "```python\nfrom manim import *\n\nclass Wave(Scene):\n    def construct(self):\n        pass\n```";
    let llm = MockLlmClient::scripted(vec![
        Ok(LONG_FINDINGS.to_string()),
        Ok(code.to_string()),
    ]);
    let h = harness(llm, StubRenderer::validations(vec![(true, "")]));

    let rx = h
        .runtime
        .clone()
        .execute(request(FlowKind::ContentCreation, "animate a sine wave"));
    let events = collect(rx).await;

    let finishes = finish_frames(&events);
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].0, FlowStatus::Completed);

    let attempts = events
        .iter()
        .filter(|e| matches!(e, FlowEvent::PhaseStart { phase: Phase::Code }))
        .count();
    assert_eq!(attempts, 1);

    // 生成的代码作为消息内容入库
    let msg = agent_message(&h.store).await;
    assert!(msg.content.contains("class Wave(Scene)"));
}

#[tokio::test]
async fn test_doubt_flow_retrieves_referenced_files_before_search() {
    let llm = MockLlmClient::scripted(vec![
        Ok(r#"{"tool": "web_search", "args": {"query": "the concept"}}"#.to_string()),
        Ok("Here is the explanation you asked for.".to_string()),
    ]);
    let h = harness(llm, StubRenderer::validations(vec![]));

    let rx = h.runtime.clone().execute(request(
        FlowKind::DoubtClearance,
        "@lesson1.pdf @notes.txt explain the concept",
    ));
    let events = collect(rx).await;

    // 引用文件作为必选检索上下文，先于任何 web_search
    let retrieve_idx = events
        .iter()
        .position(|e| matches!(e, FlowEvent::ToolCall { tool, .. } if tool == "retrieve_content"))
        .expect("seed retrieval happened");
    let search_idx = events
        .iter()
        .position(|e| matches!(e, FlowEvent::ToolCall { tool, .. } if tool == "web_search"))
        .expect("web search happened");
    assert!(retrieve_idx < search_idx);

    if let FlowEvent::ToolCall { args, .. } = &events[retrieve_idx] {
        assert_eq!(
            args["filenames"],
            serde_json::json!(["lesson1.pdf", "notes.txt"])
        );
        assert_eq!(args["query"], "explain the concept");
        assert_eq!(args["conversation_id"], "c1");
    }

    let finishes = finish_frames(&events);
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].0, FlowStatus::Completed);

    // 用户消息保存了清理前的原文与文件列表
    let conv = h.store.conversation("c1").await.unwrap().unwrap();
    match &conv.messages[0] {
        StoredMessage::User(u) => {
            assert_eq!(u.referenced_files, vec!["lesson1.pdf", "notes.txt"]);
        }
        _ => panic!("expected user message first"),
    }
    assert_eq!(conv.files_processed, 4); // 用户消息 2 + 智能体处理 2
}
