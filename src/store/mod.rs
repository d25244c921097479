//! 对话持久化：数据模型与存储抽象
//!
//! 一个 Conversation 持有有序 Message 列表（用户消息 / 智能体消息二选一），
//! 智能体消息以「占位初始化 -> 逐步 append Step -> 恰好一次 finalize」的生命周期写入，
//! 崩溃在任意点都不丢已写步骤。Step 序号在消息内严格递增且连续。
//! 提供内存与 SQLite 两种实现（定义统一的 ChatStore 接口）。

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryChatStore;
pub use sqlite::SqliteChatStore;

/// 流程变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    DoubtClearance,
    Worksheet,
    ContentCreation,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::DoubtClearance => "doubt_clearance",
            FlowKind::Worksheet => "worksheet",
            FlowKind::ContentCreation => "content_creation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "doubt_clearance" => Some(FlowKind::DoubtClearance),
            "worksheet" => Some(FlowKind::Worksheet),
            "content_creation" => Some(FlowKind::ContentCreation),
            _ => None,
        }
    }
}

/// 步骤所属阶段（固定枚举，随 Step 持久化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Script,
    Code,
    Refinement,
    Evaluation,
    Video,
    Completion,
    Generation,
    Answer,
    Chat,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Script => "script",
            Phase::Code => "code",
            Phase::Refinement => "refinement",
            Phase::Evaluation => "evaluation",
            Phase::Video => "video",
            Phase::Completion => "completion",
            Phase::Generation => "generation",
            Phase::Answer => "answer",
            Phase::Chat => "chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "research" => Some(Phase::Research),
            "script" => Some(Phase::Script),
            "code" => Some(Phase::Code),
            "refinement" => Some(Phase::Refinement),
            "evaluation" => Some(Phase::Evaluation),
            "video" => Some(Phase::Video),
            "completion" => Some(Phase::Completion),
            "generation" => Some(Phase::Generation),
            "answer" => Some(Phase::Answer),
            "chat" => Some(Phase::Chat),
            _ => None,
        }
    }
}

/// 对话状态：删除为软删除（仅改状态），purge 才物理清除
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
            ConversationStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConversationStatus::Active),
            "archived" => Some(ConversationStatus::Archived),
            "deleted" => Some(ConversationStatus::Deleted),
            _ => None,
        }
    }
}

/// 单条持久化步骤：消息内序号严格递增、不复用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub seq: u64,
    pub phase: Phase,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// 研究阶段累计产出：文本与来源集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub text: String,
    pub sources: Vec<String>,
}

/// 执行摘要：finalize 时一次性计算，此后不再变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub success: bool,
    pub tool_calls: u64,
    pub text_len: u64,
    pub duration_ms: u64,
    pub error_count: u64,
    pub status: String,
}

/// 用户消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub seq: u64,
    pub query: String,
    pub referenced_files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// 智能体消息：创建时为占位状态（ended_at / summary 为空），流程结束时恰好一次 finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub seq: u64,
    pub flow: FlowKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
    pub findings: ResearchFindings,
    pub content: String,
    pub summary: Option<ExecutionSummary>,
    pub files_processed: u64,
}

/// 消息：用户或智能体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredMessage {
    User(UserMessage),
    Agent(AgentMessage),
}

/// 对话：聚合计数始终等于各消息之和
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub status: ConversationStatus,
    pub message_count: u64,
    pub query_count: u64,
    pub response_count: u64,
    pub files_processed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
}

/// 对话摘要（列表页）：标题取首条用户提问，超 50 字截断
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// finalize 的入参：流程累计的产出与计数，摘要由存储计算
#[derive(Debug, Clone, Default)]
pub struct AgentMessageFinal {
    pub success: bool,
    pub status: String,
    pub findings: ResearchFindings,
    pub content: String,
    pub tool_calls: u64,
    pub error_count: u64,
    pub files_processed: u64,
}

/// 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// 统一存储接口：内存实现用于测试与开发，SQLite 实现用于落盘
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// 追加用户消息；对话不存在时创建。同一逻辑提问只应调用一次（不按内容去重）。
    async fn add_user_message(
        &self,
        conversation_id: &str,
        query: &str,
        referenced_files: &[String],
    ) -> Result<(), StoreError>;

    /// 追加智能体消息占位记录，返回消息 id；之后通过 append_step / finalize 填充
    async fn init_agent_message(
        &self,
        conversation_id: &str,
        flow: FlowKind,
    ) -> Result<String, StoreError>;

    /// 追加一条步骤（目标式插入，不重写整条消息），返回分配的序号
    async fn append_step(
        &self,
        message_id: &str,
        phase: Phase,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<u64, StoreError>;

    /// 结束智能体消息：写入产出、计算摘要、更新对话计数。
    /// 恰好一次语义：首次返回 true，重复调用为 no-op 返回 false（不重复累计计数）。
    async fn finalize(
        &self,
        message_id: &str,
        fin: AgentMessageFinal,
    ) -> Result<bool, StoreError>;

    /// 读取完整对话（含所有步骤），用于历史回放
    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// 对话摘要列表（不含软删除）
    async fn conversation_summaries(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    /// 修改对话状态（归档 / 软删除）；存在返回 true
    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<bool, StoreError>;

    /// 物理删除对话及其全部消息与步骤
    async fn purge(&self, id: &str) -> Result<bool, StoreError>;

    /// 指定消息中该 job 是否已有终态标记（job_completed / job_error）
    async fn has_job_terminal_step(
        &self,
        message_id: &str,
        job_id: &str,
    ) -> Result<bool, StoreError>;

    /// 注入 job 终态步骤；内部查重，同一 job 至多一条终态（并发安全）。
    /// 写入时返回 true，已有终态时 no-op 返回 false。
    async fn inject_job_outcome(
        &self,
        message_id: &str,
        job_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError>;
}

/// 终态步骤的事件类型
pub const JOB_TERMINAL_EVENTS: [&str; 2] = ["job_completed", "job_error"];

/// 回放：从持久化步骤重建流式文本累计（与现场流逐字节一致）
pub fn replay_text(steps: &[Step]) -> String {
    let mut out = String::new();
    for step in steps {
        if step.event_type == "text_delta" {
            if let Some(text) = step.payload.get("text").and_then(|t| t.as_str()) {
                out.push_str(text);
            }
        }
    }
    out
}

/// 列表页标题：首条提问截断到 50 字符
pub fn derive_title(first_query: &str) -> String {
    let chars: Vec<char> = first_query.chars().collect();
    if chars.len() > 50 {
        format!("{}...", chars[..50].iter().collect::<String>())
    } else {
        first_query.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_truncates() {
        let long = "x".repeat(80);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
        assert_eq!(derive_title("short"), "short");
    }

    #[test]
    fn test_replay_text_accumulates_deltas_only() {
        let mk = |seq: u64, event_type: &str, payload: serde_json::Value| Step {
            seq,
            phase: Phase::Research,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        let steps = vec![
            mk(0, "phase_start", serde_json::json!({"phase": "research"})),
            mk(1, "text_delta", serde_json::json!({"text": "hello "})),
            mk(2, "tool_call", serde_json::json!({"tool": "web_search"})),
            mk(3, "text_delta", serde_json::json!({"text": "world"})),
        ];
        assert_eq!(replay_text(&steps), "hello world");
    }
}
