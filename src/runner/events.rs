//! 子智能体规范化事件
//!
//! 所有 LLM 后端的流转在 runner 内归一为四类事件：tool_call / tool_result / text_delta / finish；
//! finish 恰好一条，传输层错误也以 finish(error) 收尾而不是异常外抛。

use serde::{Deserialize, Serialize};

/// 结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// 模型给出最终回答
    Completed,
    /// 步数预算用尽
    MaxSteps,
    /// 模型调用失败（传输 / 解析不可恢复）
    Error,
}

/// 单步规范化事件（可序列化为 JSON 供前端展示与落库）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 调用工具
    ToolCall {
        name: String,
        args: serde_json::Value,
    },
    /// 工具返回（成功或 "Error: ..." 文本）
    ToolResult { name: String, result: String },
    /// 一段输出文本
    TextDelta { text: String },
    /// 循环结束（每次运行恰好一条）
    Finish {
        reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}
