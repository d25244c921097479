//! 流程错误类型
//!
//! 与流程边界配合：子智能体内部的模型/工具传输错误在 runner 内收敛为 finish(error) 事件，
//! 只有流程级逻辑错误（素材不足、渲染提交失败等）以 FlowError 形式抛到流程边界，
//! 由边界统一 finalize(success=false) 并向客户端发终止错误帧。

use thiserror::Error;

/// 流程运行过程中可能出现的错误（模型、解析、工具、外部服务等）
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 研究阶段产出低于最小字数门槛，流程在进入生成阶段前快速失败
    #[error("insufficient research findings: {found} chars (minimum {required})")]
    InsufficientFindings { found: usize, required: usize },

    #[error("render submission failed: {0}")]
    RenderSubmitFailed(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("Cancelled")]
    Cancelled,
}
