//! 子智能体 runner：有界工具调用循环与规范化事件

pub mod events;
pub mod loop_;

pub use events::{AgentEvent, FinishReason};
pub use loop_::{run_sub_agent, SubAgentOutcome, SubAgentSpec};
