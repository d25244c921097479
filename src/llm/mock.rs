//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按预置脚本依次返回输出：脚本耗尽后回显最后一条 User 消息，便于本地跑通流程。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：依次弹出脚本中的回复（Err 项模拟传输错误）
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以固定脚本创建；每次 complete 弹出一项
    pub fn scripted(outputs: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(outputs.into()),
        }
    }

    /// 追加一条脚本输出
    pub fn push(&self, output: Result<String, String>) {
        self.script.lock().unwrap().push_back(output);
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], _temperature: f32) -> Result<String, String> {
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}
