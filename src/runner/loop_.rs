//! 子智能体主循环
//!
//! 用户 prompt -> 拼 system(基础 prompt + Available tools + 输出协议) -> complete ->
//! 解析输出：JSON Tool Call 则执行并写回 Observation，纯文本则作为最终回答结束。
//! 硬性步数上限：无论模型行为如何，至多 max_steps 次模型调用；
//! 每个 tool_call 必然跟随配对的 tool_result，或以 finish(error) 收尾。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::FlowError;
use crate::llm::{LlmClient, Message};
use crate::runner::{AgentEvent, FinishReason};
use crate::tools::ToolExecutor;

/// 观察结果写回对话时的截断上限
const OBSERVATION_WRITEBACK_CHARS: usize = 2000;

/// 模型输出协议说明（附在 system 末尾）
const OUTPUT_PROTOCOL: &str = "\
To call a tool, reply with exactly one JSON object and nothing else:\n\
{\"tool\": \"<tool name>\", \"args\": { ... }}\n\
When you have everything you need, reply with your final answer as plain text (no JSON).";

/// 一次子智能体运行的完整配置
pub struct SubAgentSpec {
    /// 阶段 system prompt（角色与任务约束）
    pub system_prompt: String,
    /// 用户侧任务描述
    pub prompt: String,
    /// 本阶段可用的工具名；空表示无工具阶段（单次完成，输出即最终文本）
    pub allowed_tools: Vec<String>,
    /// 模型调用次数硬上限
    pub max_steps: usize,
    pub temperature: f32,
    /// 合并进每次 tool call args 的会话上下文（conversation_id 等）
    pub base_args: serde_json::Value,
}

/// 运行结果：最终文本、工具调用与错误计数、结束原因
#[derive(Debug)]
pub struct SubAgentOutcome {
    pub text: String,
    pub tool_calls: u64,
    pub errors: u64,
    pub reason: FinishReason,
}

/// 模型返回的 Tool Call（简化 JSON：{"tool": "web_search", "args": {"query": "..."}}）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// 解析结果
enum ModelOutput {
    /// 最终回答
    Answer(String),
    /// 需要执行工具
    ToolCall(ToolCall),
}

/// 解析模型输出：若含有效 JSON 且 tool 非空则为 ToolCall，否则为 Answer
fn parse_model_output(output: &str) -> Result<ModelOutput, FlowError> {
    let trimmed = output.trim();

    // 尝试提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Ok(ModelOutput::Answer(trimmed.to_string()));
    };

    let parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| FlowError::JsonParseError(format!("{}: {}", e, json_str)))?;

    if parsed.tool.is_empty() {
        Ok(ModelOutput::Answer(trimmed.to_string()))
    } else {
        Ok(ModelOutput::ToolCall(parsed))
    }
}

fn send(tx: &mpsc::UnboundedSender<AgentEvent>, ev: AgentEvent) {
    // 客户端断开后发送失败是正常提前终止，不外抛
    let _ = tx.send(ev);
}

/// 将会话上下文合并进模型给出的 args（不覆盖模型已给的键）
fn merge_base_args(base: &serde_json::Value, args: serde_json::Value) -> serde_json::Value {
    match (base, args) {
        (serde_json::Value::Object(base), serde_json::Value::Object(mut args)) => {
            for (k, v) in base {
                args.entry(k.clone()).or_insert_with(|| v.clone());
            }
            serde_json::Value::Object(args)
        }
        (_, args) => args,
    }
}

/// 执行子智能体循环。事件依产生顺序写入 event_tx；返回的 Outcome 汇总本次运行。
///
/// 终止性：至多 spec.max_steps 次模型调用。模型传输错误、不可恢复的解析错误
/// 都转为 finish(error) 事件，调用方无需在流中途捕获异常。
pub async fn run_sub_agent(
    llm: &dyn LlmClient,
    executor: &ToolExecutor,
    spec: &SubAgentSpec,
    event_tx: &mpsc::UnboundedSender<AgentEvent>,
) -> SubAgentOutcome {
    // 无工具阶段：单次完成，整段输出即最终文本（生成类阶段不走工具协议，
    // 代码里的花括号不会被误判成 tool call）
    if spec.allowed_tools.is_empty() {
        let messages = vec![
            Message::system(spec.system_prompt.clone()),
            Message::user(spec.prompt.clone()),
        ];
        return match llm.complete(&messages, spec.temperature).await {
            Ok(text) => {
                send(event_tx, AgentEvent::TextDelta { text: text.clone() });
                send(
                    event_tx,
                    AgentEvent::Finish {
                        reason: FinishReason::Completed,
                        message: None,
                    },
                );
                SubAgentOutcome {
                    text,
                    tool_calls: 0,
                    errors: 0,
                    reason: FinishReason::Completed,
                }
            }
            Err(e) => {
                send(
                    event_tx,
                    AgentEvent::Finish {
                        reason: FinishReason::Error,
                        message: Some(format!("model call failed: {}", e)),
                    },
                );
                SubAgentOutcome {
                    text: String::new(),
                    tool_calls: 0,
                    errors: 1,
                    reason: FinishReason::Error,
                }
            }
        };
    }

    let system = format!(
        "{}\n\nAvailable tools:\n{}\n\n{}",
        spec.system_prompt,
        executor.schema_json(&spec.allowed_tools),
        OUTPUT_PROTOCOL
    );

    let mut messages = vec![Message::system(system), Message::user(spec.prompt.clone())];
    let mut tool_calls: u64 = 0;
    let mut errors: u64 = 0;
    let mut last_output = String::new();
    let mut parse_retries: u32 = 0;

    let mut step = 0;
    while step < spec.max_steps {
        step += 1;

        let output = match llm.complete(&messages, spec.temperature).await {
            Ok(o) => o,
            Err(e) => {
                let msg = format!("model call failed: {}", e);
                send(
                    event_tx,
                    AgentEvent::Finish {
                        reason: FinishReason::Error,
                        message: Some(msg),
                    },
                );
                return SubAgentOutcome {
                    text: last_output,
                    tool_calls,
                    errors: errors + 1,
                    reason: FinishReason::Error,
                };
            }
        };
        last_output = output.clone();

        match parse_model_output(&output) {
            Ok(ModelOutput::Answer(text)) => {
                send(event_tx, AgentEvent::TextDelta { text: text.clone() });
                send(
                    event_tx,
                    AgentEvent::Finish {
                        reason: FinishReason::Completed,
                        message: None,
                    },
                );
                return SubAgentOutcome {
                    text,
                    tool_calls,
                    errors,
                    reason: FinishReason::Completed,
                };
            }
            Ok(ModelOutput::ToolCall(tc)) => {
                send(
                    event_tx,
                    AgentEvent::ToolCall {
                        name: tc.tool.clone(),
                        args: tc.args.clone(),
                    },
                );
                tool_calls += 1;

                let allowed = spec.allowed_tools.iter().any(|n| n == &tc.tool)
                    && executor.contains(&tc.tool);
                let observation = if !allowed {
                    errors += 1;
                    format!("Error: tool {} is not available in this phase", tc.tool)
                } else {
                    let args = merge_base_args(&spec.base_args, tc.args);
                    match executor.execute(&tc.tool, args).await {
                        Ok(r) => r,
                        Err(e) => {
                            errors += 1;
                            format!("Error: {}", e)
                        }
                    }
                };
                send(
                    event_tx,
                    AgentEvent::ToolResult {
                        name: tc.tool.clone(),
                        result: observation.clone(),
                    },
                );

                // 将工具调用与结果写回对话，供下一轮使用（长结果截断预览）
                let preview: String = observation
                    .chars()
                    .take(OBSERVATION_WRITEBACK_CHARS)
                    .collect();
                messages.push(Message::assistant(format!(
                    "Tool call: {} | Result: {}",
                    tc.tool, preview
                )));
                messages.push(Message::user(format!(
                    "Observation from {}: {}",
                    tc.tool, preview
                )));
            }
            Err(e) => {
                // 解析失败（如 JSON 错误）：注入纠正提示重试，计入步数预算
                errors += 1;
                parse_retries += 1;
                if parse_retries > 2 {
                    let msg = format!("unrecoverable model output: {}", e);
                    send(
                        event_tx,
                        AgentEvent::Finish {
                            reason: FinishReason::Error,
                            message: Some(msg),
                        },
                    );
                    return SubAgentOutcome {
                        text: last_output,
                        tool_calls,
                        errors,
                        reason: FinishReason::Error,
                    };
                }
                messages.push(Message::user(
                    "Your last reply was neither a valid tool-call JSON object nor a plain-text \
                     answer. Reply again following the output protocol."
                        .to_string(),
                ));
            }
        }
    }

    send(
        event_tx,
        AgentEvent::Finish {
            reason: FinishReason::MaxSteps,
            message: Some(format!("step budget ({}) exhausted", spec.max_steps)),
        },
    );
    SubAgentOutcome {
        text: last_output,
        tool_calls,
        errors,
        reason: FinishReason::MaxSteps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::{Tool, ToolRegistry};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo back the text argument"
        }

        async fn execute(&self, args: serde_json::Value) -> Result<String, String> {
            Ok(args
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        ToolExecutor::new(registry, 5)
    }

    fn spec(max_steps: usize) -> SubAgentSpec {
        SubAgentSpec {
            system_prompt: "You are a test agent.".to_string(),
            prompt: "do the thing".to_string(),
            allowed_tools: vec!["echo".to_string()],
            max_steps,
            temperature: 0.0,
            base_args: serde_json::json!({}),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_tool_then_answer() {
        let llm = MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "echo", "args": {"text": "hi"}}"#.to_string()),
            Ok("final answer".to_string()),
        ]);
        let executor = executor();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = run_sub_agent(&llm, &executor, &spec(5), &tx).await;
        assert_eq!(outcome.reason, FinishReason::Completed);
        assert_eq!(outcome.text, "final answer");
        assert_eq!(outcome.tool_calls, 1);

        let events = drain(&mut rx);
        assert!(matches!(events[0], AgentEvent::ToolCall { .. }));
        assert!(matches!(
            &events[1],
            AgentEvent::ToolResult { result, .. } if result == "hi"
        ));
        assert!(matches!(events[2], AgentEvent::TextDelta { .. }));
        assert!(matches!(
            events[3],
            AgentEvent::Finish {
                reason: FinishReason::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_hard_step_budget() {
        // 模型永远要求调工具：循环必须在 max_steps 后结束
        let llm = MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "echo", "args": {"text": "1"}}"#.to_string()),
            Ok(r#"{"tool": "echo", "args": {"text": "2"}}"#.to_string()),
            Ok(r#"{"tool": "echo", "args": {"text": "3"}}"#.to_string()),
            Ok(r#"{"tool": "echo", "args": {"text": "4"}}"#.to_string()),
        ]);
        let executor = executor();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = run_sub_agent(&llm, &executor, &spec(3), &tx).await;
        assert_eq!(outcome.reason, FinishReason::MaxSteps);
        assert_eq!(outcome.tool_calls, 3);

        let events = drain(&mut rx);
        let finishes = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Finish { .. }))
            .count();
        assert_eq!(finishes, 1);
    }

    #[tokio::test]
    async fn test_transport_error_becomes_finish() {
        let llm = MockLlmClient::scripted(vec![Err("connection refused".to_string())]);
        let executor = executor();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = run_sub_agent(&llm, &executor, &spec(5), &tx).await;
        assert_eq!(outcome.reason, FinishReason::Error);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::Finish {
                reason: FinishReason::Error,
                message: Some(m)
            } if m.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_unavailable_tool_gets_result() {
        // 不在允许列表的工具也要有配对的 tool_result
        let llm = MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "shell", "args": {}}"#.to_string()),
            Ok("done".to_string()),
        ]);
        let executor = executor();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = run_sub_agent(&llm, &executor, &spec(5), &tx).await;
        assert_eq!(outcome.reason, FinishReason::Completed);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[1],
            AgentEvent::ToolResult { result, .. } if result.contains("not available")
        ));
    }

    #[tokio::test]
    async fn test_parse_retry_then_answer() {
        let llm = MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "echo", "args":"#.to_string()), // 截断的 JSON
            Ok("recovered answer".to_string()),
        ]);
        let executor = executor();
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = run_sub_agent(&llm, &executor, &spec(5), &tx).await;
        assert_eq!(outcome.reason, FinishReason::Completed);
        assert_eq!(outcome.text, "recovered answer");
        assert_eq!(outcome.errors, 1);
    }
}
