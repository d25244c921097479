//! 答疑流程：单阶段（answer），工具限定为检索 + 搜索，finish 即终止

use crate::core::FlowError;
use crate::flows::{prompts, FlowContext, FlowOutput, FlowRequest, FlowRuntime, FlowStatus, Phase};
use crate::runner::{FinishReason, SubAgentSpec};
use crate::store::ResearchFindings;

pub(crate) async fn run(
    rt: &FlowRuntime,
    ctx: &FlowContext,
    req: &FlowRequest,
    query: &str,
    files: &[String],
) -> Result<FlowOutput, FlowError> {
    let tool_ctx = rt.tool_context(req);
    let document_context = rt
        .seed_retrieval(ctx, Phase::Answer, query, files, &tool_ctx)
        .await;

    let spec = SubAgentSpec {
        system_prompt: prompts::DOUBT_SOLVER.to_string(),
        prompt: prompts::doubt_task(query, document_context.as_deref()),
        allowed_tools: vec!["retrieve_content".to_string(), "web_search".to_string()],
        max_steps: req.research_mode.max_tool_calls(&rt.flows_cfg),
        temperature: rt.temperature,
        base_args: tool_ctx.base_args(),
    };
    let outcome = rt.drive_phase(ctx, Phase::Answer, spec).await;

    match outcome.reason {
        FinishReason::Error => Err(FlowError::LlmError(
            "answer phase failed before producing a reply".to_string(),
        )),
        reason => {
            let (status, detail) = if reason == FinishReason::MaxSteps {
                (
                    FlowStatus::CompletedWithWarnings,
                    Some("step budget exhausted before a final answer".to_string()),
                )
            } else {
                (FlowStatus::Completed, None)
            };
            Ok(FlowOutput {
                status,
                detail,
                findings: ResearchFindings {
                    text: String::new(),
                    sources: ctx.sources(),
                },
                content: outcome.text,
                files_processed: files.len() as u64,
            })
        }
    }
}
