//! 工作单流程：研究 -> 生成 两阶段
//!
//! 研究阶段按研究模式限定工具调用预算；产出低于最小字数门槛时在进入生成前
//! 显式失败（不凭空编造工作单）。生成阶段只允许 save_content 工具。

use crate::core::FlowError;
use crate::flows::{prompts, FlowContext, FlowOutput, FlowRequest, FlowRuntime, FlowStatus, Phase};
use crate::runner::{FinishReason, SubAgentOutcome, SubAgentSpec};
use crate::store::ResearchFindings;
use crate::tools::ToolContext;

pub(crate) async fn run(
    rt: &FlowRuntime,
    ctx: &FlowContext,
    req: &FlowRequest,
    query: &str,
    files: &[String],
) -> Result<FlowOutput, FlowError> {
    let tool_ctx = rt.tool_context(req);
    let research = run_research(rt, ctx, req, query, files, &tool_ctx).await;
    if research.reason == FinishReason::Error {
        return Err(FlowError::LlmError(
            "research phase failed before producing findings".to_string(),
        ));
    }

    let findings = research.text;
    let found = findings.chars().count();
    if found < rt.flows_cfg.min_findings_chars {
        return Err(FlowError::InsufficientFindings {
            found,
            required: rt.flows_cfg.min_findings_chars,
        });
    }

    let spec = SubAgentSpec {
        system_prompt: prompts::WORKSHEET_GENERATOR.to_string(),
        prompt: prompts::worksheet_task(query, &findings),
        allowed_tools: vec!["save_content".to_string()],
        max_steps: rt.flows_cfg.generation_max_steps,
        temperature: rt.temperature,
        base_args: tool_ctx.base_args(),
    };
    let generation = rt.drive_phase(ctx, Phase::Generation, spec).await;
    if generation.reason == FinishReason::Error {
        return Err(FlowError::LlmError(
            "generation phase failed after research".to_string(),
        ));
    }

    let (status, detail) = if generation.reason == FinishReason::MaxSteps {
        (
            FlowStatus::CompletedWithWarnings,
            Some("generation step budget exhausted".to_string()),
        )
    } else {
        (FlowStatus::Completed, None)
    };
    Ok(FlowOutput {
        status,
        detail,
        findings: ResearchFindings {
            text: findings,
            sources: ctx.sources(),
        },
        content: generation.text,
        files_processed: files.len() as u64,
    })
}

/// 研究阶段（工作单与内容创作流程共用）：可选的文件预检索 + 研究子智能体
pub(crate) async fn run_research(
    rt: &FlowRuntime,
    ctx: &FlowContext,
    req: &FlowRequest,
    query: &str,
    files: &[String],
    tool_ctx: &ToolContext,
) -> SubAgentOutcome {
    let document_context = rt
        .seed_retrieval(ctx, Phase::Research, query, files, tool_ctx)
        .await;

    let spec = SubAgentSpec {
        system_prompt: prompts::CONTENT_RESEARCHER.to_string(),
        prompt: prompts::research_task(query, document_context.as_deref()),
        allowed_tools: vec![
            "retrieve_content".to_string(),
            "web_search".to_string(),
            "scrape_websites".to_string(),
        ],
        max_steps: req.research_mode.max_tool_calls(&rt.flows_cfg),
        temperature: rt.temperature,
        base_args: tool_ctx.base_args(),
    };
    rt.drive_phase(ctx, Phase::Research, spec).await
}
