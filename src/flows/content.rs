//! 内容创作流程：研究 -> {生成代码 -> 外部校验 -> 未过则带反馈重试} -> 提交渲染
//!
//! 精修循环最多 max_refine_iterations 轮；预算用尽仍未通过时执行命名的尽力而为
//! 策略（BEST_EFFORT_RENDER）：带着最后一版代码提交渲染，结果标记
//! completed_with_warnings 而非硬失败。提交后立即发 job_id 并结束流，
//! 渲染任务脱离本次请求继续跑，由 JobWatcher 对账。

use crate::core::FlowError;
use crate::flows::{
    prompts, worksheet, FlowContext, FlowEvent, FlowOutput, FlowRequest, FlowRuntime, FlowStatus,
    Phase,
};
use crate::render::{extract_scene_name, RenderSubmission};
use crate::runner::{FinishReason, SubAgentSpec};
use crate::store::ResearchFindings;

/// 尽力而为策略名：精修预算用尽后仍提交最后一版代码
pub const BEST_EFFORT_RENDER: &str = "best_effort_render";

pub(crate) async fn run(
    rt: &FlowRuntime,
    ctx: &FlowContext,
    req: &FlowRequest,
    query: &str,
    files: &[String],
) -> Result<FlowOutput, FlowError> {
    let tool_ctx = rt.tool_context(req);
    let research = worksheet::run_research(rt, ctx, req, query, files, &tool_ctx).await;
    if research.reason == FinishReason::Error {
        return Err(FlowError::LlmError(
            "research phase failed before code generation".to_string(),
        ));
    }
    let findings = research.text;

    let mut code = String::new();
    let mut validated = false;
    let mut last_diagnostics = String::new();

    for attempt in 1..=rt.flows_cfg.max_refine_iterations {
        let spec = SubAgentSpec {
            system_prompt: prompts::CODE_GENERATOR.to_string(),
            prompt: prompts::code_generation_task(query, &findings, attempt, &last_diagnostics),
            allowed_tools: Vec::new(),
            max_steps: 1,
            temperature: rt.temperature,
            base_args: serde_json::json!({}),
        };
        let generation = rt.drive_phase(ctx, Phase::Code, spec).await;
        if generation.reason == FinishReason::Error {
            return Err(FlowError::LlmError(format!(
                "code generation failed on attempt {}",
                attempt
            )));
        }
        code = extract_code_block(&generation.text);

        // 外部校验：服务不可达视为「尚未通过」而非致命，走重试路径
        let (is_valid, diagnostics) = match rt.renderer.validate(&code).await {
            Ok(v) => (v.is_valid, v.diagnostics),
            Err(e) => (false, format!("validation service unavailable: {}", e)),
        };
        ctx.emit(FlowEvent::ValidationResult {
            attempt,
            is_valid,
            diagnostics: diagnostics.clone(),
        })
        .await;

        if is_valid {
            validated = true;
            break;
        }
        last_diagnostics = diagnostics;
        if attempt < rt.flows_cfg.max_refine_iterations {
            ctx.emit(FlowEvent::Refinement {
                attempt,
                feedback: last_diagnostics.clone(),
            })
            .await;
        }
    }

    let scene_name = extract_scene_name(&code).unwrap_or_else(|| "Scene".to_string());
    let submission = RenderSubmission {
        code: code.clone(),
        scene_name,
        quality: rt.renderer_cfg.quality.clone(),
        format: rt.renderer_cfg.format.clone(),
        timeout: rt.renderer_cfg.render_timeout_secs,
    };
    let job_id = rt
        .renderer
        .submit(&submission)
        .await
        .map_err(FlowError::RenderSubmitFailed)?;

    ctx.emit(FlowEvent::JobSubmitted {
        job_id: job_id.clone(),
    })
    .await;
    // 脱离请求的后台对账；流在渲染完成前就结束
    rt.watcher.reconcile(&job_id, &ctx.message_id).await;

    let (status, detail) = if validated {
        (FlowStatus::Completed, None)
    } else {
        (
            FlowStatus::CompletedWithWarnings,
            Some(format!(
                "{}: submitted unvalidated code after {} attempts",
                BEST_EFFORT_RENDER, rt.flows_cfg.max_refine_iterations
            )),
        )
    };
    Ok(FlowOutput {
        status,
        detail,
        findings: ResearchFindings {
            text: findings,
            sources: ctx.sources(),
        },
        content: code,
        files_processed: files.len() as u64,
    })
}

/// 从模型输出中剥出代码块（```python ... ``` 或任意 ``` 围栏；没有围栏则原样返回）
fn extract_code_block(text: &str) -> String {
    for marker in ["```python", "```"] {
        if let Some(start) = text.find(marker) {
            let rest = &text[start + marker.len()..];
            let rest = rest.strip_prefix('\n').unwrap_or(rest);
            if let Some(end) = rest.find("```") {
                return rest[..end].trim_end().to_string();
            }
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_code() {
        let text = "Here you go:\n```python\nfrom manim import *\n\nclass A(Scene):\n    pass\n```\ndone";
        let code = extract_code_block(text);
        assert!(code.starts_with("from manim import *"));
        assert!(code.ends_with("pass"));
    }

    #[test]
    fn test_extract_without_fence() {
        assert_eq!(extract_code_block("  x = 1  "), "x = 1");
    }
}
