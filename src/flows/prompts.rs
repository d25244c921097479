//! 各阶段 system prompt 与任务描述模板

/// 研究员：跨工具收集教学素材
pub const CONTENT_RESEARCHER: &str = "\
You are an educational content researcher. Gather high-quality, age-appropriate \
material for the request using the available tools: retrieve_content for uploaded \
documents, web_search for up-to-date facts, scrape_websites when you already have \
URLs worth reading in full. Cite where each key point came from. When you have \
enough material, reply with organized research findings as plain text.";

/// 出题人：基于研究产出编写并保存练习卷
pub const WORKSHEET_GENERATOR: &str = "\
You are an educational worksheet generator. Using only the research findings you \
are given, write a complete worksheet in Markdown: title, learning objectives, \
questions of increasing difficulty, and an answer key. You MUST persist the \
worksheet with the save_content tool before replying. Your final plain-text reply \
is a short confirmation plus the worksheet content.";

/// 答疑者：直接、准确地回答学生问题
pub const DOUBT_SOLVER: &str = "\
You are an educational doubt solver. Answer the student's question clearly and \
accurately, with short explanations and an example where it helps. Use \
retrieve_content when the question references uploaded documents and web_search \
for facts you are unsure about. Reply with the final answer as plain text.";

/// 动画代码作者：产出单场景 Manim 代码
pub const CODE_GENERATOR: &str = "\
You are an expert Manim animation author. Write a single self-contained Python \
file that visually explains the requested concept: one class inheriting from \
Scene, deterministic construct(), no file I/O, no network access, no interactive \
input. Reply with the code only, inside one ```python fenced block.";

/// 研究任务描述
pub fn research_task(query: &str, document_context: Option<&str>) -> String {
    match document_context {
        Some(ctx) => format!(
            "Research task: {}\n\nDocument context (from files the user referenced; \
             treat as primary source, consult it before any web search):\n{}",
            query, ctx
        ),
        None => format!("Research task: {}", query),
    }
}

/// 出题任务描述
pub fn worksheet_task(query: &str, findings: &str) -> String {
    format!(
        "User request: {}\n\nResearch findings:\n{}\n\nCreate the worksheet from \
         these findings and save it with save_content.",
        query, findings
    )
}

/// 答疑任务描述
pub fn doubt_task(query: &str, document_context: Option<&str>) -> String {
    match document_context {
        Some(ctx) => format!(
            "Student question: {}\n\nDocument context (from files the user \
             referenced):\n{}",
            query, ctx
        ),
        None => format!("Student question: {}", query),
    }
}

/// 代码生成任务描述；二轮起附上上一轮校验反馈
pub fn code_generation_task(
    query: &str,
    findings: &str,
    attempt: usize,
    last_diagnostics: &str,
) -> String {
    let mut task = format!(
        "Create a Manim animation explaining: {}\n\nResearch findings to ground the \
         animation:\n{}",
        query, findings
    );
    if attempt > 1 {
        task.push_str(&format!(
            "\n\nYour previous code failed validation with:\n{}\nFix these issues and \
             return the corrected full file.",
            last_diagnostics
        ));
    }
    task
}
