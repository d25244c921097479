//! Mentor - 课堂智能体编排服务
//!
//! 模块划分：
//! - **api**: HTTP 服务层（SSE 流式问答、历史回放、任务对账）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 流程错误类型
//! - **flows**: 流程状态机（答疑 / 工作单 / 内容创作）与 @文件引用 提取
//! - **jobs**: 渲染任务对账（有界轮询、终态幂等注入）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **render**: 渲染服务客户端（校验 / 提交 / 状态）
//! - **runner**: 子智能体有界工具调用循环与规范化事件
//! - **store**: 对话 / 消息 / 步骤持久化（内存 与 SQLite）
//! - **stream**: SSE 帧格式与解析约定
//! - **tools**: MCP 工具封装与执行器

pub mod api;
pub mod config;
pub mod core;
pub mod flows;
pub mod jobs;
pub mod llm;
pub mod render;
pub mod runner;
pub mod store;
pub mod stream;
pub mod tools;
