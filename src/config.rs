//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MENTOR__*` 覆盖（双下划线表示嵌套，如 `MENTOR__LLM__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub flows: FlowsSection,
    #[serde(default)]
    pub renderer: RendererSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：服务名、监听地址、数据库路径
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite 数据库文件路径；未设置时用内存存储（开发/测试）
    pub database_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

/// [llm] 段：OpenAI 兼容端点与采样参数
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

/// [flows] 段：各流程的步数预算与门槛
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowsSection {
    /// 研究产出最小字数，低于此值时工作单流程在生成前失败
    pub min_findings_chars: usize,
    /// 代码生成-校验循环最大迭代数
    pub max_refine_iterations: usize,
    /// 研究模式 simple 的工具调用预算
    pub simple_tool_calls: usize,
    /// 研究模式 moderate 的工具调用预算
    pub moderate_tool_calls: usize,
    /// 研究模式 deep 的工具调用预算
    pub deep_tool_calls: usize,
    /// 生成阶段（保存文档等）的步数上限
    pub generation_max_steps: usize,
}

impl Default for FlowsSection {
    fn default() -> Self {
        Self {
            min_findings_chars: 100,
            max_refine_iterations: 3,
            simple_tool_calls: 3,
            moderate_tool_calls: 7,
            deep_tool_calls: 10,
            generation_max_steps: 4,
        }
    }
}

/// [renderer] 段：视频渲染服务端点、画质与轮询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RendererSection {
    pub base_url: String,
    /// low_quality / medium_quality / high_quality
    pub quality: String,
    /// mp4 / gif
    pub format: String,
    /// 渲染进程自身的超时（秒），透传给渲染服务
    pub render_timeout_secs: u64,
    /// 状态轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 状态轮询最大次数，超出后以 timed_out 结束
    pub poll_max_attempts: u32,
}

impl Default for RendererSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8100".to_string(),
            quality: "medium_quality".to_string(),
            format: "mp4".to_string(),
            render_timeout_secs: 300,
            poll_interval_secs: 2,
            poll_max_attempts: 30,
        }
    }
}

/// [tools] 段：工具服务端点与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// MCP 风格工具服务（web_search / scrape_websites / retrieve_content / save_content）
    pub mcp_url: String,
    /// 单次工具 HTTP 调用超时（秒）
    pub call_timeout_secs: u64,
    /// 执行器层面的单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            mcp_url: "http://127.0.0.1:8200".to_string(),
            call_timeout_secs: 30,
            tool_timeout_secs: 60,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            flows: FlowsSection::default(),
            renderer: RendererSection::default(),
            tools: ToolsSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MENTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MENTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MENTOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.flows.min_findings_chars, 100);
        assert_eq!(cfg.flows.max_refine_iterations, 3);
        assert_eq!(cfg.renderer.poll_interval_secs, 2);
        assert_eq!(cfg.renderer.poll_max_attempts, 30);
    }
}
