//! MCP 工具服务封装
//!
//! 工具服务统一暴露 POST {base}/tools/call，body 为 {name, arguments}，
//! 返回 {content: [{text}], isError}；四个具名工具（web_search / scrape_websites /
//! retrieve_content / save_content）各自包一层 Tool 实现，参数原样透传。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 每次工具调用随 args 附带的会话上下文（检索与保存需要按会话/课堂定位文档）
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    pub classroom_id: Option<String>,
    pub subject_id: Option<String>,
}

impl ToolContext {
    /// 转为 JSON object，由 runner 合并进每次 tool call 的 args
    pub fn base_args(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "conversation_id".to_string(),
            Value::String(self.conversation_id.clone()),
        );
        if let Some(ref c) = self.classroom_id {
            obj.insert("classroom_id".to_string(), Value::String(c.clone()));
        }
        if let Some(ref s) = self.subject_id {
            obj.insert("subject_id".to_string(), Value::String(s.clone()));
        }
        Value::Object(obj)
    }
}

/// MCP 工具服务客户端：POST tools/call 并解包 content[0].text
pub struct McpClient {
    http: reqwest::Client,
    base_url: String,
}

impl McpClient {
    pub fn new(base_url: &str, call_timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(call_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn call(&self, name: &str, arguments: Value) -> Result<String, String> {
        let resp = self
            .http
            .post(format!("{}/tools/call", self.base_url))
            .json(&serde_json::json!({ "name": name, "arguments": arguments }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
        let text = body
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        if body.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
            let msg = if text.is_empty() {
                "Unknown error".to_string()
            } else {
                text
            };
            return Err(msg);
        }
        Ok(text)
    }
}

/// 网络搜索（Tavily 等，由工具服务代理）
pub struct WebSearchTool {
    mcp: Arc<McpClient>,
}

impl WebSearchTool {
    pub fn new(mcp: Arc<McpClient>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for educational content, facts, and up-to-date information."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "max_results": { "type": "integer", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.mcp.call("web_search", args).await
    }
}

/// 网页抓取：给定 URL 列表，抽取正文
pub struct WebScraperTool {
    mcp: Arc<McpClient>,
}

impl WebScraperTool {
    pub fn new(mcp: Arc<McpClient>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Tool for WebScraperTool {
    fn name(&self) -> &str {
        "scrape_websites"
    }

    fn description(&self) -> &str {
        "Scrape and extract content from specific web pages when you already have URLs."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "urls": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["urls"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.mcp.call("scrape_websites", args).await
    }
}

/// 文档检索：按 @文件引用 或语义查询取回已入库文档的相关片段
pub struct ContentRetrieverTool {
    mcp: Arc<McpClient>,
}

impl ContentRetrieverTool {
    pub fn new(mcp: Arc<McpClient>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Tool for ContentRetrieverTool {
    fn name(&self) -> &str {
        "retrieve_content"
    }

    fn description(&self) -> &str {
        "Retrieve relevant chunks from previously ingested documents. \
         Use when the query references uploaded files or needs document context."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "filenames": { "type": "array", "items": { "type": "string" } },
                "top_k": { "type": "integer", "default": 5 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.mcp.call("retrieve_content", args).await
    }
}

/// 文档保存：Markdown 转 PDF 并写入对象存储
pub struct ContentSaverTool {
    mcp: Arc<McpClient>,
}

impl ContentSaverTool {
    pub fn new(mcp: Arc<McpClient>) -> Self {
        Self { mcp }
    }
}

#[async_trait]
impl Tool for ContentSaverTool {
    fn name(&self) -> &str {
        "save_content"
    }

    fn description(&self) -> &str {
        "Convert markdown content to PDF and save it to storage. \
         Always use this to persist a generated worksheet."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Markdown content" },
                "title": { "type": "string" }
            },
            "required": ["content", "title"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.mcp.call("save_content", args).await
    }
}
