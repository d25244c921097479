//! 工具箱：MCP 工具服务封装（web_search / scrape_websites / retrieve_content / save_content）与执行器

pub mod executor;
pub mod mcp;
pub mod registry;

pub use executor::ToolExecutor;
pub use mcp::{
    ContentRetrieverTool, ContentSaverTool, McpClient, ToolContext, WebScraperTool, WebSearchTool,
};
pub use registry::{Tool, ToolRegistry};
