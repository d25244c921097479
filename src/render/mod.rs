//! 视频渲染服务客户端（外部协作方，只消费不拥有）
//!
//! 三个端点：POST /validate 校验代码、POST /render 提交渲染（返回 job_id）、
//! GET /status/{job_id} 查询状态。completed / error 之外的状态一律视为仍在处理。
//! RendererApi trait 作为接缝，测试用桩实现替换 HTTP 客户端。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RendererSection;

/// 代码校验结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub is_valid: bool,
    #[serde(default)]
    pub diagnostics: String,
}

/// 渲染提交参数
#[derive(Debug, Clone, Serialize)]
pub struct RenderSubmission {
    pub code: String,
    pub scene_name: String,
    pub quality: String,
    pub format: String,
    /// 渲染进程超时（秒），透传给渲染服务
    pub timeout: u64,
}

/// 轮询到的任务状态；Processing 覆盖 queued / running 等一切非终态
#[derive(Debug, Clone)]
pub enum RenderJobStatus {
    Processing { raw: String },
    Completed {
        output_file: Option<String>,
        message: String,
    },
    Error { message: String },
}

/// 渲染服务接缝：校验、提交、查询
#[async_trait]
pub trait RendererApi: Send + Sync {
    async fn validate(&self, code: &str) -> Result<Validation, String>;

    async fn submit(&self, submission: &RenderSubmission) -> Result<String, String>;

    async fn job_status(&self, job_id: &str) -> Result<RenderJobStatus, String>;
}

/// HTTP 实现
pub struct HttpRenderer {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRenderer {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(cfg: &RendererSection) -> Self {
        Self::new(&cfg.base_url)
    }
}

#[async_trait]
impl RendererApi for HttpRenderer {
    async fn validate(&self, code: &str) -> Result<Validation, String> {
        let resp = self
            .http
            .post(format!("{}/validate", self.base_url))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        resp.json::<Validation>().await.map_err(|e| e.to_string())
    }

    async fn submit(&self, submission: &RenderSubmission) -> Result<String, String> {
        let resp = self
            .http
            .post(format!("{}/render", self.base_url))
            .json(submission)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("render submit rejected ({}): {}", status, body));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        body.get("job_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "render response missing job_id".to_string())
    }

    async fn job_status(&self, job_id: &str) -> Result<RenderJobStatus, String> {
        let resp = self
            .http
            .get(format!("{}/status/{}", self.base_url, job_id))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let message = body
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(match status.as_str() {
            "completed" => RenderJobStatus::Completed {
                output_file: body
                    .get("output_file")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                message,
            },
            "error" => RenderJobStatus::Error {
                message: body
                    .get("error_details")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or(message),
            },
            _ => RenderJobStatus::Processing { raw: status },
        })
    }
}

/// 从生成代码里提取场景类名（class Foo(Scene) 风格）；找不到时调用方退回默认
pub fn extract_scene_name(code: &str) -> Option<String> {
    let re = regex::Regex::new(r"class\s+(\w+)\s*\(\s*\w*Scene\w*\s*\)").ok()?;
    re.captures(code)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_scene_name() {
        let code = "from manim import *\n\nclass PythagorasProof(Scene):\n    def construct(self):\n        pass\n";
        assert_eq!(
            extract_scene_name(code).as_deref(),
            Some("PythagorasProof")
        );
        assert_eq!(extract_scene_name("print('no scene here')"), None);
    }
}
