//! Mentor - 课堂智能体编排服务
//!
//! 入口：初始化日志、加载配置、组装协作方并启动 HTTP 服务。

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mentor::api::{build_router, build_state};
use mentor::config::load_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).context("Failed to load config")?;
    let addr = format!("{}:{}", cfg.app.host, cfg.app.port);

    let state = build_state(cfg).context("Failed to build app state")?;
    let router = build_router(state);

    tracing::info!("mentor listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router).await.context("Server failed")?;

    Ok(())
}
