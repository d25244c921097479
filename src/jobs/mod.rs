//! 渲染任务对账
//!
//! 渲染任务在流程结束后仍在外部服务继续跑（detached）；本模块按固定间隔轮询其状态，
//! 有界次数内等到终态（completed / error）或以 timed_out 收场，并把终态作为合成步骤
//! 注入消息的步骤日志。同一 job 至多一个活跃 poller（in_flight 标记），
//! 同一 job 的终态至多注入一次（存储层查重），现场与历史回放重复触发都安全。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::RendererSection;
use crate::render::{RenderJobStatus, RendererApi};
use crate::store::{AgentMessage, ChatStore};

/// 轮询结果：timed_out 是与 error 不同的出口，UI 据此给出不同提示
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { output_file: Option<String> },
    Failed { message: String },
    TimedOut,
}

/// 有界轮询：每 interval 查询一次，至多 max_attempts 次。
/// 查询传输错误视为一次非终态观察（外部服务抖动不致命），继续轮询。
pub async fn poll_job(
    renderer: &dyn RendererApi,
    job_id: &str,
    interval: Duration,
    max_attempts: u32,
) -> PollOutcome {
    for attempt in 0..max_attempts {
        match renderer.job_status(job_id).await {
            Ok(RenderJobStatus::Completed { output_file, .. }) => {
                return PollOutcome::Completed { output_file };
            }
            Ok(RenderJobStatus::Error { message }) => {
                return PollOutcome::Failed { message };
            }
            Ok(RenderJobStatus::Processing { raw }) => {
                tracing::debug!(job_id, status = %raw, attempt, "render job still processing");
            }
            Err(e) => {
                tracing::warn!(job_id, attempt, "render status poll failed: {}", e);
            }
        }
        tokio::time::sleep(interval).await;
    }
    PollOutcome::TimedOut
}

/// 任务监视器：按 job_id 管理后台 poller，保证单飞与终态幂等注入
pub struct JobWatcher {
    store: Arc<dyn ChatStore>,
    renderer: Arc<dyn RendererApi>,
    interval: Duration,
    max_attempts: u32,
    /// 正在轮询中的 job_id（同一 job 的第二次对账请求是 no-op）
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl JobWatcher {
    pub fn new(
        store: Arc<dyn ChatStore>,
        renderer: Arc<dyn RendererApi>,
        cfg: &RendererSection,
    ) -> Self {
        Self {
            store,
            renderer,
            interval: Duration::from_secs(cfg.poll_interval_secs),
            max_attempts: cfg.poll_max_attempts,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 启动该 job 的后台对账；已在轮询或已有终态时 no-op 返回 false
    pub async fn reconcile(&self, job_id: &str, message_id: &str) -> bool {
        match self.store.has_job_terminal_step(message_id, job_id).await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(job_id, "terminal-step lookup failed: {}", e);
                return false;
            }
        }

        {
            let mut set = self.in_flight.lock().await;
            if !set.insert(job_id.to_string()) {
                return false;
            }
        }

        let store = Arc::clone(&self.store);
        let renderer = Arc::clone(&self.renderer);
        let in_flight = Arc::clone(&self.in_flight);
        let (interval, max_attempts) = (self.interval, self.max_attempts);
        let job_id = job_id.to_string();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            let outcome = poll_job(renderer.as_ref(), &job_id, interval, max_attempts).await;
            record(store.as_ref(), &job_id, &message_id, outcome).await;
            in_flight.lock().await.remove(&job_id);
        });
        true
    }
}

/// 将轮询结果写回步骤日志；终态经存储层查重，至多落一条
async fn record(store: &dyn ChatStore, job_id: &str, message_id: &str, outcome: PollOutcome) {
    let result = match outcome {
        PollOutcome::Completed { output_file } => {
            store
                .inject_job_outcome(
                    message_id,
                    job_id,
                    "job_completed",
                    serde_json::json!({ "job_id": job_id, "output_file": output_file }),
                )
                .await
        }
        PollOutcome::Failed { message } => {
            store
                .inject_job_outcome(
                    message_id,
                    job_id,
                    "job_error",
                    serde_json::json!({ "job_id": job_id, "error": message }),
                )
                .await
        }
        PollOutcome::TimedOut => {
            // 非终态：不锁定 job，后续对账可重新轮询
            store
                .append_step(
                    message_id,
                    crate::store::Phase::Video,
                    "job_poll_timeout",
                    serde_json::json!({ "job_id": job_id }),
                )
                .await
                .map(|_| true)
        }
    };
    if let Err(e) = result {
        // 持久化失败只记日志，不影响其他 job（代价是历史记录可能缺一条）
        tracing::warn!(job_id, "failed to record job outcome: {}", e);
    }
}

/// 回放辅助：从持久化消息中找出仍未到终态的渲染任务引用。
/// 历史重建时对返回的 job_id 重新发起对账即可。
pub fn pending_job_reference(msg: &AgentMessage) -> Option<String> {
    let submitted = msg
        .steps
        .iter()
        .rev()
        .find(|s| s.event_type == "job_submitted")?;
    let job_id = submitted.payload.get("job_id")?.as_str()?.to_string();

    let terminal = msg.steps.iter().any(|s| {
        crate::store::JOB_TERMINAL_EVENTS.contains(&s.event_type.as_str())
            && s.payload.get("job_id").and_then(|v| v.as_str()) == Some(job_id.as_str())
    });
    if terminal {
        None
    } else {
        Some(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatStore, FlowKind, MemoryChatStore, Phase, StoredMessage};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct StubRenderer {
        statuses: std::sync::Mutex<VecDeque<RenderJobStatus>>,
    }

    impl StubRenderer {
        fn repeating_processing() -> Self {
            Self {
                statuses: std::sync::Mutex::new(VecDeque::new()),
            }
        }

        fn scripted(statuses: Vec<RenderJobStatus>) -> Self {
            Self {
                statuses: std::sync::Mutex::new(statuses.into()),
            }
        }
    }

    #[async_trait]
    impl RendererApi for StubRenderer {
        async fn validate(&self, _code: &str) -> Result<crate::render::Validation, String> {
            Ok(crate::render::Validation {
                is_valid: true,
                diagnostics: String::new(),
            })
        }

        async fn submit(
            &self,
            _submission: &crate::render::RenderSubmission,
        ) -> Result<String, String> {
            Ok("job-1".to_string())
        }

        async fn job_status(&self, _job_id: &str) -> Result<RenderJobStatus, String> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RenderJobStatus::Processing {
                    raw: "running".to_string(),
                }))
        }
    }

    fn renderer_cfg() -> RendererSection {
        RendererSection {
            poll_interval_secs: 0,
            poll_max_attempts: 5,
            ..Default::default()
        }
    }

    async fn seeded_message(store: &MemoryChatStore, job_id: &str) -> String {
        store.add_user_message("c1", "make a video", &[]).await.unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::ContentCreation)
            .await
            .unwrap();
        store
            .append_step(
                &mid,
                Phase::Video,
                "job_submitted",
                serde_json::json!({ "job_id": job_id }),
            )
            .await
            .unwrap();
        mid
    }

    #[tokio::test]
    async fn test_poll_timeout_is_distinct_outcome() {
        let renderer = StubRenderer::repeating_processing();
        let outcome = poll_job(&renderer, "j1", Duration::from_millis(1), 5).await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_poll_reaches_completion() {
        let renderer = StubRenderer::scripted(vec![
            RenderJobStatus::Processing {
                raw: "queued".to_string(),
            },
            RenderJobStatus::Completed {
                output_file: Some("out.mp4".to_string()),
                message: "done".to_string(),
            },
        ]);
        let outcome = poll_job(&renderer, "j1", Duration::from_millis(1), 5).await;
        assert_eq!(
            outcome,
            PollOutcome::Completed {
                output_file: Some("out.mp4".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_transport_errors_do_not_terminate_poll() {
        struct FlakyRenderer;

        #[async_trait]
        impl RendererApi for FlakyRenderer {
            async fn validate(&self, _c: &str) -> Result<crate::render::Validation, String> {
                unreachable!()
            }
            async fn submit(
                &self,
                _s: &crate::render::RenderSubmission,
            ) -> Result<String, String> {
                unreachable!()
            }
            async fn job_status(&self, _j: &str) -> Result<RenderJobStatus, String> {
                Err("502".to_string())
            }
        }

        let outcome = poll_job(&FlakyRenderer, "j1", Duration::from_millis(1), 3).await;
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_injects_once() {
        let store = Arc::new(MemoryChatStore::new());
        let mid = seeded_message(&store, "j1").await;

        let renderer = Arc::new(StubRenderer::scripted(vec![
            RenderJobStatus::Completed {
                output_file: Some("out.mp4".to_string()),
                message: "done".to_string(),
            },
            RenderJobStatus::Completed {
                output_file: Some("out.mp4".to_string()),
                message: "done".to_string(),
            },
        ]));
        let watcher = Arc::new(JobWatcher::new(
            store.clone() as Arc<dyn ChatStore>,
            renderer,
            &renderer_cfg(),
        ));

        let first = watcher.reconcile("j1", &mid).await;
        let _second = watcher.reconcile("j1", &mid).await;
        assert!(first);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let conv = store.conversation("c1").await.unwrap().unwrap();
        let steps = match &conv.messages[1] {
            StoredMessage::Agent(am) => &am.steps,
            _ => panic!("expected agent message"),
        };
        let terminals = steps
            .iter()
            .filter(|s| s.event_type == "job_completed")
            .count();
        assert_eq!(terminals, 1);

        // 终态落定后再次对账是 no-op
        assert!(!watcher.reconcile("j1", &mid).await);
    }

    #[tokio::test]
    async fn test_pending_job_reference_detection() {
        let store = MemoryChatStore::new();
        let mid = seeded_message(&store, "j7").await;

        let conv = store.conversation("c1").await.unwrap().unwrap();
        let msg = match &conv.messages[1] {
            StoredMessage::Agent(am) => am.clone(),
            _ => panic!("expected agent message"),
        };
        assert_eq!(pending_job_reference(&msg), Some("j7".to_string()));

        store
            .inject_job_outcome(
                &mid,
                "j7",
                "job_completed",
                serde_json::json!({ "job_id": "j7" }),
            )
            .await
            .unwrap();
        let conv = store.conversation("c1").await.unwrap().unwrap();
        let msg = match &conv.messages[1] {
            StoredMessage::Agent(am) => am.clone(),
            _ => panic!("expected agent message"),
        };
        assert_eq!(pending_job_reference(&msg), None);
    }
}
