//! 内存存储实现
//!
//! RwLock<HashMap> 保存完整对话树，语义与 SQLite 实现一致；用于测试与无盘开发。

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::store::{
    AgentMessage, AgentMessageFinal, ChatStore, Conversation, ConversationStatus,
    ConversationSummary, ExecutionSummary, FlowKind, Phase, ResearchFindings, Step, StoreError,
    StoredMessage, UserMessage, derive_title, JOB_TERMINAL_EVENTS,
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    /// message_id -> conversation_id 反查表
    message_index: HashMap<String, String>,
}

/// 内存对话存储
#[derive(Default)]
pub struct MemoryChatStore {
    inner: RwLock<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn agent_message_mut<'a>(
        inner: &'a mut Inner,
        message_id: &str,
    ) -> Result<&'a mut AgentMessage, StoreError> {
        let conv_id = inner
            .message_index
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        let conv = inner
            .conversations
            .get_mut(&conv_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conv_id}")))?;
        conv.messages
            .iter_mut()
            .find_map(|m| match m {
                StoredMessage::Agent(am) if am.id == message_id => Some(am),
                _ => None,
            })
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn add_user_message(
        &self,
        conversation_id: &str,
        query: &str,
        referenced_files: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let conv = inner
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                id: conversation_id.to_string(),
                status: ConversationStatus::Active,
                message_count: 0,
                query_count: 0,
                response_count: 0,
                files_processed: 0,
                created_at: now,
                updated_at: now,
                messages: Vec::new(),
            });
        let seq = conv.messages.len() as u64;
        conv.messages.push(StoredMessage::User(UserMessage {
            seq,
            query: query.to_string(),
            referenced_files: referenced_files.to_vec(),
            timestamp: now,
        }));
        conv.message_count += 1;
        conv.query_count += 1;
        conv.files_processed += referenced_files.len() as u64;
        conv.updated_at = now;
        Ok(())
    }

    async fn init_agent_message(
        &self,
        conversation_id: &str,
        flow: FlowKind,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let conv = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let seq = conv.messages.len() as u64;
        conv.messages.push(StoredMessage::Agent(AgentMessage {
            id: id.clone(),
            seq,
            flow,
            started_at: now,
            ended_at: None,
            steps: Vec::new(),
            findings: ResearchFindings::default(),
            content: String::new(),
            summary: None,
            files_processed: 0,
        }));
        conv.message_count += 1;
        conv.updated_at = now;
        inner
            .message_index
            .insert(id.clone(), conversation_id.to_string());
        Ok(id)
    }

    async fn append_step(
        &self,
        message_id: &str,
        phase: Phase,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let msg = Self::agent_message_mut(&mut inner, message_id)?;
        let seq = msg.steps.len() as u64;
        msg.steps.push(Step {
            seq,
            phase,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        });
        Ok(seq)
    }

    async fn finalize(
        &self,
        message_id: &str,
        fin: AgentMessageFinal,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let conv_id = inner
            .message_index
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

        let now = Utc::now();
        {
            let msg = Self::agent_message_mut(&mut inner, message_id)?;
            if msg.summary.is_some() {
                // 已 finalize，第二次调用 no-op
                return Ok(false);
            }
            let duration_ms = (now - msg.started_at).num_milliseconds().max(0) as u64;
            let text_len = (fin.content.len() + fin.findings.text.len()) as u64;
            msg.ended_at = Some(now);
            msg.findings = fin.findings;
            msg.content = fin.content;
            msg.files_processed = fin.files_processed;
            msg.summary = Some(ExecutionSummary {
                success: fin.success,
                tool_calls: fin.tool_calls,
                text_len,
                duration_ms,
                error_count: fin.error_count,
                status: fin.status,
            });
        }

        let files = {
            let msg = Self::agent_message_mut(&mut inner, message_id)?;
            msg.files_processed
        };
        let conv = inner.conversations.get_mut(&conv_id).unwrap();
        conv.response_count += 1;
        conv.files_processed += files;
        conv.updated_at = now;
        Ok(true)
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.conversations.get(id).cloned())
    }

    async fn conversation_summaries(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut list: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .filter(|c| c.status != ConversationStatus::Deleted)
            .map(|c| {
                let title = c
                    .messages
                    .iter()
                    .find_map(|m| match m {
                        StoredMessage::User(u) => Some(derive_title(&u.query)),
                        _ => None,
                    })
                    .unwrap_or_default();
                ConversationSummary {
                    id: c.id.clone(),
                    title,
                    status: c.status,
                    message_count: c.message_count,
                    created_at: c.created_at,
                    updated_at: c.updated_at,
                }
            })
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.conversations.get_mut(id) {
            Some(conv) => {
                conv.status = status;
                conv.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let removed = inner.conversations.remove(id);
        if let Some(conv) = &removed {
            for m in &conv.messages {
                if let StoredMessage::Agent(am) = m {
                    inner.message_index.remove(&am.id);
                }
            }
        }
        Ok(removed.is_some())
    }

    async fn has_job_terminal_step(
        &self,
        message_id: &str,
        job_id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let msg = Self::agent_message_mut(&mut inner, message_id)?;
        Ok(has_terminal(msg, job_id))
    }

    async fn inject_job_outcome(
        &self,
        message_id: &str,
        job_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        // 查重与写入在同一把写锁内完成，并发注入只会落下一条终态
        let mut inner = self.inner.write().unwrap();
        let msg = Self::agent_message_mut(&mut inner, message_id)?;
        if has_terminal(msg, job_id) {
            return Ok(false);
        }
        let seq = msg.steps.len() as u64;
        msg.steps.push(Step {
            seq,
            phase: Phase::Video,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        });
        Ok(true)
    }
}

fn has_terminal(msg: &AgentMessage, job_id: &str) -> bool {
    msg.steps.iter().any(|s| {
        JOB_TERMINAL_EVENTS.contains(&s.event_type.as_str())
            && s.payload.get("job_id").and_then(|v| v.as_str()) == Some(job_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_follow_messages() {
        let store = MemoryChatStore::new();
        store
            .add_user_message("c1", "explain gravity", &["notes.txt".to_string()])
            .await
            .unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::DoubtClearance)
            .await
            .unwrap();
        store
            .finalize(
                &mid,
                AgentMessageFinal {
                    success: true,
                    status: "completed".to_string(),
                    content: "answer".to_string(),
                    files_processed: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let conv = store.conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.query_count, 1);
        assert_eq!(conv.response_count, 1);
        assert_eq!(conv.files_processed, 2);
    }

    #[tokio::test]
    async fn test_step_seq_contiguous() {
        let store = MemoryChatStore::new();
        store.add_user_message("c1", "q", &[]).await.unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::Worksheet)
            .await
            .unwrap();
        for i in 0..10u64 {
            let seq = store
                .append_step(&mid, Phase::Research, "text_delta", serde_json::json!({"i": i}))
                .await
                .unwrap();
            assert_eq!(seq, i);
        }
        let conv = store.conversation("c1").await.unwrap().unwrap();
        let steps = match &conv.messages[1] {
            StoredMessage::Agent(am) => &am.steps,
            _ => panic!("expected agent message"),
        };
        for (i, s) in steps.iter().enumerate() {
            assert_eq!(s.seq, i as u64);
        }
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let store = MemoryChatStore::new();
        store.add_user_message("c1", "q", &[]).await.unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::Worksheet)
            .await
            .unwrap();
        let fin = AgentMessageFinal {
            success: true,
            status: "completed".to_string(),
            ..Default::default()
        };
        assert!(store.finalize(&mid, fin.clone()).await.unwrap());
        assert!(!store.finalize(&mid, fin).await.unwrap());

        let conv = store.conversation("c1").await.unwrap().unwrap();
        // 第二次 finalize 不重复累计
        assert_eq!(conv.response_count, 1);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_list() {
        let store = MemoryChatStore::new();
        store.add_user_message("c1", "q", &[]).await.unwrap();
        assert!(store
            .set_status("c1", ConversationStatus::Deleted)
            .await
            .unwrap());
        assert!(store.conversation_summaries().await.unwrap().is_empty());
        // 软删除后数据仍在
        assert!(store.conversation("c1").await.unwrap().is_some());
        assert!(store.purge("c1").await.unwrap());
        assert!(store.conversation("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_outcome_injected_once() {
        let store = MemoryChatStore::new();
        store.add_user_message("c1", "q", &[]).await.unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::ContentCreation)
            .await
            .unwrap();
        let payload = serde_json::json!({"job_id": "j1", "output_file": "out.mp4"});
        assert!(store
            .inject_job_outcome(&mid, "j1", "job_completed", payload.clone())
            .await
            .unwrap());
        assert!(!store
            .inject_job_outcome(&mid, "j1", "job_completed", payload)
            .await
            .unwrap());
        assert!(store.has_job_terminal_step(&mid, "j1").await.unwrap());
    }
}
