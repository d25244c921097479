//! SQLite 存储实现
//!
//! conversations / messages / steps 三张表；append_step 是单行 INSERT（目标式追加），
//! 不做整条消息的读-改-写，流式循环里高频 append 不会互相覆盖。
//! 序号分配与查重都在同一把连接锁内完成。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{
    AgentMessage, AgentMessageFinal, ChatStore, Conversation, ConversationStatus,
    ConversationSummary, ExecutionSummary, FlowKind, Phase, ResearchFindings, Step, StoreError,
    StoredMessage, UserMessage, derive_title,
};

/// SQLite 对话存储：单连接 + 互斥锁
pub struct SqliteChatStore {
    conn: Mutex<Connection>,
}

impl SqliteChatStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                 id              TEXT PRIMARY KEY,
                 status          TEXT NOT NULL,
                 message_count   INTEGER NOT NULL DEFAULT 0,
                 query_count     INTEGER NOT NULL DEFAULT 0,
                 response_count  INTEGER NOT NULL DEFAULT 0,
                 files_processed INTEGER NOT NULL DEFAULT 0,
                 created_at      TEXT NOT NULL,
                 updated_at      TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS messages (
                 id               TEXT PRIMARY KEY,
                 conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                 seq              INTEGER NOT NULL,
                 kind             TEXT NOT NULL,
                 query            TEXT,
                 referenced_files TEXT,
                 flow             TEXT,
                 started_at       TEXT,
                 ended_at         TEXT,
                 findings_text    TEXT,
                 findings_sources TEXT,
                 content          TEXT,
                 summary          TEXT,
                 files_processed  INTEGER NOT NULL DEFAULT 0,
                 timestamp        TEXT,
                 UNIQUE(conversation_id, seq)
             );
             CREATE TABLE IF NOT EXISTS steps (
                 message_id TEXT NOT NULL REFERENCES messages(id),
                 seq        INTEGER NOT NULL,
                 phase      TEXT NOT NULL,
                 event_type TEXT NOT NULL,
                 timestamp  TEXT NOT NULL,
                 payload    TEXT NOT NULL,
                 job_id     TEXT,
                 PRIMARY KEY(message_id, seq)
             );
             CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conversation_id, seq);
             CREATE INDEX IF NOT EXISTS idx_steps_job ON steps(message_id, job_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn ensure_conversation(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO conversations (id, status, created_at, updated_at)
             VALUES (?1, 'active', ?2, ?2)",
            params![id, now],
        )?;
        Ok(())
    }

    fn next_message_seq(conn: &Connection, conversation_id: &str) -> Result<u64, StoreError> {
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }

    fn conversation_id_of(conn: &Connection, message_id: &str) -> Result<String, StoreError> {
        conn.query_row(
            "SELECT conversation_id FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }

    fn load_steps(conn: &Connection, message_id: &str) -> Result<Vec<Step>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT seq, phase, event_type, timestamp, payload
             FROM steps WHERE message_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut steps = Vec::new();
        for row in rows {
            let (seq, phase, event_type, timestamp, payload) = row?;
            steps.push(Step {
                seq: seq as u64,
                phase: Phase::parse(&phase)
                    .ok_or_else(|| StoreError::Backend(format!("bad phase: {phase}")))?,
                event_type,
                timestamp,
                payload: serde_json::from_str(&payload)
                    .unwrap_or(serde_json::Value::String(payload)),
            });
        }
        Ok(steps)
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn add_user_message(
        &self,
        conversation_id: &str,
        query: &str,
        referenced_files: &[String],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        Self::ensure_conversation(&conn, conversation_id, now)?;
        let seq = Self::next_message_seq(&conn, conversation_id)?;
        let files_json = serde_json::to_string(referenced_files)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, seq, kind, query, referenced_files, timestamp)
             VALUES (?1, ?2, ?3, 'user', ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                conversation_id,
                seq as i64,
                query,
                files_json,
                now
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET
                 message_count = message_count + 1,
                 query_count = query_count + 1,
                 files_processed = files_processed + ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![conversation_id, referenced_files.len() as i64, now],
        )?;
        Ok(())
    }

    async fn init_agent_message(
        &self,
        conversation_id: &str,
        flow: FlowKind,
    ) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }
        let now = Utc::now();
        let seq = Self::next_message_seq(&conn, conversation_id)?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, seq, kind, flow, started_at,
                                   findings_text, findings_sources, content)
             VALUES (?1, ?2, ?3, 'agent', ?4, ?5, '', '[]', '')",
            params![id, conversation_id, seq as i64, flow.as_str(), now],
        )?;
        conn.execute(
            "UPDATE conversations SET message_count = message_count + 1, updated_at = ?2
             WHERE id = ?1",
            params![conversation_id, now],
        )?;
        Ok(id)
    }

    async fn append_step(
        &self,
        message_id: &str,
        phase: Phase,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM steps WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        let job_id = payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        conn.execute(
            "INSERT INTO steps (message_id, seq, phase, event_type, timestamp, payload, job_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message_id,
                seq,
                phase.as_str(),
                event_type,
                Utc::now(),
                payload.to_string(),
                job_id
            ],
        )?;
        Ok(seq as u64)
    }

    async fn finalize(
        &self,
        message_id: &str,
        fin: AgentMessageFinal,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row: Option<(String, DateTime<Utc>, Option<String>)> = tx
            .query_row(
                "SELECT conversation_id, started_at, summary FROM messages
                 WHERE id = ?1 AND kind = 'agent'",
                params![message_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (conversation_id, started_at, summary) =
            row.ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if summary.is_some() {
            return Ok(false);
        }

        let now = Utc::now();
        let duration_ms = (now - started_at).num_milliseconds().max(0) as u64;
        let summary = ExecutionSummary {
            success: fin.success,
            tool_calls: fin.tool_calls,
            text_len: (fin.content.len() + fin.findings.text.len()) as u64,
            duration_ms,
            error_count: fin.error_count,
            status: fin.status,
        };
        tx.execute(
            "UPDATE messages SET ended_at = ?2, findings_text = ?3, findings_sources = ?4,
                 content = ?5, summary = ?6, files_processed = ?7
             WHERE id = ?1",
            params![
                message_id,
                now,
                fin.findings.text,
                serde_json::to_string(&fin.findings.sources)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
                fin.content,
                serde_json::to_string(&summary)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
                fin.files_processed as i64
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET
                 response_count = response_count + 1,
                 files_processed = files_processed + ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![conversation_id, fin.files_processed as i64, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let conv: Option<Conversation> = conn
            .query_row(
                "SELECT id, status, message_count, query_count, response_count,
                        files_processed, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        status: ConversationStatus::parse(&row.get::<_, String>(1)?)
                            .unwrap_or(ConversationStatus::Active),
                        message_count: row.get::<_, i64>(2)? as u64,
                        query_count: row.get::<_, i64>(3)? as u64,
                        response_count: row.get::<_, i64>(4)? as u64,
                        files_processed: row.get::<_, i64>(5)? as u64,
                        created_at: row.get(6)?,
                        updated_at: row.get(7)?,
                        messages: Vec::new(),
                    })
                },
            )
            .optional()?;
        let mut conv = match conv {
            Some(c) => c,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare(
            "SELECT id, seq, kind, query, referenced_files, flow, started_at, ended_at,
                    findings_text, findings_sources, content, summary, files_processed, timestamp
             FROM messages WHERE conversation_id = ?1 ORDER BY seq",
        )?;
        #[allow(clippy::type_complexity)]
        let rows: Vec<(
            String,
            i64,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            Option<DateTime<Utc>>,
        )> = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                    row.get(13)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        for (
            msg_id,
            seq,
            kind,
            query,
            referenced_files,
            flow,
            started_at,
            ended_at,
            findings_text,
            findings_sources,
            content,
            summary,
            files_processed,
            timestamp,
        ) in rows
        {
            match kind.as_str() {
                "user" => {
                    conv.messages.push(StoredMessage::User(UserMessage {
                        seq: seq as u64,
                        query: query.unwrap_or_default(),
                        referenced_files: referenced_files
                            .as_deref()
                            .and_then(|s| serde_json::from_str(s).ok())
                            .unwrap_or_default(),
                        timestamp: timestamp.unwrap_or_else(Utc::now),
                    }));
                }
                _ => {
                    let steps = Self::load_steps(&conn, &msg_id)?;
                    conv.messages.push(StoredMessage::Agent(AgentMessage {
                        id: msg_id,
                        seq: seq as u64,
                        flow: flow
                            .as_deref()
                            .and_then(FlowKind::parse)
                            .unwrap_or(FlowKind::DoubtClearance),
                        started_at: started_at.unwrap_or_else(Utc::now),
                        ended_at,
                        steps,
                        findings: ResearchFindings {
                            text: findings_text.unwrap_or_default(),
                            sources: findings_sources
                                .as_deref()
                                .and_then(|s| serde_json::from_str(s).ok())
                                .unwrap_or_default(),
                        },
                        content: content.unwrap_or_default(),
                        summary: summary.as_deref().and_then(|s| serde_json::from_str(s).ok()),
                        files_processed: files_processed as u64,
                    }));
                }
            }
        }
        Ok(Some(conv))
    }

    async fn conversation_summaries(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.status, c.message_count, c.created_at, c.updated_at,
                    (SELECT query FROM messages m
                     WHERE m.conversation_id = c.id AND m.kind = 'user'
                     ORDER BY m.seq LIMIT 1)
             FROM conversations c
             WHERE c.status != 'deleted'
             ORDER BY c.updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut list = Vec::new();
        for row in rows {
            let (id, status, message_count, created_at, updated_at, first_query) = row?;
            list.push(ConversationSummary {
                id,
                title: derive_title(first_query.as_deref().unwrap_or("")),
                status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
                message_count: message_count as u64,
                created_at,
                updated_at,
            });
        }
        Ok(list)
    }

    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    async fn purge(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM steps WHERE message_id IN
                 (SELECT id FROM messages WHERE conversation_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    async fn has_job_terminal_step(
        &self,
        message_id: &str,
        job_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM steps
                 WHERE message_id = ?1 AND job_id = ?2
                   AND event_type IN ('job_completed', 'job_error')
                 LIMIT 1",
                params![message_id, job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn inject_job_outcome(
        &self,
        message_id: &str,
        job_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        // 查重与插入放进同一事务，两个调用方并发注入也只会落下一条终态
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let found: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM steps
                 WHERE message_id = ?1 AND job_id = ?2
                   AND event_type IN ('job_completed', 'job_error')
                 LIMIT 1",
                params![message_id, job_id],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_some() {
            return Ok(false);
        }
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM steps WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO steps (message_id, seq, phase, event_type, timestamp, payload, job_id)
             VALUES (?1, ?2, 'video', ?3, ?4, ?5, ?6)",
            params![
                message_id,
                seq,
                event_type,
                Utc::now(),
                payload.to_string(),
                job_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChatStore::open(dir.path().join("mentor.db")).unwrap();

        store
            .add_user_message("c1", "explain photosynthesis", &["bio.pdf".to_string()])
            .await
            .unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::Worksheet)
            .await
            .unwrap();
        store
            .append_step(
                &mid,
                Phase::Research,
                "text_delta",
                serde_json::json!({"text": "found stuff"}),
            )
            .await
            .unwrap();
        store
            .finalize(
                &mid,
                AgentMessageFinal {
                    success: true,
                    status: "completed".to_string(),
                    findings: ResearchFindings {
                        text: "found stuff".to_string(),
                        sources: vec!["bio.pdf".to_string()],
                    },
                    content: "worksheet md".to_string(),
                    tool_calls: 2,
                    files_processed: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let conv = store.conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.message_count, 2);
        assert_eq!(conv.files_processed, 2);
        let agent = match &conv.messages[1] {
            StoredMessage::Agent(am) => am,
            _ => panic!("expected agent message"),
        };
        assert_eq!(agent.steps.len(), 1);
        assert_eq!(agent.content, "worksheet md");
        let summary = agent.summary.as_ref().unwrap();
        assert!(summary.success);
        assert_eq!(summary.tool_calls, 2);
        assert!(agent.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_sqlite_finalize_idempotent() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        store.add_user_message("c1", "q", &[]).await.unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::DoubtClearance)
            .await
            .unwrap();
        let fin = AgentMessageFinal {
            success: false,
            status: "error".to_string(),
            ..Default::default()
        };
        assert!(store.finalize(&mid, fin.clone()).await.unwrap());
        assert!(!store.finalize(&mid, fin).await.unwrap());
        let conv = store.conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.response_count, 1);
    }

    #[tokio::test]
    async fn test_sqlite_job_dedup() {
        let store = SqliteChatStore::open_in_memory().unwrap();
        store.add_user_message("c1", "q", &[]).await.unwrap();
        let mid = store
            .init_agent_message("c1", FlowKind::ContentCreation)
            .await
            .unwrap();
        let payload = serde_json::json!({"job_id": "j9", "error": "boom"});
        assert!(store
            .inject_job_outcome(&mid, "j9", "job_error", payload.clone())
            .await
            .unwrap());
        assert!(!store
            .inject_job_outcome(&mid, "j9", "job_error", payload)
            .await
            .unwrap());
        assert!(store.has_job_terminal_step(&mid, "j9").await.unwrap());
    }
}
