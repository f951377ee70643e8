//! Sqlite-backed store. One connection behind an async mutex; every
//! statement runs inside a short critical section, never across I/O.

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{ConversationMessage, Role, Store, WebhookAuditEntry};
use crate::core::orchestrator::types::{Task, TaskState};
use crate::core::signal::now_epoch;
use crate::error::{EngineError, Result};

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        db.execute(
            "CREATE TABLE IF NOT EXISTS agent_tasks (
                id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                inputs TEXT NOT NULL,
                state TEXT NOT NULL,
                output TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                parent_id TEXT,
                idempotency_key TEXT,
                conversation_id TEXT,
                lease_until INTEGER
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS conversation_messages (
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                speaker TEXT,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, seq)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS webhook_audit (
                endpoint TEXT NOT NULL,
                external_id TEXT NOT NULL,
                signature_valid INTEGER NOT NULL,
                headers TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (endpoint, external_id)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS domain_entities (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                requester_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        info!("sqlite store ready at {path}");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let inputs: String = row.get(3)?;
        let state: String = row.get(4)?;
        Ok(Task {
            id: row.get(0)?,
            requester_id: row.get(1)?,
            agent_id: row.get(2)?,
            inputs: serde_json::from_str(&inputs).unwrap_or(Value::Null),
            state: TaskState::from_status(&state).unwrap_or(TaskState::Failed),
            output: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            completed_at: row.get(8)?,
            parent_id: row.get(9)?,
            idempotency_key: row.get(10)?,
            conversation_id: row.get(11)?,
            lease_until: row.get(12)?,
        })
    }
}

const TASK_COLUMNS: &str = "id, requester_id, agent_id, inputs, state, output, error, \
     created_at, completed_at, parent_id, idempotency_key, conversation_id, lease_until";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_tasks (id, requester_id, agent_id, inputs, state, output, error, \
             created_at, completed_at, parent_id, idempotency_key, conversation_id, lease_until) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id,
                task.requester_id,
                task.agent_id,
                serde_json::to_string(&task.inputs)?,
                task.state.as_str(),
                task.output,
                task.error,
                task.created_at,
                task.completed_at,
                task.parent_id,
                task.idempotency_key,
                task.conversation_id,
                task.lease_until,
            ],
        )?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let db = self.db.lock().await;
        db.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = ?1"),
            params![id],
            Self::row_to_task,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("task {id}")))
    }

    async fn cas_task_state(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
        lease_until: Option<i64>,
    ) -> Result<bool> {
        if from.is_terminal() {
            return Ok(false);
        }
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE agent_tasks SET state = ?1, lease_until = ?2 \
             WHERE id = ?3 AND state = ?4",
            params![to.as_str(), lease_until, id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    async fn set_task_output(
        &self,
        id: &str,
        output: Option<&str>,
        error: Option<&str>,
        completed_at: Option<i64>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE agent_tasks SET output = ?1, error = ?2, completed_at = ?3 \
             WHERE id = ?4 AND state IN ('queued', 'running', 'awaiting_child')",
            params![output, error, completed_at, id],
        )?;
        Ok(())
    }

    async fn extend_task_lease(&self, id: &str, lease_until: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE agent_tasks SET lease_until = ?1 WHERE id = ?2 AND state = 'running'",
            params![lease_until, id],
        )?;
        Ok(())
    }

    async fn find_live_task(
        &self,
        requester: &str,
        idempotency_key: &str,
    ) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let task = db
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM agent_tasks \
                     WHERE requester_id = ?1 AND idempotency_key = ?2 \
                     AND state IN ('queued', 'running', 'awaiting_child') \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![requester, idempotency_key],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    async fn list_tasks_by_requester(&self, requester: &str, limit: usize) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE requester_id = ?1 \
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![requester, limit as i64], Self::row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    async fn children_of(&self, parent_id: &str) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE parent_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![parent_id], Self::row_to_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        speaker: Option<&str>,
        content: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        // Single connection + mutex makes the max+insert pair atomic.
        let next_seq: i64 = db.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM conversation_messages \
             WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        db.execute(
            "INSERT INTO conversation_messages (conversation_id, seq, role, speaker, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                next_seq,
                role.as_str(),
                speaker,
                content,
                now_epoch()
            ],
        )?;
        Ok(next_seq)
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        n: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT conversation_id, seq, role, speaker, content, created_at \
             FROM conversation_messages WHERE conversation_id = ?1 \
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![conversation_id, n as i64], |row| {
            let role: String = row.get(2)?;
            Ok(ConversationMessage {
                conversation_id: row.get(0)?,
                seq: row.get(1)?,
                role: Role::from_str(&role).unwrap_or(Role::System),
                speaker: row.get(3)?,
                content: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse(); // oldest of the window first
        Ok(messages)
    }

    async fn insert_audit_entry(&self, entry: &WebhookAuditEntry) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO webhook_audit (endpoint, external_id, signature_valid, headers, received_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.endpoint,
                entry.external_id,
                entry.signature_valid as i32,
                serde_json::to_string(&entry.headers)?,
                entry.received_at,
            ],
        )?;
        Ok(())
    }

    async fn lookup_audit_entry(
        &self,
        endpoint: &str,
        external_id: &str,
    ) -> Result<Option<WebhookAuditEntry>> {
        let db = self.db.lock().await;
        let entry = db
            .query_row(
                "SELECT endpoint, external_id, signature_valid, headers, received_at \
                 FROM webhook_audit WHERE endpoint = ?1 AND external_id = ?2",
                params![endpoint, external_id],
                |row| {
                    let headers: String = row.get(3)?;
                    Ok(WebhookAuditEntry {
                        endpoint: row.get(0)?,
                        external_id: row.get(1)?,
                        signature_valid: row.get::<_, i32>(2)? != 0,
                        headers: serde_json::from_str(&headers).unwrap_or(Value::Null),
                        received_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    async fn insert_domain_entity(
        &self,
        kind: &str,
        requester_id: &str,
        payload: &Value,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO domain_entities (id, kind, requester_id, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                kind,
                requester_id,
                serde_json::to_string(payload)?,
                now_epoch()
            ],
        )?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open(":memory:").unwrap()
    }

    #[tokio::test]
    async fn task_insert_get_round_trip() {
        let s = store();
        let task = Task::new("u1", "engineer", json!({"prompt": "hi"}))
            .with_idempotency_key(Some("k1".into()))
            .with_conversation(Some("c1".into()));
        s.insert_task(&task).await.unwrap();
        let got = s.get_task(&task.id).await.unwrap();
        assert_eq!(got.agent_id, "engineer");
        assert_eq!(got.inputs, json!({"prompt": "hi"}));
        assert_eq!(got.state, TaskState::Queued);
        assert_eq!(got.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(got.conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn get_missing_task_is_not_found() {
        let s = store();
        assert!(matches!(
            s.get_task("nope").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cas_succeeds_once_and_respects_current_state() {
        let s = store();
        let task = Task::new("u1", "assistant", json!({}));
        s.insert_task(&task).await.unwrap();

        assert!(
            s.cas_task_state(&task.id, TaskState::Queued, TaskState::Running, Some(99))
                .await
                .unwrap()
        );
        // Second claimant loses the race.
        assert!(
            !s.cas_task_state(&task.id, TaskState::Queued, TaskState::Running, Some(99))
                .await
                .unwrap()
        );
        let got = s.get_task(&task.id).await.unwrap();
        assert_eq!(got.state, TaskState::Running);
        assert_eq!(got.lease_until, Some(99));
    }

    #[tokio::test]
    async fn terminal_states_are_frozen() {
        let s = store();
        let task = Task::new("u1", "assistant", json!({}));
        s.insert_task(&task).await.unwrap();
        assert!(
            s.cas_task_state(&task.id, TaskState::Queued, TaskState::Cancelled, None)
                .await
                .unwrap()
        );
        assert!(
            !s.cas_task_state(&task.id, TaskState::Cancelled, TaskState::Running, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn find_live_task_ignores_terminal_tasks() {
        let s = store();
        let task = Task::new("u1", "assistant", json!({})).with_idempotency_key(Some("dup".into()));
        s.insert_task(&task).await.unwrap();
        assert!(s.find_live_task("u1", "dup").await.unwrap().is_some());
        assert!(s.find_live_task("u2", "dup").await.unwrap().is_none());

        s.cas_task_state(&task.id, TaskState::Queued, TaskState::Completed, None)
            .await
            .unwrap();
        assert!(s.find_live_task("u1", "dup").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_seqs_increase_without_gaps() {
        let s = store();
        for i in 1..=5 {
            let seq = s
                .append_message("c1", Role::User, None, &format!("m{i}"))
                .await
                .unwrap();
            assert_eq!(seq, i);
        }
        // Independent conversation starts from 1.
        assert_eq!(
            s.append_message("c2", Role::User, None, "other").await.unwrap(),
            1
        );

        let recent = s.recent_messages("c1", 3).await.unwrap();
        let seqs: Vec<i64> = recent.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn audit_entries_dedup_on_endpoint_and_external_id() {
        let s = store();
        let entry = WebhookAuditEntry {
            endpoint: "scrape".into(),
            external_id: "abc123".into(),
            signature_valid: true,
            headers: json!({"x-webhook-signature": "sha256=..."}),
            received_at: now_epoch(),
        };
        assert!(s.lookup_audit_entry("scrape", "abc123").await.unwrap().is_none());
        s.insert_audit_entry(&entry).await.unwrap();
        assert!(s.lookup_audit_entry("scrape", "abc123").await.unwrap().is_some());
        // Same id on a different endpoint is a distinct event.
        assert!(s.lookup_audit_entry("mail", "abc123").await.unwrap().is_none());
        // Re-insert violates the primary key.
        assert!(s.insert_audit_entry(&entry).await.is_err());
    }

    #[tokio::test]
    async fn children_listed_in_creation_order() {
        let s = store();
        let parent = Task::new("u1", "product_manager", json!({}));
        s.insert_task(&parent).await.unwrap();
        let c1 = Task::new("u1", "engineer", json!({})).with_parent(&parent.id);
        let c2 = Task::new("u1", "finance_manager", json!({})).with_parent(&parent.id);
        s.insert_task(&c1).await.unwrap();
        s.insert_task(&c2).await.unwrap();
        let children = s.children_of(&parent.id).await.unwrap();
        assert_eq!(children.len(), 2);
    }

    #[tokio::test]
    async fn domain_entities_store_opaque_payloads() {
        let s = store();
        let id = s
            .insert_domain_entity("lead", "u1", &json!({"email": "a@b.example"}))
            .await
            .unwrap();
        assert!(!id.is_empty());
    }
}
