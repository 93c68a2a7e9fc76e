//! SQLite-backed `Store`.
//!
//! Grounded on `synapsed-swarm::persistence::SqliteTrustStore`: a single
//! `tokio_rusqlite::Connection` wrapping `rusqlite`, with each operation
//! dispatched through `connection.call(move |conn| { ... })`. Each durable
//! entity from spec.md §3 gets its own table; columns used in a `WHERE` or
//! `ORDER BY` clause in spec.md §6 ("Persisted state layout") are real
//! columns, the rest of the entity is stored as a JSON payload column so
//! the schema doesn't have to be re-migrated every time a field is added.

use super::{MessageStatsRow, MessageTransition, Store};
use crate::error::{CoreError, CoreResult};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tokio_rusqlite::Connection;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to open store at {path:?}: {e}")))?;
        Ok(Self { conn })
    }

    pub async fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to open in-memory store: {e}")))?;
        Ok(Self { conn })
    }
}

fn to_json(value: &impl serde::Serialize) -> CoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> CoreResult<T> {
    serde_json::from_str(s).map_err(|e| CoreError::Transient(format!("corrupt stored row: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> CoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS messages (
                        id TEXT PRIMARY KEY,
                        to_agent TEXT,
                        status TEXT NOT NULL,
                        priority INTEGER NOT NULL,
                        created_at TEXT NOT NULL,
                        conversation_id TEXT,
                        expires_at TEXT,
                        data TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_messages_to_agent_status ON messages(to_agent, status);
                    CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
                    CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at);

                    CREATE TABLE IF NOT EXISTS conversations (
                        id TEXT PRIMARY KEY,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS templates (
                        name TEXT PRIMARY KEY,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS agents (
                        id TEXT PRIMARY KEY,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS sources (
                        id TEXT PRIMARY KEY,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS regulatory_items (
                        id TEXT PRIMARY KEY,
                        detected_at TEXT NOT NULL,
                        data TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_items_detected ON regulatory_items(detected_at DESC);

                    CREATE TABLE IF NOT EXISTS consensus_configs (
                        id TEXT PRIMARY KEY,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS consensus_results (
                        id TEXT PRIMARY KEY,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS scenarios (
                        id TEXT PRIMARY KEY,
                        created_by TEXT,
                        data TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS executions (
                        id TEXT PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        data TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_executions_user ON executions(user_id, created_at DESC);
                    CREATE TABLE IF NOT EXISTS results (
                        execution_id TEXT PRIMARY KEY,
                        user_id TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        data TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(|e| CoreError::Fatal(format!("failed to initialize schema: {e}")))
    }

    async fn insert_message(&self, message: &Message) -> CoreResult<()> {
        let data = to_json(message)?;
        let (id, to_agent, status, priority, created_at, conversation_id, expires_at) = (
            message.id.clone(),
            message.to_agent.clone(),
            message.status.as_str().to_string(),
            message.priority as i64,
            message.created_at.to_rfc3339(),
            message.conversation_id.clone(),
            message.expires_at.map(|e| e.to_rfc3339()),
        );
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, to_agent, status, priority, created_at, conversation_id, expires_at, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![id, to_agent, status, priority, created_at, conversation_id, expires_at, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> CoreResult<Option<Message>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM messages WHERE id = ?1", params![id], |r| r.get(0))
                    .optional()?)
            })
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn apply_message_transition(
        &self,
        id: &str,
        expected_from: &[MessageStatus],
        transition: MessageTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let Some(mut message) = self.get_message(id).await? else { return Ok(false) };
        if !expected_from.contains(&message.status) {
            return Ok(false);
        }
        match transition {
            MessageTransition::Deliver => {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(now);
            }
            MessageTransition::Acknowledge => {
                message.status = MessageStatus::Acknowledged;
                message.acknowledged_at = Some(now);
            }
            MessageTransition::MarkRead => {
                message.status = MessageStatus::Read;
                message.read_at = Some(now);
            }
            MessageTransition::Fail { error_message } => {
                message.status = MessageStatus::Failed;
                message.error_message = Some(error_message);
            }
            MessageTransition::Requeue => {
                message.status = MessageStatus::Pending;
                message.retry_count += 1;
            }
        }
        let data = to_json(&message)?;
        let (id, status) = (message.id.clone(), message.status.as_str().to_string());
        let updated: usize = self
            .conn
            .call(move |conn| Ok(conn.execute("UPDATE messages SET status = ?2, data = ?3 WHERE id = ?1", params![id, status, data])?))
            .await?;
        Ok(updated > 0)
    }

    async fn query_pending_for(
        &self,
        agent_id: &str,
        limit: usize,
        message_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>> {
        let agent_id = agent_id.to_string();
        let message_type = message_type.map(|s| s.to_string());
        let now = now.to_rfc3339();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM messages
                     WHERE (to_agent = ?1 OR to_agent IS NULL)
                       AND status = 'pending'
                       AND (expires_at IS NULL OR expires_at > ?2)
                     ORDER BY priority ASC, created_at ASC",
                )?;
                let rows = stmt
                    .query_map(params![agent_id, now], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        let mut messages: Vec<Message> = rows.iter().map(|r| from_json(r)).collect::<CoreResult<_>>()?;
        if let Some(t) = message_type {
            messages.retain(|m| m.message_type == t);
        }
        messages.truncate(limit);
        Ok(messages)
    }

    async fn fetch_next_pending(&self, now: DateTime<Utc>) -> CoreResult<Option<Message>> {
        let now = now.to_rfc3339();
        let row: Option<String> = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM messages
                     WHERE status = 'pending' AND (expires_at IS NULL OR expires_at > ?1)
                     ORDER BY priority ASC, created_at ASC LIMIT 1",
                        params![now],
                        |r| r.get(0),
                    )
                    .optional()?)
            })
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn list_conversation_messages(&self, conversation_id: &str, limit: usize) -> CoreResult<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM messages WHERE conversation_id = ?1
                     ORDER BY priority ASC, created_at ASC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![conversation_id, limit as i64], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|r| from_json(r)).collect()
    }

    async fn set_message_conversation(&self, message_id: &str, conversation_id: &str) -> CoreResult<bool> {
        let Some(mut message) = self.get_message(message_id).await? else { return Ok(false) };
        message.conversation_id = Some(conversation_id.to_string());
        let data = to_json(&message)?;
        let (id, conversation_id) = (message.id.clone(), conversation_id.to_string());
        let updated: usize = self
            .conn
            .call(move |conn| Ok(conn.execute("UPDATE messages SET conversation_id = ?2, data = ?3 WHERE id = ?1", params![id, conversation_id, data])?))
            .await?;
        Ok(updated > 0)
    }

    async fn sweep_expired_messages(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let now_s = now.to_rfc3339();
        let ids: Vec<String> = self
            .conn
            .call({
                let now_s = now_s.clone();
                move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id FROM messages WHERE expires_at IS NOT NULL AND expires_at <= ?1
                         AND status NOT IN ('expired', 'acknowledged')",
                    )?;
                    let rows = stmt.query_map(params![now_s], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                }
            })
            .await?;
        for id in &ids {
            if let Some(mut m) = self.get_message(id).await? {
                m.status = MessageStatus::Expired;
                let data = to_json(&m)?;
                let id = id.clone();
                self.conn
                    .call(move |conn| Ok(conn.execute("UPDATE messages SET status = 'expired', data = ?2 WHERE id = ?1", params![id, data])?))
                    .await?;
            }
        }
        Ok(ids.len() as u64)
    }

    async fn message_stats(&self) -> CoreResult<MessageStatsRow> {
        let (total, delivered, failed, pending, conversation_rows) = self
            .conn
            .call(|conn| {
                let total: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
                let delivered: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE status IN ('delivered', 'acknowledged', 'read')",
                    [],
                    |r| r.get(0),
                )?;
                let failed: i64 = conn.query_row("SELECT COUNT(*) FROM messages WHERE status = 'failed'", [], |r| r.get(0))?;
                let pending: i64 = conn.query_row("SELECT COUNT(*) FROM messages WHERE status = 'pending'", [], |r| r.get(0))?;
                let mut stmt = conn.prepare("SELECT data FROM conversations")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
                Ok((total, delivered, failed, pending, rows))
            })
            .await
            .map_err(CoreError::from)?;
        let active_conversations = conversation_rows
            .iter()
            .map(|r| from_json::<Conversation>(r))
            .collect::<CoreResult<Vec<_>>>()?
            .iter()
            .filter(|c| c.status == ConversationStatus::Active)
            .count();
        Ok(MessageStatsRow {
            total: total as u64,
            delivered: delivered as u64,
            failed: failed as u64,
            pending: pending as u64,
            active_conversations: active_conversations as u64,
        })
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> CoreResult<()> {
        let (id, data) = (conversation.id.clone(), to_json(conversation)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO conversations (id, data) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                    params![id, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM conversations WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn touch_conversation(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let Some(mut conv) = self.get_conversation(id).await? else { return Ok(false) };
        conv.message_count += 1;
        conv.last_activity = now;
        self.upsert_conversation(&conv).await?;
        Ok(true)
    }

    async fn upsert_template(&self, template: &MessageTemplate) -> CoreResult<()> {
        let (name, data) = (template.name.clone(), to_json(template)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO templates (name, data) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET data = excluded.data",
                    params![name, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_template(&self, name: &str) -> CoreResult<Option<MessageTemplate>> {
        let name = name.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM templates WHERE name = ?1", params![name], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn list_templates(&self) -> CoreResult<Vec<MessageTemplate>> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM templates")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|r| from_json(r)).collect()
    }

    async fn upsert_agent(&self, agent: &Agent) -> CoreResult<()> {
        let (id, data) = (agent.id.clone(), to_json(agent)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO agents (id, data) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                    params![id, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> CoreResult<Option<Agent>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM agents WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn list_active_agents(&self) -> CoreResult<Vec<Agent>> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM agents")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        let agents: Vec<Agent> = rows.iter().map(|r| from_json(r)).collect::<CoreResult<_>>()?;
        Ok(agents.into_iter().filter(|a| a.is_active).collect())
    }

    async fn upsert_source(&self, source: &RegulatorySource) -> CoreResult<()> {
        let (id, data) = (source.id.clone(), to_json(source)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO sources (id, data) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                    params![id, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> CoreResult<Option<RegulatorySource>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM sources WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn remove_source(&self, id: &str) -> CoreResult<bool> {
        let id = id.to_string();
        let n: usize = self.conn.call(move |conn| Ok(conn.execute("DELETE FROM sources WHERE id = ?1", params![id])?)).await?;
        Ok(n > 0)
    }

    async fn list_sources(&self) -> CoreResult<Vec<RegulatorySource>> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT data FROM sources")?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|r| from_json(r)).collect()
    }

    async fn insert_item_if_absent(&self, item: &RegulatoryItem) -> CoreResult<bool> {
        let (id, detected_at, data) = (item.id.clone(), item.detected_at.to_rfc3339(), to_json(item)?);
        let inserted: usize = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT OR IGNORE INTO regulatory_items (id, detected_at, data) VALUES (?1, ?2, ?3)",
                    params![id, detected_at, data],
                )?)
            })
            .await?;
        Ok(inserted > 0)
    }

    async fn list_recent_items(&self, limit: usize) -> CoreResult<Vec<RegulatoryItem>> {
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM regulatory_items ORDER BY detected_at DESC LIMIT ?1")?;
                let rows = stmt.query_map(params![limit as i64], |r| r.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|r| from_json(r)).collect()
    }

    async fn upsert_consensus_config(&self, id: &str, config: &ConsensusConfiguration) -> CoreResult<()> {
        let (id, data) = (id.to_string(), to_json(config)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO consensus_configs (id, data) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                    params![id, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_consensus_config(&self, id: &str) -> CoreResult<Option<ConsensusConfiguration>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM consensus_configs WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn store_consensus_result(&self, result: &ConsensusResult) -> CoreResult<()> {
        let (id, data) = (result.consensus_id.clone(), to_json(result)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO consensus_results (id, data) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                    params![id, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_consensus_result(&self, id: &str) -> CoreResult<Option<ConsensusResult>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM consensus_results WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn upsert_scenario(&self, scenario: &SimulationScenario) -> CoreResult<()> {
        let (id, created_by, data) = (scenario.id.clone(), scenario.created_by.clone(), to_json(scenario)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO scenarios (id, created_by, data) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET data = excluded.data, created_by = excluded.created_by",
                    params![id, created_by, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_scenario(&self, id: &str) -> CoreResult<Option<SimulationScenario>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM scenarios WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn delete_scenario(&self, id: &str) -> CoreResult<bool> {
        let id = id.to_string();
        let n: usize = self.conn.call(move |conn| Ok(conn.execute("DELETE FROM scenarios WHERE id = ?1", params![id])?)).await?;
        Ok(n > 0)
    }

    async fn list_scenarios(&self, user_id: Option<&str>, limit: usize, offset: usize) -> CoreResult<Vec<SimulationScenario>> {
        let user_id = user_id.map(|s| s.to_string());
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let rows: Vec<String> = match &user_id {
                    Some(uid) => {
                        let mut stmt = conn.prepare(
                            "SELECT data FROM scenarios WHERE created_by = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
                        )?;
                        let mapped = stmt.query_map(params![uid, limit as i64, offset as i64], |r| r.get::<_, String>(0))?
                            .collect::<Result<Vec<_>, _>>()?;
                        mapped
                    }
                    None => {
                        let mut stmt = conn.prepare("SELECT data FROM scenarios ORDER BY id DESC LIMIT ?1 OFFSET ?2")?;
                        let mapped = stmt.query_map(params![limit as i64, offset as i64], |r| r.get::<_, String>(0))?
                            .collect::<Result<Vec<_>, _>>()?;
                        mapped
                    }
                };
                Ok(rows)
            })
            .await?;
        rows.iter().map(|r| from_json(r)).collect()
    }

    async fn insert_execution(&self, execution: &SimulationExecution) -> CoreResult<()> {
        let (id, user_id, created_at, data) =
            (execution.id.clone(), execution.user_id.clone(), execution.created_at.to_rfc3339(), to_json(execution)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO executions (id, user_id, created_at, data) VALUES (?1, ?2, ?3, ?4)",
                    params![id, user_id, created_at, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> CoreResult<Option<SimulationExecution>> {
        let id = id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM executions WHERE id = ?1", params![id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn update_execution(&self, execution: &SimulationExecution) -> CoreResult<()> {
        let (id, data) = (execution.id.clone(), to_json(execution)?);
        self.conn.call(move |conn| Ok(conn.execute("UPDATE executions SET data = ?2 WHERE id = ?1", params![id, data])?)).await?;
        Ok(())
    }

    async fn insert_result(&self, result: &SimulationResult) -> CoreResult<()> {
        let (execution_id, user_id, created_at, data) =
            (result.execution_id.clone(), result.user_id.clone(), result.created_at.to_rfc3339(), to_json(result)?);
        self.conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO results (execution_id, user_id, created_at, data) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(execution_id) DO UPDATE SET data = excluded.data",
                    params![execution_id, user_id, created_at, data],
                )?)
            })
            .await?;
        Ok(())
    }

    async fn get_result_by_execution(&self, execution_id: &str) -> CoreResult<Option<SimulationResult>> {
        let execution_id = execution_id.to_string();
        let row: Option<String> = self
            .conn
            .call(move |conn| Ok(conn.query_row("SELECT data FROM results WHERE execution_id = ?1", params![execution_id], |r| r.get(0)).optional()?))
            .await?;
        row.map(|r| from_json(&r)).transpose()
    }

    async fn list_user_history(&self, user_id: &str, limit: usize, offset: usize) -> CoreResult<Vec<SimulationResult>> {
        let user_id = user_id.to_string();
        let rows: Vec<String> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT data FROM results WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(params![user_id, limit as i64, offset as i64], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|r| from_json(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_stats_counts_conversations_by_real_status_not_metadata_substring() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();

        let active = Conversation {
            id: "c1".into(),
            topic: "t".into(),
            participant_agents: vec!["a".into()],
            priority: ConversationPriority::Normal,
            metadata: None,
            status: ConversationStatus::Active,
            last_activity: Utc::now(),
            message_count: 0,
            expires_at: None,
        };
        // Closed, but its metadata blob contains the literal substring
        // `"Active"`, which the old substring-match query miscounted.
        let closed_with_active_looking_metadata = Conversation {
            id: "c2".into(),
            topic: "t".into(),
            participant_agents: vec!["a".into()],
            priority: ConversationPriority::Normal,
            metadata: Some(serde_json::json!({"state": "Active"})),
            status: ConversationStatus::Closed,
            last_activity: Utc::now(),
            message_count: 0,
            expires_at: None,
        };
        store.upsert_conversation(&active).await.unwrap();
        store.upsert_conversation(&closed_with_active_looking_metadata).await.unwrap();

        let stats = store.message_stats().await.unwrap();
        assert_eq!(stats.active_conversations, 1);
    }

    #[tokio::test]
    async fn initializes_schema_idempotently() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn dedups_regulatory_items_by_id() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.initialize().await.unwrap();
        let item = RegulatoryItem {
            id: "sec_abc".into(),
            source: "SEC".into(),
            title: "New Rule".into(),
            description: String::new(),
            content_url: String::new(),
            change_type: "rule".into(),
            severity: Severity::High,
            metadata: serde_json::json!({}),
            detected_at: Utc::now(),
            published_at: Utc::now(),
        };
        assert!(store.insert_item_if_absent(&item).await.unwrap());
        assert!(!store.insert_item_if_absent(&item).await.unwrap());
        assert_eq!(store.list_recent_items(10).await.unwrap().len(), 1);
    }
}
