//! Inter-Agent Messenger (spec.md §4.2).

pub mod registry;

use crate::clock::Clock;
use crate::config::MessengerConfig;
use crate::error::{CoreError, CoreResult};
use crate::store::{MessageStatsRow, MessageTransition, Store};
use crate::types::*;
use chrono::{DateTime, Utc};
use registry::MessageTypeRegistry;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessengerStats {
    pub total: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    pub active_conversations: u64,
}

impl From<MessageStatsRow> for MessengerStats {
    fn from(row: MessageStatsRow) -> Self {
        Self { total: row.total, delivered: row.delivered, failed: row.failed, pending: row.pending, active_conversations: row.active_conversations }
    }
}

struct WorkerTunables {
    max_retries: AtomicU32,
    retry_delay_seconds: AtomicU64,
    batch_size: AtomicUsize,
}

pub struct Messenger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    registry: MessageTypeRegistry,
    tunables: WorkerTunables,
    queue_refresh_interval_seconds: u64,
    work_tx: mpsc::UnboundedSender<String>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Messenger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: MessengerConfig) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            clock,
            registry: MessageTypeRegistry::default(),
            tunables: WorkerTunables {
                max_retries: AtomicU32::new(config.max_retries),
                retry_delay_seconds: AtomicU64::new(config.retry_delay_seconds),
                batch_size: AtomicUsize::new(config.batch_size),
            },
            queue_refresh_interval_seconds: config.queue_refresh_interval_seconds,
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            worker: Mutex::new(None),
        })
    }

    fn validate_send(&self, from: &str, message_type: &str, priority: u8, content: &Value) -> CoreResult<()> {
        if from.is_empty() {
            return Err(CoreError::validation("from_agent must be non-empty"));
        }
        if !(1..=5).contains(&priority) {
            return Err(CoreError::validation("priority must be in 1..=5"));
        }
        self.registry.validate_content(message_type, content).map_err(CoreError::validation)?;
        Ok(())
    }

    #[instrument(skip(self, content))]
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        from: &str,
        to: Option<&str>,
        message_type: &str,
        content: Value,
        priority: u8,
        correlation_id: Option<String>,
        conversation_id: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        if let Some(to) = to {
            if to.is_empty() {
                return Err(CoreError::validation("to_agent must be non-empty when present"));
            }
        }
        self.validate_send(from, message_type, priority, &content)?;

        let now = self.clock.now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            from_agent: from.to_string(),
            to_agent: to.map(|s| s.to_string()),
            message_type: message_type.to_string(),
            content,
            priority,
            status: MessageStatus::Pending,
            created_at: now,
            delivered_at: None,
            acknowledged_at: None,
            read_at: None,
            retry_count: 0,
            max_retries: self.tunables.max_retries.load(Ordering::Relaxed),
            expires_at,
            error_message: None,
            correlation_id,
            parent_message_id: None,
            conversation_id: conversation_id.clone(),
            excluded_agents: Vec::new(),
        };
        self.store.insert_message(&message).await?;
        if let Some(conv_id) = &conversation_id {
            self.store.touch_conversation(conv_id, now).await?;
        }
        Ok(message.id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_async(
        &self,
        from: &str,
        to: Option<&str>,
        message_type: &str,
        content: Value,
        priority: u8,
        correlation_id: Option<String>,
        conversation_id: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        let id = self.send(from, to, message_type, content, priority, correlation_id, conversation_id, expires_at).await?;
        let _ = self.work_tx.send(id.clone());
        Ok(id)
    }

    pub async fn broadcast(
        &self,
        from: &str,
        message_type: &str,
        content: Value,
        priority: u8,
        excluded_agents: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        self.validate_send(from, message_type, priority, &content)?;
        let now = self.clock.now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            from_agent: from.to_string(),
            to_agent: None,
            message_type: message_type.to_string(),
            content,
            priority,
            status: MessageStatus::Pending,
            created_at: now,
            delivered_at: None,
            acknowledged_at: None,
            read_at: None,
            retry_count: 0,
            max_retries: self.tunables.max_retries.load(Ordering::Relaxed),
            expires_at,
            error_message: None,
            correlation_id: None,
            parent_message_id: None,
            conversation_id: None,
            excluded_agents,
        };
        self.store.insert_message(&message).await?;
        Ok(message.id)
    }

    /// Returns up to `limit` pending messages addressed to `agent_id`
    /// (unicast or broadcast, minus exclusions), transitioning each to
    /// `delivered`.
    pub async fn receive(&self, agent_id: &str, limit: usize, message_type: Option<&str>) -> CoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let candidates = self.store.query_pending_for(agent_id, limit * 2, message_type, now).await?;
        let mut delivered = Vec::with_capacity(limit);
        for mut message in candidates {
            if delivered.len() == limit {
                break;
            }
            if message.excluded_agents.iter().any(|a| a == agent_id) {
                continue;
            }
            if self.store.apply_message_transition(&message.id, &[MessageStatus::Pending], MessageTransition::Deliver, now).await? {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(now);
                delivered.push(message);
            }
        }
        Ok(delivered)
    }

    pub async fn pending_for(&self, agent_id: &str, limit: usize) -> CoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let candidates = self.store.query_pending_for(agent_id, limit * 2, None, now).await?;
        Ok(candidates
            .into_iter()
            .filter(|m| !m.excluded_agents.iter().any(|a| a == agent_id))
            .take(limit)
            .collect())
    }

    pub async fn acknowledge(&self, message_id: &str, agent_id: &str) -> CoreResult<()> {
        let Some(message) = self.store.get_message(message_id).await? else {
            return Err(CoreError::not_found("message", message_id));
        };
        let addressed = message.to_agent.as_deref() == Some(agent_id) || message.to_agent.is_none();
        if message.status != MessageStatus::Delivered || !addressed {
            return Err(CoreError::conflict("message is not in a deliverable-acknowledge state for this agent"));
        }
        let now = self.clock.now();
        let updated = self.store.apply_message_transition(message_id, &[MessageStatus::Delivered], MessageTransition::Acknowledge, now).await?;
        if !updated {
            return Err(CoreError::conflict("message status changed concurrently"));
        }
        Ok(())
    }

    pub async fn mark_read(&self, message_id: &str, agent_id: &str) -> CoreResult<()> {
        let Some(message) = self.store.get_message(message_id).await? else {
            return Err(CoreError::not_found("message", message_id));
        };
        if message.to_agent.as_deref() != Some(agent_id) || message.read_at.is_some() {
            return Err(CoreError::conflict("message is not readable by this agent"));
        }
        let now = self.clock.now();
        let updated = self.store.apply_message_transition(message_id, &[message.status], MessageTransition::MarkRead, now).await?;
        if !updated {
            return Err(CoreError::conflict("message status changed concurrently"));
        }
        Ok(())
    }

    pub async fn start_conversation(
        &self,
        topic: &str,
        participants: Vec<String>,
        priority: ConversationPriority,
        metadata: Option<Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        if topic.is_empty() || participants.is_empty() {
            return Err(CoreError::validation("conversation requires a topic and at least one participant"));
        }
        let now = self.clock.now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            participant_agents: participants,
            priority,
            metadata,
            status: ConversationStatus::Active,
            last_activity: now,
            message_count: 0,
            expires_at,
        };
        self.store.upsert_conversation(&conversation).await?;
        Ok(conversation.id)
    }

    pub async fn add_to_conversation(&self, message_id: &str, conversation_id: &str) -> CoreResult<()> {
        if self.store.get_conversation(conversation_id).await?.is_none() {
            return Err(CoreError::not_found("conversation", conversation_id));
        }
        if !self.store.set_message_conversation(message_id, conversation_id).await? {
            return Err(CoreError::not_found("message", message_id));
        }
        let now = self.clock.now();
        self.store.touch_conversation(conversation_id, now).await?;
        Ok(())
    }

    pub async fn get_conversation_messages(&self, conversation_id: &str, limit: usize) -> CoreResult<Vec<Message>> {
        self.store.list_conversation_messages(conversation_id, limit).await
    }

    pub async fn save_template(&self, name: &str, message_type: &str, content: Value, description: &str, created_by: Option<String>) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::validation("template name must be non-empty"));
        }
        let template = MessageTemplate {
            name: name.to_string(),
            message_type: message_type.to_string(),
            template_content: content,
            description: description.to_string(),
            is_active: true,
            created_by,
        };
        self.store.upsert_template(&template).await
    }

    pub async fn get_template(&self, name: &str) -> CoreResult<Option<MessageTemplate>> {
        self.store.get_template(name).await
    }

    pub async fn list_templates(&self) -> CoreResult<Vec<MessageTemplate>> {
        self.store.list_templates().await
    }

    pub fn validate_message_type(&self, message_type: &str) -> bool {
        self.registry.validate_message_type(message_type)
    }

    pub fn get_type_schema(&self, message_type: &str) -> Option<Vec<String>> {
        self.registry.get_type_schema(message_type)
    }

    pub fn list_supported_types(&self) -> Vec<String> {
        self.registry.list_supported_types()
    }

    pub async fn stats(&self) -> CoreResult<MessengerStats> {
        Ok(self.store.message_stats().await?.into())
    }

    pub async fn cleanup_expired(&self) -> CoreResult<u64> {
        let now = self.clock.now();
        self.store.sweep_expired_messages(now).await
    }

    pub fn set_max_retries(&self, value: u32) {
        self.tunables.max_retries.store(value, Ordering::Relaxed);
    }

    pub fn set_retry_delay(&self, seconds: u64) {
        self.tunables.retry_delay_seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn set_batch_size(&self, size: usize) {
        self.tunables.batch_size.store(size, Ordering::Relaxed);
    }

    async fn deliver_one(&self, message_id: &str) {
        let now = self.clock.now();
        match self.store.apply_message_transition(message_id, &[MessageStatus::Pending], MessageTransition::Deliver, now).await {
            Ok(true) => info!(message_id, "message delivered"),
            Ok(false) => {}
            Err(e) => {
                warn!(message_id, error = %e, "delivery attempt failed");
                self.handle_delivery_failure(message_id, &e.to_string(), now).await;
            }
        }
    }

    async fn handle_delivery_failure(&self, message_id: &str, error_message: &str, now: DateTime<Utc>) {
        let Ok(Some(message)) = self.store.get_message(message_id).await else { return };
        let max_retries = self.tunables.max_retries.load(Ordering::Relaxed);
        if message.retry_count + 1 < max_retries {
            if let Ok(true) = self
                .store
                .apply_message_transition(message_id, &[MessageStatus::Pending], MessageTransition::Requeue, now)
                .await
            {
                let _ = self.work_tx.send(message_id.to_string());
            }
        } else {
            let _ = self
                .store
                .apply_message_transition(
                    message_id,
                    &[MessageStatus::Pending],
                    MessageTransition::Fail { error_message: error_message.to_string() },
                    now,
                )
                .await;
        }
    }

    pub async fn start_worker(self: &Arc<Self>) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return;
        }
        let Some(mut rx) = self.work_rx.lock().await.take() else { return };
        let token = CancellationToken::new();
        let messenger = Arc::clone(self);
        let worker_token = token.clone();
        let refresh_interval = std::time::Duration::from_secs(messenger.queue_refresh_interval_seconds);
        let handle = tokio::spawn(async move {
            info!("messenger delivery worker starting");
            loop {
                tokio::select! {
                    biased;
                    _ = worker_token.cancelled() => break,
                    maybe_id = rx.recv() => {
                        match maybe_id {
                            Some(id) => messenger.deliver_one(&id).await,
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(refresh_interval) => {
                        let now = messenger.clock.now();
                        if let Ok(Some(next)) = messenger.store.fetch_next_pending(now).await {
                            messenger.deliver_one(&next.id).await;
                        }
                    }
                }
            }
            info!("messenger delivery worker stopped");
        });
        *guard = Some((token, handle));
    }

    pub async fn stop_worker(&self) {
        let mut guard = self.worker.lock().await;
        if let Some((token, handle)) = guard.take() {
            token.cancel();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::memory::InMemoryStore;

    fn messenger() -> Arc<Messenger> {
        let store = Arc::new(InMemoryStore::new());
        let clock = TestClock::new(Utc::now());
        Messenger::new(
            store,
            clock,
            MessengerConfig { max_retries: 3, retry_delay_seconds: 30, batch_size: 50, queue_refresh_interval_seconds: 5 },
        )
    }

    #[tokio::test]
    async fn unicast_happy_path() {
        let messenger = messenger();
        let id = messenger
            .send("a", Some("b"), "TASK_ASSIGNMENT", serde_json::json!({"task_description": "x", "priority": 3}), 3, None, None, None)
            .await
            .unwrap();

        let received = messenger.receive("b", 10, None).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, id);
        assert_eq!(received[0].status, MessageStatus::Delivered);

        messenger.acknowledge(&id, "b").await.unwrap();
        let received_again = messenger.receive("b", 10, None).await.unwrap();
        assert!(received_again.is_empty());
    }

    #[tokio::test]
    async fn broadcast_excludes_listed_agents() {
        let messenger = messenger();
        let id = messenger.broadcast("a", "ANNOUNCE", serde_json::json!({"text": "hi"}), 3, vec!["c".to_string()], None).await.unwrap();

        let b_inbox = messenger.receive("b", 10, None).await.unwrap();
        assert!(b_inbox.iter().any(|m| m.id == id));

        let c_inbox = messenger.receive("c", 10, None).await.unwrap();
        assert!(c_inbox.iter().all(|m| m.id != id));
    }

    #[tokio::test]
    async fn receive_limit_zero_has_no_side_effects() {
        let messenger = messenger();
        messenger.send("a", Some("b"), "ANNOUNCE", serde_json::json!({}), 3, None, None, None).await.unwrap();
        let received = messenger.receive("b", 0, None).await.unwrap();
        assert!(received.is_empty());
        let pending = messenger.pending_for("b", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn rejects_out_of_range_priority() {
        let messenger = messenger();
        let err = messenger.send("a", Some("b"), "ANNOUNCE", serde_json::json!({}), 0, None, None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let err = messenger.send("a", Some("b"), "ANNOUNCE", serde_json::json!({}), 6, None, None, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn expired_messages_sweep_to_expired() {
        let messenger = messenger();
        let past = Utc::now() - chrono::Duration::seconds(1);
        let id = messenger.send("a", Some("b"), "ANNOUNCE", serde_json::json!({}), 3, None, None, Some(past)).await.unwrap();
        let swept = messenger.cleanup_expired().await.unwrap();
        assert_eq!(swept, 1);
        let message = messenger.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Expired);
    }

    #[tokio::test]
    async fn conversation_add_bumps_activity_and_count() {
        let messenger = messenger();
        let conv_id = messenger
            .start_conversation("compliance review", vec!["a".to_string(), "b".to_string()], ConversationPriority::Normal, None, None)
            .await
            .unwrap();
        let msg_id = messenger.send("a", Some("b"), "ANNOUNCE", serde_json::json!({}), 3, None, None, None).await.unwrap();
        messenger.add_to_conversation(&msg_id, &conv_id).await.unwrap();

        let messages = messenger.get_conversation_messages(&conv_id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        let conversation = messenger.store.get_conversation(&conv_id).await.unwrap().unwrap();
        assert_eq!(conversation.message_count, 1);
    }
}
