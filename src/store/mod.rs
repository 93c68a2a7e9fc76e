//! Durable Store (spec.md §2 item A, §5, §6).
//!
//! The store is the single shared, mutable resource across tasks; every
//! cross-task invariant (status transitions, dedup, round boundaries) is
//! enforced here via conditional updates and `INSERT OR IGNORE`-style
//! dedup, never via in-memory locking across components.

pub mod memory;
pub mod sqlite;

use crate::error::CoreResult;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message update that is conditional on the message's *current* status,
/// matching spec.md's "conditional `UPDATE` constrained by current status"
/// policy. Returns whether the row was actually updated.
#[derive(Debug, Clone)]
pub enum MessageTransition {
    /// `pending -> delivered`, sets `delivered_at`.
    Deliver,
    /// `delivered -> acknowledged`, sets `acknowledged_at`. Also valid from
    /// `pending` is rejected by the caller, not here.
    Acknowledge,
    /// sets `read_at` and `status -> read`.
    MarkRead,
    /// `pending -> failed`, bumping `retry_count` and setting `error_message`.
    Fail { error_message: String },
    /// `failed -> pending`, for retry requeue (does not touch `created_at`).
    Requeue,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn initialize(&self) -> CoreResult<()>;

    // -- Messages ---------------------------------------------------
    async fn insert_message(&self, message: &Message) -> CoreResult<()>;
    async fn get_message(&self, id: &str) -> CoreResult<Option<Message>>;
    /// Applies `transition` iff the row's current status is one of
    /// `expected_from`. Returns `true` iff a row was updated.
    async fn apply_message_transition(
        &self,
        id: &str,
        expected_from: &[MessageStatus],
        transition: MessageTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<bool>;
    /// `(to_agent = agent_id OR to_agent IS NULL) AND status = pending AND
    /// (expires_at IS NULL OR expires_at > now)`, ordered `(priority,
    /// created_at)`, optionally filtered by `message_type`.
    async fn query_pending_for(
        &self,
        agent_id: &str,
        limit: usize,
        message_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>>;
    /// Single oldest-highest-priority pending, non-expired message, for the
    /// delivery worker's backlog refresh.
    async fn fetch_next_pending(&self, now: DateTime<Utc>) -> CoreResult<Option<Message>>;
    async fn list_conversation_messages(&self, conversation_id: &str, limit: usize) -> CoreResult<Vec<Message>>;
    /// Backs `AddToConversation`: stamps `conversation_id` onto an
    /// already-persisted message. Returns `false` if the message is absent.
    async fn set_message_conversation(&self, message_id: &str, conversation_id: &str) -> CoreResult<bool>;
    /// `expires_at <= now AND status NOT IN (expired, acknowledged)` ->
    /// `expired`. Returns count updated. Idempotent and safe concurrently.
    async fn sweep_expired_messages(&self, now: DateTime<Utc>) -> CoreResult<u64>;
    async fn message_stats(&self) -> CoreResult<MessageStatsRow>;

    // -- Conversations ------------------------------------------------
    async fn upsert_conversation(&self, conversation: &Conversation) -> CoreResult<()>;
    async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>>;
    /// Increments `message_count` and bumps `last_activity` atomically.
    async fn touch_conversation(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool>;

    // -- Templates ------------------------------------------------------
    async fn upsert_template(&self, template: &MessageTemplate) -> CoreResult<()>;
    async fn get_template(&self, name: &str) -> CoreResult<Option<MessageTemplate>>;
    async fn list_templates(&self) -> CoreResult<Vec<MessageTemplate>>;

    // -- Agents -----------------------------------------------------------
    async fn upsert_agent(&self, agent: &Agent) -> CoreResult<()>;
    async fn get_agent(&self, id: &str) -> CoreResult<Option<Agent>>;
    async fn list_active_agents(&self) -> CoreResult<Vec<Agent>>;

    // -- Regulatory sources / items ---------------------------------------
    async fn upsert_source(&self, source: &RegulatorySource) -> CoreResult<()>;
    async fn get_source(&self, id: &str) -> CoreResult<Option<RegulatorySource>>;
    async fn remove_source(&self, id: &str) -> CoreResult<bool>;
    async fn list_sources(&self) -> CoreResult<Vec<RegulatorySource>>;
    /// Returns `true` if a new row was inserted (not already present — the
    /// dedup/idempotence invariant from spec.md §8).
    async fn insert_item_if_absent(&self, item: &RegulatoryItem) -> CoreResult<bool>;
    async fn list_recent_items(&self, limit: usize) -> CoreResult<Vec<RegulatoryItem>>;

    // -- Consensus audit trail -------------------------------------------
    async fn upsert_consensus_config(&self, id: &str, config: &ConsensusConfiguration) -> CoreResult<()>;
    async fn get_consensus_config(&self, id: &str) -> CoreResult<Option<ConsensusConfiguration>>;
    async fn store_consensus_result(&self, result: &ConsensusResult) -> CoreResult<()>;
    async fn get_consensus_result(&self, id: &str) -> CoreResult<Option<ConsensusResult>>;

    // -- Simulator ----------------------------------------------------------
    async fn upsert_scenario(&self, scenario: &SimulationScenario) -> CoreResult<()>;
    async fn get_scenario(&self, id: &str) -> CoreResult<Option<SimulationScenario>>;
    async fn delete_scenario(&self, id: &str) -> CoreResult<bool>;
    async fn list_scenarios(&self, user_id: Option<&str>, limit: usize, offset: usize) -> CoreResult<Vec<SimulationScenario>>;
    async fn insert_execution(&self, execution: &SimulationExecution) -> CoreResult<()>;
    async fn get_execution(&self, id: &str) -> CoreResult<Option<SimulationExecution>>;
    async fn update_execution(&self, execution: &SimulationExecution) -> CoreResult<()>;
    async fn insert_result(&self, result: &SimulationResult) -> CoreResult<()>;
    async fn get_result_by_execution(&self, execution_id: &str) -> CoreResult<Option<SimulationResult>>;
    async fn list_user_history(&self, user_id: &str, limit: usize, offset: usize) -> CoreResult<Vec<SimulationResult>>;
}

#[derive(Debug, Clone, Default)]
pub struct MessageStatsRow {
    pub total: u64,
    pub delivered: u64,
    pub failed: u64,
    pub pending: u64,
    pub active_conversations: u64,
}
