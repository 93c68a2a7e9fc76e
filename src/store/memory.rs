//! In-memory `Store` implementation: fast default for the CLI demo and the
//! backing store for unit/integration tests. Enforces the same conditional-
//! update and dedup semantics as [`super::sqlite::SqliteStore`].

use super::{MessageStatsRow, MessageTransition, Store};
use crate::error::CoreResult;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryStore {
    messages: DashMap<String, Message>,
    conversations: DashMap<String, Conversation>,
    templates: DashMap<String, MessageTemplate>,
    agents: DashMap<String, Agent>,
    sources: DashMap<String, RegulatorySource>,
    items: DashMap<String, RegulatoryItem>,
    consensus_configs: DashMap<String, ConsensusConfiguration>,
    consensus_results: DashMap<String, ConsensusResult>,
    scenarios: DashMap<String, SimulationScenario>,
    executions: DashMap<String, SimulationExecution>,
    results_by_execution: DashMap<String, SimulationResult>,
    // Guards compound read-modify-write sequences (conversation touch,
    // message transitions) the way a single-writer SQLite connection would.
    write_lock: Mutex<()>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn initialize(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> CoreResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> CoreResult<Option<Message>> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn apply_message_transition(
        &self,
        id: &str,
        expected_from: &[MessageStatus],
        transition: MessageTransition,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut entry) = self.messages.get_mut(id) else { return Ok(false) };
        if !expected_from.contains(&entry.status) {
            return Ok(false);
        }
        match transition {
            MessageTransition::Deliver => {
                entry.status = MessageStatus::Delivered;
                entry.delivered_at = Some(now);
            }
            MessageTransition::Acknowledge => {
                entry.status = MessageStatus::Acknowledged;
                entry.acknowledged_at = Some(now);
            }
            MessageTransition::MarkRead => {
                entry.status = MessageStatus::Read;
                entry.read_at = Some(now);
            }
            MessageTransition::Fail { error_message } => {
                entry.status = MessageStatus::Failed;
                entry.error_message = Some(error_message);
            }
            MessageTransition::Requeue => {
                entry.status = MessageStatus::Pending;
                entry.retry_count += 1;
            }
        }
        Ok(true)
    }

    async fn query_pending_for(
        &self,
        agent_id: &str,
        limit: usize,
        message_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>> {
        let mut matches: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| {
                let addressed = m.to_agent.as_deref() == Some(agent_id) || m.to_agent.is_none();
                let pending = m.status == MessageStatus::Pending;
                let not_expired = m.expires_at.map(|e| e > now).unwrap_or(true);
                let type_ok = message_type.map(|t| m.message_type == t).unwrap_or(true);
                addressed && pending && not_expired && type_ok
            })
            .map(|m| m.clone())
            .collect();
        matches.sort_by_key(|m| (m.priority, m.created_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn fetch_next_pending(&self, now: DateTime<Utc>) -> CoreResult<Option<Message>> {
        let mut candidates: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.status == MessageStatus::Pending && m.expires_at.map(|e| e > now).unwrap_or(true))
            .map(|m| m.clone())
            .collect();
        candidates.sort_by_key(|m| (m.priority, m.created_at));
        Ok(candidates.into_iter().next())
    }

    async fn list_conversation_messages(&self, conversation_id: &str, limit: usize) -> CoreResult<Vec<Message>> {
        let mut matches: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
            .map(|m| m.clone())
            .collect();
        matches.sort_by_key(|m| (m.priority, m.created_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn set_message_conversation(&self, message_id: &str, conversation_id: &str) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut entry) = self.messages.get_mut(message_id) else { return Ok(false) };
        entry.conversation_id = Some(conversation_id.to_string());
        Ok(true)
    }

    async fn sweep_expired_messages(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let mut count = 0u64;
        for mut entry in self.messages.iter_mut() {
            let expired = entry.expires_at.map(|e| e <= now).unwrap_or(false);
            let terminal = matches!(entry.status, MessageStatus::Expired | MessageStatus::Acknowledged);
            if expired && !terminal {
                entry.status = MessageStatus::Expired;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn message_stats(&self) -> CoreResult<MessageStatsRow> {
        let mut row = MessageStatsRow::default();
        row.total = self.messages.len() as u64;
        for m in self.messages.iter() {
            match m.status {
                MessageStatus::Delivered | MessageStatus::Acknowledged | MessageStatus::Read => row.delivered += 1,
                MessageStatus::Failed => row.failed += 1,
                MessageStatus::Pending => row.pending += 1,
                MessageStatus::Expired => {}
            }
        }
        row.active_conversations =
            self.conversations.iter().filter(|c| c.status == ConversationStatus::Active).count() as u64;
        Ok(row)
    }

    async fn upsert_conversation(&self, conversation: &Conversation) -> CoreResult<()> {
        self.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>> {
        Ok(self.conversations.get(id).map(|c| c.clone()))
    }

    async fn touch_conversation(&self, id: &str, now: DateTime<Utc>) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut entry) = self.conversations.get_mut(id) else { return Ok(false) };
        entry.message_count += 1;
        entry.last_activity = now;
        Ok(true)
    }

    async fn upsert_template(&self, template: &MessageTemplate) -> CoreResult<()> {
        self.templates.insert(template.name.clone(), template.clone());
        Ok(())
    }

    async fn get_template(&self, name: &str) -> CoreResult<Option<MessageTemplate>> {
        Ok(self.templates.get(name).map(|t| t.clone()))
    }

    async fn list_templates(&self) -> CoreResult<Vec<MessageTemplate>> {
        Ok(self.templates.iter().map(|t| t.clone()).collect())
    }

    async fn upsert_agent(&self, agent: &Agent) -> CoreResult<()> {
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> CoreResult<Option<Agent>> {
        Ok(self.agents.get(id).map(|a| a.clone()))
    }

    async fn list_active_agents(&self) -> CoreResult<Vec<Agent>> {
        Ok(self.agents.iter().filter(|a| a.is_active).map(|a| a.clone()).collect())
    }

    async fn upsert_source(&self, source: &RegulatorySource) -> CoreResult<()> {
        self.sources.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_source(&self, id: &str) -> CoreResult<Option<RegulatorySource>> {
        Ok(self.sources.get(id).map(|s| s.clone()))
    }

    async fn remove_source(&self, id: &str) -> CoreResult<bool> {
        Ok(self.sources.remove(id).is_some())
    }

    async fn list_sources(&self) -> CoreResult<Vec<RegulatorySource>> {
        Ok(self.sources.iter().map(|s| s.clone()).collect())
    }

    async fn insert_item_if_absent(&self, item: &RegulatoryItem) -> CoreResult<bool> {
        let _guard = self.write_lock.lock().unwrap();
        if self.items.contains_key(&item.id) {
            return Ok(false);
        }
        self.items.insert(item.id.clone(), item.clone());
        Ok(true)
    }

    async fn list_recent_items(&self, limit: usize) -> CoreResult<Vec<RegulatoryItem>> {
        let mut items: Vec<RegulatoryItem> = self.items.iter().map(|i| i.clone()).collect();
        items.sort_by_key(|i| std::cmp::Reverse(i.detected_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn upsert_consensus_config(&self, id: &str, config: &ConsensusConfiguration) -> CoreResult<()> {
        self.consensus_configs.insert(id.to_string(), config.clone());
        Ok(())
    }

    async fn get_consensus_config(&self, id: &str) -> CoreResult<Option<ConsensusConfiguration>> {
        Ok(self.consensus_configs.get(id).map(|c| c.clone()))
    }

    async fn store_consensus_result(&self, result: &ConsensusResult) -> CoreResult<()> {
        self.consensus_results.insert(result.consensus_id.clone(), result.clone());
        Ok(())
    }

    async fn get_consensus_result(&self, id: &str) -> CoreResult<Option<ConsensusResult>> {
        Ok(self.consensus_results.get(id).map(|r| r.clone()))
    }

    async fn upsert_scenario(&self, scenario: &SimulationScenario) -> CoreResult<()> {
        self.scenarios.insert(scenario.id.clone(), scenario.clone());
        Ok(())
    }

    async fn get_scenario(&self, id: &str) -> CoreResult<Option<SimulationScenario>> {
        Ok(self.scenarios.get(id).map(|s| s.clone()))
    }

    async fn delete_scenario(&self, id: &str) -> CoreResult<bool> {
        Ok(self.scenarios.remove(id).is_some())
    }

    async fn list_scenarios(&self, user_id: Option<&str>, limit: usize, offset: usize) -> CoreResult<Vec<SimulationScenario>> {
        let mut scenarios: Vec<SimulationScenario> = self
            .scenarios
            .iter()
            .filter(|s| user_id.map(|u| s.created_by == u).unwrap_or(true))
            .map(|s| s.clone())
            .collect();
        scenarios.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(scenarios.into_iter().skip(offset).take(limit).collect())
    }

    async fn insert_execution(&self, execution: &SimulationExecution) -> CoreResult<()> {
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> CoreResult<Option<SimulationExecution>> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn update_execution(&self, execution: &SimulationExecution) -> CoreResult<()> {
        self.executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn insert_result(&self, result: &SimulationResult) -> CoreResult<()> {
        self.results_by_execution.insert(result.execution_id.clone(), result.clone());
        Ok(())
    }

    async fn get_result_by_execution(&self, execution_id: &str) -> CoreResult<Option<SimulationResult>> {
        Ok(self.results_by_execution.get(execution_id).map(|r| r.clone()))
    }

    async fn list_user_history(&self, user_id: &str, limit: usize, offset: usize) -> CoreResult<Vec<SimulationResult>> {
        let mut results: Vec<SimulationResult> = self
            .results_by_execution
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        results.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }
}
