//! Consensus Engine (spec.md §4.3).

pub mod algorithms;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::types::*;
use algorithms::Tally;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

struct ActiveProcess {
    config: ConsensusConfiguration,
    rounds: Vec<VotingRound>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsensusStats {
    pub total_processes: u64,
    pub reached_consensus: u64,
    pub deadlocks: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentPerformance {
    pub agent_id: Id,
    pub decisions_submitted: u64,
    pub decisions_matching_consensus: u64,
}

impl AgentPerformance {
    pub fn accuracy(&self) -> f64 {
        if self.decisions_submitted == 0 {
            0.0
        } else {
            self.decisions_matching_consensus as f64 / self.decisions_submitted as f64
        }
    }
}

#[derive(Default)]
struct DefaultTunables {
    max_rounds: std::sync::atomic::AtomicU32,
    consensus_threshold_bits: AtomicU64,
}

impl DefaultTunables {
    fn new() -> Self {
        Self { max_rounds: std::sync::atomic::AtomicU32::new(3), consensus_threshold_bits: AtomicU64::new(0.5f64.to_bits()) }
    }

    fn threshold(&self) -> f64 {
        f64::from_bits(self.consensus_threshold_bits.load(Ordering::Relaxed))
    }
}

pub struct ConsensusEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    active: DashMap<String, Mutex<ActiveProcess>>,
    defaults: DefaultTunables,
    performance: DashMap<String, AgentPerformance>,
    stats: ConsensusCounters,
}

#[derive(Default)]
struct ConsensusCounters {
    total_processes: AtomicU64,
    reached_consensus: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
}

impl ConsensusEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            active: DashMap::new(),
            defaults: DefaultTunables::new(),
            performance: DashMap::new(),
            stats: ConsensusCounters::default(),
        })
    }

    pub fn set_defaults(&self, max_rounds: u32, consensus_threshold: f64) {
        self.defaults.max_rounds.store(max_rounds, Ordering::Relaxed);
        self.defaults.consensus_threshold_bits.store(consensus_threshold.to_bits(), Ordering::Relaxed);
    }

    /// Tuning hook for known scenario archetypes (SPEC_FULL.md §3,
    /// grounded on `consensus_engine.hpp`'s `optimize_for_scenario`).
    pub fn optimize_for_scenario(&self, scenario_type: &str) {
        match scenario_type {
            "regulatory_emergency" => self.set_defaults(2, 0.4),
            "routine_compliance_review" => self.set_defaults(5, 0.6),
            _ => {}
        }
    }

    pub fn default_config(&self, topic: String, participants: Vec<String>, algorithm: VotingAlgorithm) -> ConsensusConfiguration {
        ConsensusConfiguration {
            topic,
            algorithm,
            participants,
            max_rounds: self.defaults.max_rounds.load(Ordering::Relaxed),
            timeout_per_round_secs: 300,
            consensus_threshold: self.defaults.threshold(),
            min_participants: 2,
            allow_discussion: true,
            require_justification: false,
            custom_rules: HashMap::new(),
        }
    }

    #[instrument(skip(self, cfg))]
    pub async fn initiate(&self, cfg: ConsensusConfiguration) -> CoreResult<String> {
        if cfg.topic.is_empty() {
            return Err(CoreError::validation("topic must be non-empty"));
        }
        if cfg.participants.is_empty() {
            return Err(CoreError::validation("participants must be non-empty"));
        }
        if !(0.0..=1.0).contains(&cfg.consensus_threshold) {
            return Err(CoreError::validation("consensus_threshold must be in [0,1]"));
        }
        if cfg.max_rounds < 1 {
            return Err(CoreError::validation("max_rounds must be >= 1"));
        }

        let id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        self.store.upsert_consensus_config(&id, &cfg).await?;
        let round = VotingRound {
            round_number: 1,
            topic: cfg.topic.clone(),
            description: String::new(),
            opinions: Vec::new(),
            vote_counts: HashMap::new(),
            state: ConsensusState::CollectingOpinions,
            started_at: now,
            ended_at: None,
        };
        self.active.insert(id.clone(), Mutex::new(ActiveProcess { config: cfg, rounds: vec![round], started_at: now }));
        self.stats.total_processes.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn with_process<F, R>(&self, id: &str, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut ActiveProcess) -> CoreResult<R>,
    {
        let Some(entry) = self.active.get(id) else { return Err(CoreError::not_found("consensus process", id)) };
        let mut process = entry.lock().await;
        f(&mut process)
    }

    pub async fn submit_opinion(&self, id: &str, opinion: AgentOpinion) -> CoreResult<()> {
        self.with_process(id, |process| {
            if !process.config.participants.contains(&opinion.agent_id) {
                return Err(CoreError::validation("agent is not a participant in this consensus process"));
            }
            if !(0.0..=1.0).contains(&opinion.confidence_score) {
                return Err(CoreError::validation("confidence_score must be in [0,1]"));
            }
            if opinion.decision.is_empty() {
                return Err(CoreError::validation("decision must be non-empty"));
            }
            let round = process.rounds.last_mut().expect("a process always has at least one round");
            if round.ended_at.is_some() {
                return Err(CoreError::conflict("current round is already closed"));
            }
            if let Some(existing) = round.opinions.iter_mut().find(|o| o.agent_id == opinion.agent_id) {
                *existing = opinion;
            } else {
                round.opinions.push(opinion);
            }
            Ok(())
        })
        .await
    }

    pub async fn update_opinion(&self, id: &str, agent_id: &str, mut opinion: AgentOpinion) -> CoreResult<()> {
        let now = self.clock.now();
        self.with_process(id, move |process| {
            let round = process.rounds.last_mut().expect("a process always has at least one round");
            let Some(existing) = round.opinions.iter_mut().find(|o| o.agent_id == agent_id) else {
                return Err(CoreError::not_found("opinion", agent_id));
            };
            opinion.agent_id = agent_id.to_string();
            opinion.submitted_at = now;
            *existing = opinion;
            Ok(())
        })
        .await
    }

    pub async fn start_voting_round(&self, id: &str) -> CoreResult<u32> {
        let now = self.clock.now();
        self.with_process(id, move |process| {
            let max_rounds = process.config.max_rounds;
            let current = process.rounds.last_mut().expect("a process always has at least one round");
            current.state = ConsensusState::Voting;
            current.ended_at = Some(now);
            let next_round_number = current.round_number + 1;
            if next_round_number > max_rounds {
                return Err(CoreError::conflict("max_rounds exceeded"));
            }
            process.rounds.push(VotingRound {
                round_number: next_round_number,
                topic: process.config.topic.clone(),
                description: String::new(),
                opinions: Vec::new(),
                vote_counts: HashMap::new(),
                state: ConsensusState::CollectingOpinions,
                started_at: now,
                ended_at: None,
            });
            Ok(next_round_number)
        })
        .await
    }

    pub async fn end_voting_round(&self, id: &str) -> CoreResult<()> {
        let now = self.clock.now();
        self.with_process(id, move |process| {
            let round = process.rounds.last_mut().expect("a process always has at least one round");
            let mut counts = HashMap::new();
            for opinion in &round.opinions {
                *counts.entry(opinion.decision.clone()).or_insert(0u32) += 1;
            }
            round.vote_counts = counts;
            round.state = ConsensusState::Voting;
            if round.ended_at.is_none() {
                round.ended_at = Some(now);
            }
            Ok(())
        })
        .await
    }

    async fn weights_for(&self, opinions: &[AgentOpinion]) -> HashMap<String, f64> {
        let mut weights = HashMap::new();
        for opinion in opinions {
            if weights.contains_key(&opinion.agent_id) {
                continue;
            }
            let weight = self.store.get_agent(&opinion.agent_id).await.ok().flatten().map(|a| a.voting_weight).unwrap_or(1.0);
            weights.insert(opinion.agent_id.clone(), weight);
        }
        weights
    }

    #[instrument(skip(self))]
    pub async fn calculate_consensus(&self, id: &str) -> CoreResult<ConsensusResult> {
        let Some((_, process_lock)) = self.active.remove(id) else { return Err(CoreError::not_found("consensus process", id)) };
        let process = process_lock.into_inner();
        let now = self.clock.now();
        let round = process.rounds.last().expect("a process always has at least one round").clone();

        let timed_out = (now - round.started_at).num_seconds() > process.config.timeout_per_round_secs;
        let rounds_used = process.rounds.len() as u32;

        let (tally, final_state): (Tally, ConsensusState) = if timed_out {
            (Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("round timeout".to_string()) }, ConsensusState::Timeout)
        } else {
            let weights = self.weights_for(&round.opinions).await;
            let tally = match process.config.algorithm {
                VotingAlgorithm::Unanimous => algorithms::unanimous(&round.opinions),
                VotingAlgorithm::Majority => algorithms::majority(&round.opinions, process.config.consensus_threshold),
                VotingAlgorithm::SuperMajority => algorithms::super_majority(&round.opinions, process.config.consensus_threshold),
                VotingAlgorithm::WeightedMajority => algorithms::weighted_majority(&round.opinions, &weights, process.config.consensus_threshold),
                VotingAlgorithm::RankedChoice => {
                    let all_ranked = !round.opinions.is_empty() && round.opinions.iter().all(|o| !o.ranked_preferences.is_empty());
                    if all_ranked {
                        algorithms::ranked_choice(&round.opinions)
                    } else {
                        algorithms::majority(&round.opinions, process.config.consensus_threshold)
                    }
                }
                VotingAlgorithm::Quorum => algorithms::quorum(&round.opinions, process.config.participants.len(), process.config.consensus_threshold),
                VotingAlgorithm::Consensus => algorithms::consensus_variant(&round.opinions, process.config.consensus_threshold),
                VotingAlgorithm::Plurality => algorithms::plurality(&round.opinions),
            };
            let state = if tally.success { ConsensusState::ReachedConsensus } else { ConsensusState::Deadlock };
            (tally, state)
        };

        let bands = algorithms::bands_for(process.config.algorithm);
        let confidence = algorithms::confidence_for(tally.support, bands, rounds_used);
        let dissenting: Vec<String> = round
            .opinions
            .iter()
            .filter(|o| tally.decision.as_deref() != Some(o.decision.as_str()))
            .map(|o| format!("{}: {}", o.agent_id, o.decision))
            .collect();

        for opinion in &round.opinions {
            let mut entry = self.performance.entry(opinion.agent_id.clone()).or_insert_with(|| AgentPerformance { agent_id: opinion.agent_id.clone(), ..Default::default() });
            entry.decisions_submitted += 1;
            if tally.success && tally.decision.as_deref() == Some(opinion.decision.as_str()) {
                entry.decisions_matching_consensus += 1;
            }
        }

        let result = ConsensusResult {
            consensus_id: id.to_string(),
            topic: process.config.topic.clone(),
            final_decision: tally.decision,
            confidence_level: confidence,
            algorithm_used: process.config.algorithm,
            rounds: process.rounds,
            final_state,
            total_duration_ms: (now - process.started_at).num_milliseconds(),
            total_participants: process.config.participants.len(),
            agreement_percentage: tally.agreement,
            dissenting_opinions: dissenting,
            completed_at: now,
            success: tally.success,
            error_message: tally.error_message,
        };

        self.store.store_consensus_result(&result).await?;
        match final_state {
            ConsensusState::ReachedConsensus => self.stats.reached_consensus.fetch_add(1, Ordering::Relaxed),
            ConsensusState::Deadlock => self.stats.deadlocks.fetch_add(1, Ordering::Relaxed),
            ConsensusState::Timeout => self.stats.timeouts.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        Ok(result)
    }

    pub async fn get_result(&self, id: &str) -> CoreResult<Option<ConsensusResult>> {
        self.store.get_consensus_result(id).await
    }

    pub async fn get_state(&self, id: &str) -> CoreResult<ConsensusState> {
        if let Some(entry) = self.active.get(id) {
            let process = entry.lock().await;
            let round = process.rounds.last().expect("a process always has at least one round");
            let now = self.clock.now();
            let timed_out = (now - round.started_at).num_seconds() > process.config.timeout_per_round_secs;
            return Ok(if timed_out { ConsensusState::Timeout } else { round.state });
        }
        match self.store.get_consensus_result(id).await? {
            Some(result) => Ok(result.final_state),
            None => Err(CoreError::not_found("consensus process", id)),
        }
    }

    pub async fn get_opinions(&self, id: &str, round: Option<u32>) -> CoreResult<Vec<AgentOpinion>> {
        if let Some(entry) = self.active.get(id) {
            let process = entry.lock().await;
            return match round {
                Some(n) => Ok(process.rounds.iter().find(|r| r.round_number == n).map(|r| r.opinions.clone()).unwrap_or_default()),
                None => Ok(process.rounds.last().expect("a process always has at least one round").opinions.clone()),
            };
        }
        let Some(result) = self.store.get_consensus_result(id).await? else { return Err(CoreError::not_found("consensus process", id)) };
        match round {
            Some(n) => Ok(result.rounds.into_iter().find(|r| r.round_number == n).map(|r| r.opinions).unwrap_or_default()),
            None => Ok(result.rounds.last().map(|r| r.opinions.clone()).unwrap_or_default()),
        }
    }

    pub fn identify_conflicts(&self, opinions: &[AgentOpinion]) -> Vec<String> {
        if opinions.is_empty() {
            return Vec::new();
        }
        let mut by_decision: HashMap<String, Vec<&AgentOpinion>> = HashMap::new();
        for opinion in opinions {
            by_decision.entry(opinion.decision.clone()).or_default().push(opinion);
        }
        let total = opinions.len() as f64;
        let mut conflicts = Vec::new();
        let mut decisions: Vec<&String> = by_decision.keys().collect();
        decisions.sort();
        for decision in decisions {
            let group = &by_decision[decision];
            let support = group.len() as f64 / total;
            if support < 0.3 {
                conflicts.push(format!("decision '{decision}' has only {:.0}% support", support * 100.0));
            }
            let mut concerns: std::collections::HashSet<&str> = std::collections::HashSet::new();
            for opinion in group {
                concerns.extend(opinion.concerns.iter().map(|s| s.as_str()));
            }
            if concerns.len() > 2 {
                conflicts.push(format!("decision '{decision}' carries {} distinct concerns", concerns.len()));
            }
        }
        conflicts
    }

    pub fn suggest_resolution_strategies(&self, opinions: &[AgentOpinion]) -> Vec<String> {
        let conflicts = self.identify_conflicts(opinions);
        if conflicts.is_empty() {
            return vec!["no_action_needed".to_string()];
        }
        let distinct_decisions: std::collections::HashSet<&str> = opinions.iter().map(|o| o.decision.as_str()).collect();
        if distinct_decisions.len() <= 2 {
            vec!["additional_round".to_string()]
        } else {
            vec!["expert_arbitration".to_string()]
        }
    }

    pub async fn resolve_conflict(&self, id: &str, strategy: &str) -> CoreResult<()> {
        let strategy = strategy.to_string();
        self.with_process(id, move |process| {
            process.config.custom_rules.insert("conflict_resolution".to_string(), serde_json::Value::String(strategy));
            Ok(())
        })
        .await
    }

    pub async fn register_agent(&self, agent: Agent) -> CoreResult<()> {
        if agent.id.is_empty() {
            return Err(CoreError::validation("agent id must be non-empty"));
        }
        self.store.upsert_agent(&agent).await
    }

    pub async fn update_agent(&self, id: &str, agent: Agent) -> CoreResult<()> {
        if self.store.get_agent(id).await?.is_none() {
            return Err(CoreError::not_found("agent", id));
        }
        self.store.upsert_agent(&agent).await
    }

    pub async fn get_agent(&self, id: &str) -> CoreResult<Option<Agent>> {
        self.store.get_agent(id).await
    }

    pub async fn list_active_agents(&self) -> CoreResult<Vec<Agent>> {
        self.store.list_active_agents().await
    }

    pub async fn deactivate_agent(&self, id: &str) -> CoreResult<()> {
        let Some(mut agent) = self.store.get_agent(id).await? else { return Err(CoreError::not_found("agent", id)) };
        agent.is_active = false;
        self.store.upsert_agent(&agent).await
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            total_processes: self.stats.total_processes.load(Ordering::Relaxed),
            reached_consensus: self.stats.reached_consensus.load(Ordering::Relaxed),
            deadlocks: self.stats.deadlocks.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn agent_performance(&self, agent_id: &str) -> AgentPerformance {
        self.performance.get(agent_id).map(|p| p.clone()).unwrap_or_else(|| AgentPerformance { agent_id: agent_id.to_string(), ..Default::default() })
    }

    pub fn calculate_decision_accuracy(&self, agent_id: &str) -> f64 {
        self.agent_performance(agent_id).accuracy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::memory::InMemoryStore;

    fn engine() -> Arc<ConsensusEngine> {
        ConsensusEngine::new(Arc::new(InMemoryStore::new()), TestClock::new(Utc::now()))
    }

    fn opinion(agent_id: &str, decision: &str, confidence: f64) -> AgentOpinion {
        AgentOpinion {
            agent_id: agent_id.to_string(),
            decision: decision.to_string(),
            confidence_score: confidence,
            reasoning: String::new(),
            supporting_data: None,
            concerns: Vec::new(),
            submitted_at: Utc::now(),
            round_number: 1,
            ranked_preferences: Vec::new(),
        }
    }

    fn cfg(algorithm: VotingAlgorithm, participants: &[&str], threshold: f64) -> ConsensusConfiguration {
        ConsensusConfiguration {
            topic: "should we file".to_string(),
            algorithm,
            participants: participants.iter().map(|s| s.to_string()).collect(),
            max_rounds: 3,
            timeout_per_round_secs: 300,
            consensus_threshold: threshold,
            min_participants: 2,
            allow_discussion: false,
            require_justification: false,
            custom_rules: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn weighted_majority_end_to_end_matches_spec_scenario() {
        let engine = engine();
        engine.register_agent(Agent { id: "a".into(), name: "a".into(), role: AgentRole::Expert, voting_weight: 2.0, domain_expertise: String::new(), confidence_threshold: 0.5, is_active: true, last_active: Utc::now() }).await.unwrap();
        engine.register_agent(Agent { id: "b".into(), name: "b".into(), role: AgentRole::Expert, voting_weight: 1.0, domain_expertise: String::new(), confidence_threshold: 0.5, is_active: true, last_active: Utc::now() }).await.unwrap();
        engine.register_agent(Agent { id: "c".into(), name: "c".into(), role: AgentRole::Expert, voting_weight: 1.0, domain_expertise: String::new(), confidence_threshold: 0.5, is_active: true, last_active: Utc::now() }).await.unwrap();

        let id = engine.initiate(cfg(VotingAlgorithm::WeightedMajority, &["a", "b", "c"], 0.5)).await.unwrap();
        engine.submit_opinion(&id, opinion("a", "X", 0.9)).await.unwrap();
        engine.submit_opinion(&id, opinion("b", "Y", 0.8)).await.unwrap();
        engine.submit_opinion(&id, opinion("c", "Y", 0.8)).await.unwrap();

        let result = engine.calculate_consensus(&id).await.unwrap();
        assert_eq!(result.final_decision.as_deref(), Some("X"));
        assert!((result.agreement_percentage - 1.8 / 3.4).abs() < 1e-9);
        assert!(result.success);
        assert_eq!(result.confidence_level, DecisionConfidence::Low);
    }

    #[tokio::test]
    async fn get_state_reports_timeout_without_waiting_for_calculate_consensus() {
        let clock = TestClock::new(Utc::now());
        let engine = ConsensusEngine::new(Arc::new(InMemoryStore::new()), clock.clone());
        let id = engine.initiate(cfg(VotingAlgorithm::Majority, &["a", "b"], 0.5)).await.unwrap();
        engine.submit_opinion(&id, opinion("a", "X", 0.9)).await.unwrap();

        assert_eq!(engine.get_state(&id).await.unwrap(), ConsensusState::CollectingOpinions);

        clock.advance(std::time::Duration::from_secs(301));
        assert_eq!(engine.get_state(&id).await.unwrap(), ConsensusState::Timeout);
    }

    #[tokio::test]
    async fn quorum_failure_matches_spec_scenario() {
        let engine = engine();
        let id = engine.initiate(cfg(VotingAlgorithm::Quorum, &["a", "b", "c", "d", "e"], 0.5)).await.unwrap();
        engine.submit_opinion(&id, opinion("a", "X", 0.9)).await.unwrap();
        engine.submit_opinion(&id, opinion("b", "X", 0.8)).await.unwrap();

        let result = engine.calculate_consensus(&id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("quorum not met"));
    }

    #[tokio::test]
    async fn unknown_agent_rejected() {
        let engine = engine();
        let id = engine.initiate(cfg(VotingAlgorithm::Majority, &["a", "b"], 0.5)).await.unwrap();
        let err = engine.submit_opinion(&id, opinion("stranger", "X", 0.5)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn start_voting_round_advances_round_number() {
        let engine = engine();
        let id = engine.initiate(cfg(VotingAlgorithm::Majority, &["a", "b"], 0.5)).await.unwrap();
        engine.submit_opinion(&id, opinion("a", "X", 0.9)).await.unwrap();
        let next = engine.start_voting_round(&id).await.unwrap();
        assert_eq!(next, 2);
        engine.submit_opinion(&id, opinion("a", "X", 0.9)).await.unwrap();
        engine.submit_opinion(&id, opinion("b", "X", 0.9)).await.unwrap();
        let result = engine.calculate_consensus(&id).await.unwrap();
        assert!(result.success);
    }
}
