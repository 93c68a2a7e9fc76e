//! Shared domain model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type Id = String;

// ---------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRole {
    Expert,
    Reviewer,
    DecisionMaker,
    Facilitator,
    Observer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Id,
    pub name: String,
    pub role: AgentRole,
    pub voting_weight: f64,
    pub domain_expertise: String,
    pub confidence_threshold: f64,
    pub is_active: bool,
    pub last_active: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acknowledged,
    Read,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Acknowledged | MessageStatus::Read | MessageStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => MessageStatus::Pending,
            "delivered" => MessageStatus::Delivered,
            "acknowledged" => MessageStatus::Acknowledged,
            "read" => MessageStatus::Read,
            "failed" => MessageStatus::Failed,
            "expired" => MessageStatus::Expired,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Id,
    pub from_agent: Id,
    pub to_agent: Option<Id>,
    pub message_type: String,
    pub content: Value,
    pub priority: u8,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
    pub parent_message_id: Option<Id>,
    pub conversation_id: Option<Id>,
    /// Agents excluded from a broadcast (`to_agent = None`); empty for
    /// unicast messages. Additive field, not named in spec.md §3's data
    /// model text but required to implement `Broadcast(..., excluded_agents?)`.
    pub excluded_agents: Vec<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStatus {
    Active,
    Closed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Id,
    pub topic: String,
    pub participant_agents: Vec<Id>,
    pub priority: ConversationPriority,
    pub metadata: Option<Value>,
    pub status: ConversationStatus,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub name: String,
    pub message_type: String,
    pub template_content: Value,
    pub description: String,
    pub is_active: bool,
    pub created_by: Option<String>,
}

// ---------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingAlgorithm {
    Unanimous,
    Majority,
    SuperMajority,
    WeightedMajority,
    RankedChoice,
    Quorum,
    Consensus,
    Plurality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusState {
    Initializing,
    CollectingOpinions,
    Discussing,
    Voting,
    ResolvingConflicts,
    ReachedConsensus,
    Deadlock,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DecisionConfidence {
    VeryLow = 1,
    Low = 2,
    Medium = 3,
    High = 4,
    VeryHigh = 5,
}

impl DecisionConfidence {
    /// Drops one tier, floored at `VeryLow`. Used when a round has taken
    /// more than two rounds to settle (spec.md §4.3 confidence helper).
    pub fn one_tier_down(self) -> Self {
        match self {
            DecisionConfidence::VeryHigh => DecisionConfidence::High,
            DecisionConfidence::High => DecisionConfidence::Medium,
            DecisionConfidence::Medium => DecisionConfidence::Low,
            DecisionConfidence::Low | DecisionConfidence::VeryLow => DecisionConfidence::VeryLow,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOpinion {
    pub agent_id: Id,
    pub decision: String,
    pub confidence_score: f64,
    pub reasoning: String,
    pub supporting_data: Option<Value>,
    pub concerns: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub round_number: u32,
    /// Optional ranked preferences for RANKED_CHOICE; when every opinion in
    /// a round carries one, instant-runoff is used instead of falling
    /// through to MAJORITY (see SPEC_FULL.md §5 open question 1).
    pub ranked_preferences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingRound {
    pub round_number: u32,
    pub topic: String,
    pub description: String,
    pub opinions: Vec<AgentOpinion>,
    pub vote_counts: HashMap<String, u32>,
    pub state: ConsensusState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub consensus_id: Id,
    pub topic: String,
    pub final_decision: Option<String>,
    pub confidence_level: DecisionConfidence,
    pub algorithm_used: VotingAlgorithm,
    pub rounds: Vec<VotingRound>,
    pub final_state: ConsensusState,
    pub total_duration_ms: i64,
    pub total_participants: usize,
    pub agreement_percentage: f64,
    pub dissenting_opinions: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfiguration {
    pub topic: String,
    pub algorithm: VotingAlgorithm,
    pub participants: Vec<Id>,
    pub max_rounds: u32,
    pub timeout_per_round_secs: i64,
    pub consensus_threshold: f64,
    pub min_participants: usize,
    pub allow_discussion: bool,
    pub require_justification: bool,
    pub custom_rules: HashMap<String, Value>,
}

// ---------------------------------------------------------------------
// Regulatory Monitor
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Rss,
    Html,
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatorySource {
    pub id: Id,
    pub name: String,
    pub base_url: String,
    pub source_type: SourceType,
    pub check_interval_minutes: i64,
    pub active: bool,
    pub scraping_config: Value,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
}

pub const FAILURE_CEILING: u32 = 5;

impl RegulatorySource {
    /// spec.md §4.1 step 1: `active ∧ consecutive_failures < 5 ∧ (now −
    /// last_check) ≥ check_interval`.
    pub fn should_check(&self, now: DateTime<Utc>) -> bool {
        if !self.active || self.consecutive_failures >= FAILURE_CEILING {
            return false;
        }
        let elapsed = now - self.last_check;
        elapsed.num_minutes() >= self.check_interval_minutes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatoryItem {
    pub id: Id,
    pub source: String,
    pub title: String,
    pub description: String,
    pub content_url: String,
    pub change_type: String,
    pub severity: Severity,
    pub metadata: Value,
    pub detected_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Regulatory Simulator
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioType {
    RegulatoryChange,
    MarketChange,
    OperationalChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationScenario {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub scenario_type: ScenarioType,
    pub regulatory_changes: Value,
    pub impact_parameters: Value,
    pub baseline_data: Value,
    pub test_data: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_template: bool,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub estimated_runtime_seconds: i64,
    pub max_concurrent_simulations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationExecution {
    pub id: Id,
    pub scenario_id: Id,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub execution_parameters: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub id: Id,
    pub execution_id: Id,
    pub scenario_id: Id,
    pub user_id: String,
    pub result_type: String,
    pub impact_summary: Value,
    pub detailed_results: Value,
    pub affected_entities: Value,
    pub recommendations: Vec<String>,
    pub risk_assessment: Value,
    pub cost_impact: Value,
    pub compliance_impact: Value,
    pub operational_impact: Value,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpactMetrics {
    pub total_entities_affected: u64,
    pub high_risk_entities: u64,
    pub medium_risk_entities: u64,
    pub low_risk_entities: u64,
    pub compliance_score_change: f64,
    pub risk_score_change: f64,
    pub operational_cost_increase: f64,
    pub estimated_implementation_time_days: f64,
    pub critical_violations: Vec<String>,
    pub recommended_actions: Vec<String>,
}

impl std::ops::AddAssign for ImpactMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.total_entities_affected += rhs.total_entities_affected;
        self.high_risk_entities += rhs.high_risk_entities;
        self.medium_risk_entities += rhs.medium_risk_entities;
        self.low_risk_entities += rhs.low_risk_entities;
        self.compliance_score_change += rhs.compliance_score_change;
        self.risk_score_change += rhs.risk_score_change;
        self.operational_cost_increase += rhs.operational_cost_increase;
        self.estimated_implementation_time_days += rhs.estimated_implementation_time_days;
        self.critical_violations.extend(rhs.critical_violations);
        self.recommended_actions.extend(rhs.recommended_actions);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub scenario_id: Id,
    pub user_id: String,
    pub custom_parameters: Option<Value>,
    pub test_data_override: Option<Value>,
    pub async_execution: bool,
    pub priority: u8,
}
