//! Cross-module integration tests against a real `SqliteStore`, exercising
//! Monitor, Messenger, Consensus and Simulator the way a CLI invocation
//! would: through the public component APIs, never the `Store` trait
//! directly.

use async_trait::async_trait;
use regulens_core::clock::SystemClock;
use regulens_core::config::{MessengerConfig, MonitorConfig, SimulatorConfig};
use regulens_core::consensus::ConsensusEngine;
use regulens_core::http::{FetchResult, HttpFetcher};
use regulens_core::messenger::Messenger;
use regulens_core::monitor::Monitor;
use regulens_core::simulator::{RunRequest, Simulator};
use regulens_core::store::sqlite::SqliteStore;
use regulens_core::store::Store;
use regulens_core::types::*;
use serde_json::json;
use std::sync::Arc;

/// Canned-response fetcher for the monitor sweep test; `test_support`'s
/// equivalent isn't visible from this crate's own integration-test binary.
struct SingleResponseFetcher {
    url: String,
    result: FetchResult,
}

#[async_trait]
impl HttpFetcher for SingleResponseFetcher {
    async fn get(&self, url: &str) -> FetchResult {
        if url == self.url {
            self.result.clone()
        } else {
            FetchResult { success: false, body: String::new(), error_message: Some("no mocked response".to_string()) }
        }
    }
}

fn monitor_config() -> MonitorConfig {
    MonitorConfig { monitoring_interval_seconds: 60, max_consecutive_failures: 5 }
}

fn messenger_config() -> MessengerConfig {
    MessengerConfig { max_retries: 3, retry_delay_seconds: 30, batch_size: 50, queue_refresh_interval_seconds: 5 }
}

fn simulator_config() -> SimulatorConfig {
    SimulatorConfig { max_concurrent_simulations: 5, simulation_timeout_seconds: 3600, result_retention_days: 90 }
}

#[tokio::test]
async fn monitor_sweep_persists_items_through_the_real_store() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store.initialize().await.unwrap();
    let clock = Arc::new(SystemClock);
    let body = r#"
        <rss><channel>
        <item><title>New Rule on Capital Adequacy</title><link>http://sec.gov/a</link>
        <description>desc</description><pubDate>Wed, 02 Oct 2024 15:00:00 GMT</pubDate></item>
        </channel></rss>
    "#;
    let fetcher = Arc::new(SingleResponseFetcher {
        url: "http://sec.gov/feed".to_string(),
        result: FetchResult { success: true, body: body.to_string(), error_message: None },
    });

    let monitor = Monitor::new(store.clone(), clock, fetcher, monitor_config());
    monitor
        .add_source(RegulatorySource {
            id: "sec".to_string(),
            name: "SEC".to_string(),
            base_url: "http://sec.gov/feed".to_string(),
            source_type: SourceType::Rss,
            check_interval_minutes: 60,
            active: true,
            scraping_config: json!({}),
            last_check: chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap(),
            consecutive_failures: 0,
        })
        .await
        .unwrap();

    monitor.run_sweep_once().await.unwrap();

    let items = monitor.get_recent_items(10).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "New Rule on Capital Adequacy");

    let sources = monitor.list_sources().await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].consecutive_failures, 0);
}

#[tokio::test]
async fn messenger_round_trip_through_the_real_store() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store.initialize().await.unwrap();
    let clock = Arc::new(SystemClock);
    let messenger = Messenger::new(store, clock, messenger_config());

    let id = messenger
        .send(
            "compliance-agent",
            Some("risk-agent"),
            "NOTIFICATION",
            json!({"severity": "high"}),
            1,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let received = messenger.receive("risk-agent", 10, None).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, id);

    messenger.acknowledge(&id, "risk-agent").await.unwrap();

    let stats = messenger.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn consensus_weighted_majority_end_to_end_through_the_real_store() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store.initialize().await.unwrap();
    let clock = Arc::new(SystemClock);
    let engine = ConsensusEngine::new(store, clock);

    for (id, weight) in [("a1", 3.0), ("a2", 1.0), ("a3", 1.0)] {
        engine
            .register_agent(Agent {
                id: id.to_string(),
                name: id.to_string(),
                role: AgentRole::Expert,
                voting_weight: weight,
                domain_expertise: "risk".to_string(),
                confidence_threshold: 0.5,
                is_active: true,
                last_active: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    let id = engine
        .initiate(ConsensusConfiguration {
            topic: "adopt new capital rule".to_string(),
            algorithm: VotingAlgorithm::WeightedMajority,
            participants: vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
            max_rounds: 3,
            timeout_per_round_secs: 60,
            consensus_threshold: 0.5,
            min_participants: 2,
            allow_discussion: false,
            require_justification: false,
            custom_rules: Default::default(),
        })
        .await
        .unwrap();

    engine.start_voting_round(&id).await.unwrap();
    for (agent_id, decision) in [("a1", "approve"), ("a2", "reject"), ("a3", "reject")] {
        engine
            .submit_opinion(
                &id,
                AgentOpinion {
                    agent_id: agent_id.to_string(),
                    decision: decision.to_string(),
                    confidence_score: 0.9,
                    reasoning: "analysis".to_string(),
                    supporting_data: None,
                    concerns: Vec::new(),
                    submitted_at: chrono::Utc::now(),
                    round_number: 1,
                    ranked_preferences: Vec::new(),
                },
            )
            .await
            .unwrap();
    }
    engine.end_voting_round(&id).await.unwrap();

    let result = engine.calculate_consensus(&id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.final_decision.as_deref(), Some("approve"));
    assert_eq!(result.confidence_level, DecisionConfidence::Low);

    let fetched = engine.get_result(&id).await.unwrap().unwrap();
    assert_eq!(fetched.consensus_id, result.consensus_id);
}

#[tokio::test]
async fn simulator_runs_a_scenario_synchronously_through_the_real_store() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store.initialize().await.unwrap();
    let clock = Arc::new(SystemClock);
    let simulator = Simulator::new(store, clock, simulator_config().max_concurrent_simulations);

    let scenario = simulator
        .create_scenario(
            SimulationScenario {
                id: String::new(),
                name: "New capital rule rollout".to_string(),
                description: "stress test".to_string(),
                scenario_type: ScenarioType::RegulatoryChange,
                regulatory_changes: json!({"rule": "capital-adequacy"}),
                impact_parameters: json!({}),
                baseline_data: json!({"entities": 100}),
                test_data: json!({}),
                created_by: "analyst".to_string(),
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                is_template: false,
                is_active: true,
                tags: Vec::new(),
                metadata: json!({}),
                estimated_runtime_seconds: 1,
                max_concurrent_simulations: 5,
            },
            "analyst",
        )
        .await
        .unwrap();

    let execution_id = simulator
        .run_simulation(RunRequest {
            scenario_id: scenario.id.clone(),
            user_id: "analyst".to_string(),
            custom_parameters: None,
            test_data_override: None,
            async_execution: false,
            priority: 1,
        })
        .await
        .unwrap();

    let status = simulator.get_execution_status(&execution_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);

    let result = simulator.get_simulation_result(&execution_id).await.unwrap();
    assert!(result.is_some());

    let history = simulator.list_user_history("analyst", 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
}
