//! Regulatory Simulator (spec.md §4.4).

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::types::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};
use uuid::Uuid;

pub struct RunRequest {
    pub scenario_id: Id,
    pub user_id: String,
    pub custom_parameters: Option<Value>,
    pub test_data_override: Option<Value>,
    pub async_execution: bool,
    pub priority: u8,
}

pub struct Simulator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    concurrency: Arc<Semaphore>,
    result_retention_days: AtomicU32,
    active: DashMap<Id, tokio::task::JoinHandle<()>>,
}

impl Simulator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, max_concurrent_simulations: usize) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            concurrency: Arc::new(Semaphore::new(max_concurrent_simulations.max(1))),
            result_retention_days: AtomicU32::new(90),
            active: DashMap::new(),
        })
    }

    pub fn set_result_retention_days(&self, days: u32) {
        self.result_retention_days.store(days, Ordering::Relaxed);
    }

    fn validate_scenario(&self, scenario: &SimulationScenario) -> CoreResult<()> {
        if scenario.name.trim().is_empty() {
            return Err(CoreError::validation("scenario name must be non-empty"));
        }
        if scenario.regulatory_changes.is_null() {
            return Err(CoreError::validation("scenario must carry regulatory_changes"));
        }
        if let Some(changes) = scenario.regulatory_changes.as_array() {
            for change in changes {
                let change_type = change.get("change_type").and_then(Value::as_str);
                if !matches!(change_type, Some("addition") | Some("modification") | Some("repeal")) {
                    return Err(CoreError::validation("regulatory_changes entry requires change_type in {addition, modification, repeal}"));
                }
                if change.get("jurisdiction").and_then(Value::as_str).is_none() {
                    return Err(CoreError::validation("regulatory_changes entry requires jurisdiction"));
                }
                if change.get("description").and_then(Value::as_str).is_none() {
                    return Err(CoreError::validation("regulatory_changes entry requires description"));
                }
            }
        }
        let params = &scenario.impact_parameters;
        if let Some(sensitivity) = params.get("sensitivity").and_then(Value::as_f64) {
            if !(0.0..=1.0).contains(&sensitivity) {
                return Err(CoreError::validation("impact_parameters.sensitivity must be in [0,1]"));
            }
        }
        if let Some(threshold) = params.get("impact_threshold").and_then(Value::as_f64) {
            if threshold < 0.0 {
                return Err(CoreError::validation("impact_parameters.impact_threshold must be >= 0"));
            }
        }
        if let Some(max_iterations) = params.get("max_iterations").and_then(Value::as_u64) {
            if !(1..=10000).contains(&max_iterations) {
                return Err(CoreError::validation("impact_parameters.max_iterations must be in 1..=10000"));
            }
        }
        if let Some(confidence) = params.get("confidence_threshold").and_then(Value::as_f64) {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(CoreError::validation("impact_parameters.confidence_threshold must be in [0,1]"));
            }
        }
        Ok(())
    }

    pub async fn create_scenario(&self, mut scenario: SimulationScenario, user_id: &str) -> CoreResult<SimulationScenario> {
        self.validate_scenario(&scenario)?;
        let now = self.clock.now();
        scenario.id = Uuid::new_v4().to_string();
        scenario.created_by = user_id.to_string();
        scenario.created_at = now;
        scenario.updated_at = now;
        self.store.upsert_scenario(&scenario).await?;
        Ok(scenario)
    }

    pub async fn get_scenario(&self, id: &str) -> CoreResult<Option<SimulationScenario>> {
        self.store.get_scenario(id).await
    }

    pub async fn list_scenarios(&self, user_id: Option<&str>, limit: usize, offset: usize) -> CoreResult<Vec<SimulationScenario>> {
        self.store.list_scenarios(user_id, limit, offset).await
    }

    pub async fn update_scenario(&self, id: &str, mut scenario: SimulationScenario) -> CoreResult<()> {
        let Some(existing) = self.store.get_scenario(id).await? else { return Err(CoreError::not_found("scenario", id)) };
        self.validate_scenario(&scenario)?;
        scenario.id = existing.id;
        scenario.created_by = existing.created_by;
        scenario.created_at = existing.created_at;
        scenario.updated_at = self.clock.now();
        self.store.upsert_scenario(&scenario).await
    }

    pub async fn delete_scenario(&self, id: &str) -> CoreResult<bool> {
        self.store.delete_scenario(id).await
    }

    #[instrument(skip(self, request))]
    pub async fn run_simulation(self: &Arc<Self>, request: RunRequest) -> CoreResult<Id> {
        if !(1..=5).contains(&request.priority) {
            return Err(CoreError::validation("priority must be in 1..=5"));
        }
        let Some(scenario) = self.store.get_scenario(&request.scenario_id).await? else {
            return Err(CoreError::not_found("scenario", request.scenario_id.clone()));
        };

        let now = self.clock.now();
        let execution = SimulationExecution {
            id: Uuid::new_v4().to_string(),
            scenario_id: scenario.id.clone(),
            user_id: request.user_id.clone(),
            status: ExecutionStatus::Pending,
            execution_parameters: request.custom_parameters.clone().unwrap_or(json!({})),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            error_message: None,
            progress_percentage: 5.0,
            created_at: now,
        };
        self.store.insert_execution(&execution).await?;

        let test_data = request.test_data_override.clone().unwrap_or_else(|| scenario.test_data.clone());
        let execution_id = execution.id.clone();

        if request.async_execution {
            let this = Arc::clone(self);
            let scenario = scenario.clone();
            let id_for_task = execution_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = this.concurrency.acquire().await;
                if let Err(e) = this.execute(&id_for_task, &scenario, test_data).await {
                    warn!(execution_id = %id_for_task, error = %e, "simulation execution failed");
                }
                this.active.remove(&id_for_task);
            });
            self.active.insert(execution_id.clone(), handle);
        } else {
            let _permit = self.concurrency.acquire().await;
            self.execute(&execution_id, &scenario, test_data).await?;
        }

        Ok(execution_id)
    }

    async fn execute(&self, execution_id: &str, scenario: &SimulationScenario, test_data: Value) -> CoreResult<()> {
        let Some(mut execution) = self.store.get_execution(execution_id).await? else {
            return Err(CoreError::not_found("execution", execution_id));
        };
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(self.clock.now());
        execution.progress_percentage = 25.0;
        self.store.update_execution(&execution).await?;

        let metrics = analyze_regulatory_impact(&scenario.regulatory_changes, &test_data);
        execution.progress_percentage = 75.0;
        self.store.update_execution(&execution).await?;

        if let Some(refreshed) = self.store.get_execution(execution_id).await? {
            if refreshed.status == ExecutionStatus::Cancelled {
                return Ok(());
            }
        }

        let recommendations = build_recommendations(&metrics, scenario.scenario_type);
        let result = assemble_result(execution_id, &execution.user_id, scenario, &test_data, &metrics, recommendations, self.clock.now());
        self.store.insert_result(&result).await?;

        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(self.clock.now());
        execution.progress_percentage = 100.0;
        self.store.update_execution(&execution).await?;
        Ok(())
    }

    pub async fn get_execution_status(&self, execution_id: &str) -> CoreResult<SimulationExecution> {
        self.store.get_execution(execution_id).await?.ok_or_else(|| CoreError::not_found("execution", execution_id))
    }

    pub async fn get_simulation_result(&self, execution_id: &str) -> CoreResult<Option<SimulationResult>> {
        self.store.get_result_by_execution(execution_id).await
    }

    pub async fn cancel_simulation(&self, execution_id: &str, user_id: &str) -> CoreResult<()> {
        let Some(mut execution) = self.store.get_execution(execution_id).await? else {
            return Err(CoreError::not_found("execution", execution_id));
        };
        if execution.user_id != user_id {
            return Err(CoreError::validation("execution does not belong to this user"));
        }
        if matches!(execution.status, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled) {
            return Err(CoreError::conflict("execution is already terminal"));
        }
        execution.status = ExecutionStatus::Cancelled;
        execution.cancelled_at = Some(self.clock.now());
        self.store.update_execution(&execution).await?;
        if let Some((_, handle)) = self.active.remove(execution_id) {
            handle.abort();
        }
        Ok(())
    }

    pub async fn list_user_history(&self, user_id: &str, limit: usize, offset: usize) -> CoreResult<Vec<SimulationResult>> {
        self.store.list_user_history(user_id, limit, offset).await
    }

    /// `result_retention_days` (see SPEC_FULL.md §6 configuration) is held
    /// here so callers can query it; the store has no cross-user listing
    /// primitive yet, so the actual sweep is deferred (see DESIGN.md).
    pub fn result_retention_days(&self) -> u32 {
        self.result_retention_days.load(Ordering::Relaxed)
    }
}

fn analyze_regulatory_impact(regulatory_changes: &Value, test_data: &Value) -> ImpactMetrics {
    let mut metrics = ImpactMetrics::default();
    metrics += transaction_impact(regulatory_changes, test_data);
    metrics += policy_impact(regulatory_changes, test_data);
    metrics += risk_impact(regulatory_changes);

    if metrics.total_entities_affected > 0 {
        metrics.compliance_score_change /= metrics.total_entities_affected as f64;
    }
    if metrics.high_risk_entities > 10 {
        metrics.critical_violations.push("High volume of high-risk entities affected".to_string());
    }
    if metrics.compliance_score_change < -0.2 {
        metrics.critical_violations.push("Significant compliance score degradation".to_string());
    }
    metrics.operational_cost_increase = metrics.total_entities_affected as f64 * 100.0;
    metrics.estimated_implementation_time_days = (metrics.total_entities_affected as f64 / 10.0).max(30.0);
    metrics
}

fn transaction_impact(regulatory_changes: &Value, test_data: &Value) -> ImpactMetrics {
    let mut metrics = ImpactMetrics::default();
    let max_amount = regulatory_changes.get("transaction_limits").and_then(|t| t.get("max_amount")).and_then(Value::as_f64);
    let high_risk_countries: Vec<&str> = regulatory_changes
        .get("high_risk_countries")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(transactions) = test_data.get("transactions").and_then(Value::as_array) else { return metrics };
    for transaction in transactions {
        let mut entry_risk = 0.0f64;
        let mut affected = false;

        if let Some(limit) = max_amount {
            if let Some(amount) = transaction.get("amount").and_then(Value::as_f64) {
                if amount > limit {
                    affected = true;
                    entry_risk += 0.8;
                    metrics.high_risk_entities += 1;
                }
            }
        }
        if let Some(country) = transaction.get("country").and_then(Value::as_str) {
            if high_risk_countries.contains(&country) {
                affected = true;
                entry_risk += 0.6;
                if entry_risk < 0.8 {
                    metrics.medium_risk_entities += 1;
                }
            }
        }
        if affected {
            metrics.total_entities_affected += 1;
            metrics.compliance_score_change -= entry_risk * 0.1;
        }
    }
    metrics
}

fn policy_impact(regulatory_changes: &Value, test_data: &Value) -> ImpactMetrics {
    let mut metrics = ImpactMetrics::default();
    let has_new_requirements = !regulatory_changes.get("new_requirements").unwrap_or(&Value::Null).is_null();
    let has_deprecated_requirements = !regulatory_changes.get("deprecated_requirements").unwrap_or(&Value::Null).is_null();

    let Some(policies) = test_data.get("policies").and_then(Value::as_array) else { return metrics };
    for _policy in policies {
        if has_new_requirements {
            metrics.total_entities_affected += 1;
            metrics.operational_cost_increase += 5000.0;
            metrics.estimated_implementation_time_days += 5.0;
        }
        if has_deprecated_requirements {
            metrics.total_entities_affected += 1;
        }
    }
    metrics
}

fn risk_impact(regulatory_changes: &Value) -> ImpactMetrics {
    let mut metrics = ImpactMetrics::default();
    if !regulatory_changes.get("risk_weightings").unwrap_or(&Value::Null).is_null() {
        metrics.risk_score_change += 0.15;
    }
    metrics
}

fn build_recommendations(metrics: &ImpactMetrics, scenario_type: ScenarioType) -> Vec<String> {
    let mut recommendations = Vec::new();
    if metrics.high_risk_entities > 0 {
        recommendations.push("Increase monitoring frequency for high-risk entities".to_string());
        recommendations.push("Conduct enhanced due diligence on flagged transactions".to_string());
    }
    if metrics.compliance_score_change < -0.1 {
        recommendations.push("Schedule compliance training for affected teams".to_string());
        recommendations.push("Update internal policy documentation".to_string());
    }
    if metrics.operational_cost_increase > 10000.0 {
        recommendations.push("Budget for increased operational costs".to_string());
        recommendations.push("Evaluate outsourcing options for compliance workload".to_string());
    }
    if metrics.estimated_implementation_time_days > 60.0 {
        recommendations.push("Adopt a phased implementation plan".to_string());
    }
    if scenario_type == ScenarioType::RegulatoryChange {
        recommendations.push("Engage legal counsel for regulatory interpretation".to_string());
        recommendations.push("Initiate a change-management program".to_string());
    }
    recommendations
}

fn assemble_result(
    execution_id: &str,
    user_id: &str,
    scenario: &SimulationScenario,
    test_data: &Value,
    metrics: &ImpactMetrics,
    recommendations: Vec<String>,
    now: DateTime<Utc>,
) -> SimulationResult {
    let overall_risk_level = if metrics.high_risk_entities > 10 {
        "high"
    } else if metrics.medium_risk_entities > 50 {
        "medium"
    } else {
        "low"
    };

    let risk_assessment = json!({
        "overall_risk_level": overall_risk_level,
        "high_risk_entities": metrics.high_risk_entities,
        "medium_risk_entities": metrics.medium_risk_entities,
        "low_risk_entities": metrics.low_risk_entities,
        "risk_score_change": metrics.risk_score_change,
    });
    let cost_impact = json!({
        "operational_cost_increase": metrics.operational_cost_increase,
        "estimated_implementation_cost": metrics.operational_cost_increase * 1.5,
        "estimated_annual_cost": metrics.operational_cost_increase * 12.0,
    });
    let compliance_impact = json!({
        "compliance_score_change": metrics.compliance_score_change,
        "critical_violations": metrics.critical_violations,
    });
    let operational_impact = json!({
        "estimated_implementation_time_days": metrics.estimated_implementation_time_days,
        "total_entities_affected": metrics.total_entities_affected,
    });
    let impact_summary = json!({
        "total_entities_affected": metrics.total_entities_affected,
        "compliance_score_change": metrics.compliance_score_change,
        "operational_cost_increase": metrics.operational_cost_increase,
    });

    SimulationResult {
        id: Uuid::new_v4().to_string(),
        execution_id: execution_id.to_string(),
        scenario_id: scenario.id.clone(),
        user_id: user_id.to_string(),
        result_type: "impact_analysis".to_string(),
        impact_summary,
        detailed_results: json!({ "test_data": test_data, "regulatory_changes": scenario.regulatory_changes }),
        affected_entities: json!({ "total": metrics.total_entities_affected }),
        recommendations,
        risk_assessment,
        cost_impact,
        compliance_impact,
        operational_impact,
        created_at: now,
        metadata: json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store::memory::InMemoryStore;

    fn scenario() -> SimulationScenario {
        let now = Utc::now();
        SimulationScenario {
            id: String::new(),
            name: "transaction limit tightening".to_string(),
            description: String::new(),
            scenario_type: ScenarioType::RegulatoryChange,
            regulatory_changes: json!({
                "transaction_limits": {"max_amount": 10000},
                "high_risk_countries": ["KP"],
            }),
            impact_parameters: json!({"sensitivity": 0.5, "impact_threshold": 0.0, "max_iterations": 100, "confidence_threshold": 0.8}),
            baseline_data: json!({}),
            test_data: json!({
                "transactions": [
                    {"amount": 15000, "country": "US"},
                    {"amount": 500, "country": "KP"},
                    {"amount": 100, "country": "US"}
                ]
            }),
            created_by: String::new(),
            created_at: now,
            updated_at: now,
            is_template: false,
            is_active: true,
            tags: Vec::new(),
            metadata: json!({}),
            estimated_runtime_seconds: 10,
            max_concurrent_simulations: 5,
        }
    }

    #[test]
    fn impact_computation_matches_spec_scenario() {
        let scenario = scenario();
        let metrics = analyze_regulatory_impact(&scenario.regulatory_changes, &scenario.test_data);
        assert_eq!(metrics.total_entities_affected, 2);
        assert_eq!(metrics.high_risk_entities, 1);
        assert_eq!(metrics.medium_risk_entities, 1);
        assert!((metrics.compliance_score_change - (-0.07)).abs() < 1e-9);
        assert_eq!(metrics.operational_cost_increase, 200.0);
        assert_eq!(metrics.estimated_implementation_time_days, 30.0);
    }

    #[tokio::test]
    async fn sync_run_persists_a_result() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.initialize().await.unwrap();
        let simulator = Simulator::new(store.clone(), TestClock::new(Utc::now()), 2);
        let created = simulator.create_scenario(scenario(), "alice").await.unwrap();

        let execution_id = simulator
            .run_simulation(RunRequest {
                scenario_id: created.id.clone(),
                user_id: "alice".to_string(),
                custom_parameters: None,
                test_data_override: None,
                async_execution: false,
                priority: 3,
            })
            .await
            .unwrap();

        let execution = simulator.get_execution_status(&execution_id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let result = simulator.get_simulation_result(&execution_id).await.unwrap().unwrap();
        assert_eq!(result.impact_summary["total_entities_affected"], 2);
    }

    #[tokio::test]
    async fn rejects_scenario_with_bad_change_type() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store.initialize().await.unwrap();
        let simulator = Simulator::new(store, TestClock::new(Utc::now()), 2);
        let mut bad = scenario();
        bad.regulatory_changes = json!([{"change_type": "nonsense", "jurisdiction": "US", "description": "x"}]);
        let err = simulator.create_scenario(bad, "alice").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
