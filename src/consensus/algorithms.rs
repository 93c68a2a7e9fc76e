//! Voting algorithms (spec.md §4.3 "Algorithms").

use crate::types::{AgentOpinion, DecisionConfidence, VotingAlgorithm};
use std::collections::HashMap;

pub struct Tally {
    pub decision: Option<String>,
    pub agreement: f64,
    /// Unweighted fraction of opinions whose `decision` matches the
    /// winner; used for confidence tiering, distinct from `agreement`
    /// for weighted algorithms where the two diverge.
    pub support: f64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// `rounds_used > 2` drops the tier by one (spec.md §4.3 "Confidence
/// computation helper").
pub fn confidence_for(agreement: f64, bands: (f64, f64, f64), rounds_used: u32) -> DecisionConfidence {
    let agreement = agreement.clamp(0.0, 1.0);
    let tier = if agreement >= bands.0 {
        DecisionConfidence::VeryHigh
    } else if agreement >= bands.1 {
        DecisionConfidence::High
    } else if agreement >= bands.2 {
        DecisionConfidence::Medium
    } else {
        DecisionConfidence::Low
    };
    if rounds_used > 2 {
        tier.one_tier_down()
    } else {
        tier
    }
}

const MAJORITY_BANDS: (f64, f64, f64) = (0.9, 0.7, 0.5);
const WEIGHTED_BANDS: (f64, f64, f64) = (0.8, 0.6, 0.4);

fn decision_counts(opinions: &[AgentOpinion]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for opinion in opinions {
        *counts.entry(opinion.decision.clone()).or_insert(0u32) += 1;
    }
    counts
}

fn argmax_count(counts: &HashMap<String, u32>) -> Option<(String, u32)> {
    counts.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))).map(|(d, c)| (d.clone(), *c))
}

pub fn unanimous(opinions: &[AgentOpinion]) -> Tally {
    if opinions.is_empty() {
        return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("no opinions submitted".to_string()) };
    }
    let first = &opinions[0].decision;
    let all_same = opinions.iter().all(|o| &o.decision == first);
    if all_same {
        Tally { decision: Some(first.clone()), agreement: 1.0, support: 1.0, success: true, error_message: None }
    } else {
        let counts = decision_counts(opinions);
        let (_, top) = argmax_count(&counts).unwrap();
        let support = top as f64 / opinions.len() as f64;
        Tally {
            decision: None,
            agreement: support,
            support,
            success: false,
            error_message: Some("opinions are not unanimous".to_string()),
        }
    }
}

pub fn majority(opinions: &[AgentOpinion], threshold: f64) -> Tally {
    if opinions.is_empty() {
        return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("no opinions submitted".to_string()) };
    }
    let counts = decision_counts(opinions);
    let (decision, top) = argmax_count(&counts).unwrap();
    let agreement = top as f64 / opinions.len() as f64;
    Tally { decision: Some(decision), agreement, support: agreement, success: agreement > threshold, error_message: None }
}

/// `agreement` is the weighted score ratio used for the success check and
/// the result's `agreement_percentage`; `support` is the unweighted
/// fraction of opinions backing the winner, which is what confidence
/// tiering uses (spec.md §8 Scenario 3: `agreement≈0.529` but only 1 of
/// 3 agents actually picked the winning decision, giving `LOW`
/// confidence despite a passing agreement ratio).
pub fn weighted_majority(opinions: &[AgentOpinion], weights: &HashMap<String, f64>, threshold: f64) -> Tally {
    if opinions.is_empty() {
        return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("no opinions submitted".to_string()) };
    }
    let mut scores: HashMap<String, f64> = HashMap::new();
    for opinion in opinions {
        let weight = weights.get(&opinion.agent_id).copied().unwrap_or(1.0);
        *scores.entry(opinion.decision.clone()).or_insert(0.0) += weight * opinion.confidence_score;
    }
    let total: f64 = scores.values().sum();
    let (decision, top_score) = scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal).then(b.0.cmp(a.0)))
        .map(|(d, s)| (d.clone(), *s))
        .unwrap();
    let agreement = if total > 0.0 { top_score / total } else { 0.0 };
    let counts = decision_counts(opinions);
    let support = counts.get(&decision).copied().unwrap_or(0) as f64 / opinions.len() as f64;
    Tally { decision: Some(decision), agreement, support, success: agreement > threshold, error_message: None }
}

/// Standard instant-runoff over `AgentOpinion::ranked_preferences`. Each
/// opinion is one ballot, unweighted. Ties at elimination break toward
/// eliminating the lexicographically largest candidate, for determinism.
pub fn ranked_choice(opinions: &[AgentOpinion]) -> Tally {
    let mut ballots: Vec<Vec<String>> = opinions.iter().map(|o| o.ranked_preferences.clone()).collect();
    ballots.retain(|b| !b.is_empty());
    if ballots.is_empty() {
        return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("no ranked ballots submitted".to_string()) };
    }

    loop {
        let mut first_choice_counts: HashMap<String, u32> = HashMap::new();
        for ballot in &ballots {
            if let Some(choice) = ballot.first() {
                *first_choice_counts.entry(choice.clone()).or_insert(0) += 1;
            }
        }
        if first_choice_counts.is_empty() {
            return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("no candidates remain".to_string()) };
        }
        let total: u32 = first_choice_counts.values().sum();
        if let Some((decision, count)) = first_choice_counts.iter().find(|(_, &c)| c * 2 > total) {
            let agreement = *count as f64 / total as f64;
            return Tally { decision: Some(decision.clone()), agreement, support: agreement, success: true, error_message: None };
        }
        if first_choice_counts.len() == 1 {
            let (decision, count) = first_choice_counts.into_iter().next().unwrap();
            let agreement = count as f64 / total as f64;
            return Tally { decision: Some(decision), agreement, support: agreement, success: true, error_message: None };
        }
        let (loser, _) = first_choice_counts.iter().min_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))).map(|(d, c)| (d.clone(), *c)).unwrap();
        for ballot in &mut ballots {
            ballot.retain(|c| c != &loser);
        }
    }
}

pub fn quorum(opinions: &[AgentOpinion], total_participants: usize, threshold: f64) -> Tally {
    let required = total_participants.div_ceil(2);
    if opinions.len() < required {
        return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("quorum not met".to_string()) };
    }
    majority(opinions, threshold)
}

pub fn super_majority(opinions: &[AgentOpinion], threshold: f64) -> Tally {
    majority(opinions, threshold.max(2.0 / 3.0))
}

pub fn consensus_variant(opinions: &[AgentOpinion], threshold: f64) -> Tally {
    majority(opinions, threshold.max(0.9))
}

pub fn plurality(opinions: &[AgentOpinion]) -> Tally {
    if opinions.is_empty() {
        return Tally { decision: None, agreement: 0.0, support: 0.0, success: false, error_message: Some("no opinions submitted".to_string()) };
    }
    let counts = decision_counts(opinions);
    let (decision, top) = argmax_count(&counts).unwrap();
    let agreement = top as f64 / opinions.len() as f64;
    Tally { decision: Some(decision), agreement, support: agreement, success: true, error_message: None }
}

pub fn bands_for(algorithm: VotingAlgorithm) -> (f64, f64, f64) {
    match algorithm {
        VotingAlgorithm::WeightedMajority => WEIGHTED_BANDS,
        _ => MAJORITY_BANDS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

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

    #[test]
    fn weighted_majority_matches_spec_scenario() {
        let opinions = vec![opinion("a", "X", 0.9), opinion("b", "Y", 0.8), opinion("c", "Y", 0.8)];
        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 2.0);
        weights.insert("b".to_string(), 1.0);
        weights.insert("c".to_string(), 1.0);
        let tally = weighted_majority(&opinions, &weights, 0.5);
        assert_eq!(tally.decision.as_deref(), Some("X"));
        assert!((tally.agreement - 1.8 / 3.4).abs() < 1e-9);
        assert!(tally.success);
    }

    #[test]
    fn quorum_not_met_matches_spec_scenario() {
        let opinions = vec![opinion("a", "X", 0.9), opinion("b", "X", 0.8)];
        let tally = quorum(&opinions, 5, 0.5);
        assert!(!tally.success);
        assert_eq!(tally.error_message.as_deref(), Some("quorum not met"));
    }

    #[test]
    fn ranked_choice_eliminates_to_a_majority_winner() {
        let mut a = opinion("a", "X", 0.9);
        a.ranked_preferences = vec!["Z".to_string(), "X".to_string()];
        let mut b = opinion("b", "Y", 0.8);
        b.ranked_preferences = vec!["Y".to_string(), "X".to_string()];
        let mut c = opinion("c", "X", 0.8);
        c.ranked_preferences = vec!["X".to_string(), "Y".to_string()];
        let tally = ranked_choice(&[a, b, c]);
        assert!(tally.success);
        assert_eq!(tally.decision.as_deref(), Some("X"));
    }

    #[test]
    fn plurality_always_succeeds() {
        let opinions = vec![opinion("a", "X", 0.5), opinion("b", "Y", 0.5), opinion("c", "Z", 0.5)];
        let tally = plurality(&opinions);
        assert!(tally.success);
    }
}
