//! Approval fatigue mitigation.
//!
//! Adapts approval behaviour based on decision cadence and timing
//! trends so the human doesn't rubber-stamp under cognitive load.

use chrono::{DateTime, Duration, Utc};

use crate::approval::token::ApprovalScope;

/// Scopes with higher blast radius — never auto-approved.
const HIGH_RISK_SCOPES: &[ApprovalScope] = &[
    ApprovalScope::SelfUpdate,
    ApprovalScope::CredentialUse,
    ApprovalScope::Budget,
    ApprovalScope::FullPlan,
    ApprovalScope::SkillInstall,
];

/// Volume thresholds per window (default 30 min).
const LOW_VOLUME_CEILING: usize = 10;
const MEDIUM_VOLUME_CEILING: usize = 25;

/// Decision-time trend thresholds (proportional slowdown between halves).
const MEDIUM_TREND_THRESHOLD: f64 = 0.20;
const HIGH_TREND_THRESHOLD: f64 = 0.50;

/// Assessed fatigue level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatigueLevel {
    Low,
    Medium,
    High,
}

/// Recommended flow adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Normal,
    BatchMore,
    AutoApproveLowRisk,
    PauseAndSummarize,
}

/// One resolved approval decision with timing info.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub decided_at: DateTime<Utc>,
    pub decision_time_ms: f64,
    pub scope: ApprovalScope,
}

/// Output of a fatigue analysis pass.
#[derive(Debug, Clone)]
pub struct FatigueAnalysis {
    pub fatigue_level: FatigueLevel,
    pub recommendation: Recommendation,
    pub median_decision_time_ms: f64,
    pub decisions_in_window: usize,
}

/// Analyses recent approval decisions and recommends flow adaptations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FatigueMitigator;

impl FatigueMitigator {
    /// Classify fatigue from decisions inside a rolling window.
    pub fn analyze(
        &self,
        recent_decisions: &[DecisionRecord],
        window: Duration,
    ) -> FatigueAnalysis {
        let cutoff = Utc::now() - window;
        let mut windowed: Vec<&DecisionRecord> = recent_decisions
            .iter()
            .filter(|d| d.decided_at >= cutoff)
            .collect();
        windowed.sort_by(|a, b| a.decided_at.cmp(&b.decided_at));

        let times: Vec<f64> = windowed.iter().map(|d| d.decision_time_ms).collect();
        let count = windowed.len();
        let med_time = median(&times);
        let trend = compute_trend(&times);

        let level = classify(count, trend);
        FatigueAnalysis {
            fatigue_level: level,
            recommendation: recommend(level),
            median_decision_time_ms: med_time,
            decisions_in_window: count,
        }
    }

    /// Analyze with the default 30-minute window.
    pub fn analyze_default(&self, recent_decisions: &[DecisionRecord]) -> FatigueAnalysis {
        self.analyze(recent_decisions, Duration::minutes(30))
    }

    /// High-fatigue auto-approve is only safe for low-risk scopes.
    pub fn should_auto_approve(&self, analysis: &FatigueAnalysis, scope: ApprovalScope) -> bool {
        if analysis.fatigue_level != FatigueLevel::High {
            return false;
        }
        !HIGH_RISK_SCOPES.contains(&scope)
    }
}

/// Proportional slowdown from first-half median to second-half median.
///
/// Positive values mean the human is slowing down (the classic fatigue
/// signal). Returns 0.0 without enough samples to compare.
fn compute_trend(decision_times: &[f64]) -> f64 {
    if decision_times.len() < 4 {
        return 0.0;
    }
    let mid = decision_times.len() / 2;
    let first_half = median(&decision_times[..mid]);
    let second_half = median(&decision_times[mid..]);
    if first_half <= 0.0 {
        return 0.0;
    }
    (second_half - first_half) / first_half
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid.saturating_sub(1)] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// High on extreme volume OR ballooning decision times.
fn classify(count: usize, trend: f64) -> FatigueLevel {
    if count > MEDIUM_VOLUME_CEILING || trend >= HIGH_TREND_THRESHOLD {
        return FatigueLevel::High;
    }
    if count >= LOW_VOLUME_CEILING || trend >= MEDIUM_TREND_THRESHOLD {
        return FatigueLevel::Medium;
    }
    FatigueLevel::Low
}

fn recommend(level: FatigueLevel) -> Recommendation {
    match level {
        FatigueLevel::High => Recommendation::AutoApproveLowRisk,
        FatigueLevel::Medium => Recommendation::BatchMore,
        FatigueLevel::Low => Recommendation::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seconds_ago: i64, ms: f64) -> DecisionRecord {
        DecisionRecord {
            decided_at: Utc::now() - Duration::seconds(seconds_ago),
            decision_time_ms: ms,
            scope: ApprovalScope::SingleStep,
        }
    }

    #[test]
    fn test_low_fatigue_for_few_decisions() {
        let mitigator = FatigueMitigator;
        let decisions = vec![record(60, 1000.0), record(30, 1100.0)];
        let analysis = mitigator.analyze_default(&decisions);
        assert_eq!(analysis.fatigue_level, FatigueLevel::Low);
        assert_eq!(analysis.recommendation, Recommendation::Normal);
        assert_eq!(analysis.decisions_in_window, 2);
    }

    #[test]
    fn test_medium_fatigue_from_volume() {
        let mitigator = FatigueMitigator;
        let decisions: Vec<DecisionRecord> =
            (0..12).map(|i| record(i64::from(i) * 10, 1000.0)).collect();
        let analysis = mitigator.analyze_default(&decisions);
        assert_eq!(analysis.fatigue_level, FatigueLevel::Medium);
        assert_eq!(analysis.recommendation, Recommendation::BatchMore);
    }

    #[test]
    fn test_high_fatigue_from_volume() {
        let mitigator = FatigueMitigator;
        let decisions: Vec<DecisionRecord> =
            (0..30).map(|i| record(i64::from(i) * 10, 1000.0)).collect();
        let analysis = mitigator.analyze_default(&decisions);
        assert_eq!(analysis.fatigue_level, FatigueLevel::High);
        assert_eq!(analysis.recommendation, Recommendation::AutoApproveLowRisk);
    }

    #[test]
    fn test_high_fatigue_from_slowdown_trend() {
        let mitigator = FatigueMitigator;
        // First half fast, second half ≥50% slower; oldest first.
        let decisions = vec![
            record(400, 1000.0),
            record(300, 1000.0),
            record(200, 1800.0),
            record(100, 1900.0),
        ];
        let analysis = mitigator.analyze_default(&decisions);
        assert_eq!(analysis.fatigue_level, FatigueLevel::High);
    }

    #[test]
    fn test_medium_fatigue_from_mild_slowdown() {
        let mitigator = FatigueMitigator;
        let decisions = vec![
            record(400, 1000.0),
            record(300, 1000.0),
            record(200, 1250.0),
            record(100, 1300.0),
        ];
        let analysis = mitigator.analyze_default(&decisions);
        assert_eq!(analysis.fatigue_level, FatigueLevel::Medium);
    }

    #[test]
    fn test_decisions_outside_window_ignored() {
        let mitigator = FatigueMitigator;
        let decisions: Vec<DecisionRecord> =
            (0..30).map(|_| record(7200, 1000.0)).collect();
        let analysis = mitigator.analyze_default(&decisions);
        assert_eq!(analysis.fatigue_level, FatigueLevel::Low);
        assert_eq!(analysis.decisions_in_window, 0);
    }

    #[test]
    fn test_auto_approve_requires_high_fatigue() {
        let mitigator = FatigueMitigator;
        let low = mitigator.analyze_default(&[]);
        assert!(!mitigator.should_auto_approve(&low, ApprovalScope::SingleStep));
    }

    #[test]
    fn test_auto_approve_blocked_for_high_risk_scopes() {
        let mitigator = FatigueMitigator;
        let decisions: Vec<DecisionRecord> =
            (0..30).map(|i| record(i64::from(i), 1000.0)).collect();
        let high = mitigator.analyze_default(&decisions);
        assert_eq!(high.fatigue_level, FatigueLevel::High);

        assert!(mitigator.should_auto_approve(&high, ApprovalScope::SingleStep));
        for scope in [
            ApprovalScope::SelfUpdate,
            ApprovalScope::CredentialUse,
            ApprovalScope::Budget,
            ApprovalScope::FullPlan,
            ApprovalScope::SkillInstall,
        ] {
            assert!(!mitigator.should_auto_approve(&high, scope));
        }
    }
}
