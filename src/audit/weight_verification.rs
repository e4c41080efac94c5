use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::audit::{percent, AuditReport, Severity, SubScores, ValidationResult, Validator};
use crate::config::{AuditConfig, WeightConfig};
use crate::db::Store;
use crate::models::{
    RegressionAnalysisResult, StatisticalImpactWeights, WeightChangeLog, WeightChangeReason, WeightKey,
};
use crate::services::{derive_weights_from_regression, validate_weights};
use crate::utils::Clock;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightVerificationReport {
    pub base: ValidationResult,
    pub stored_weights: StatisticalImpactWeights,
    /// `None` when the stored vector cannot be reproduced (manual override,
    /// or a regression entry whose analysis is no longer the latest).
    pub expected_weights: Option<StatisticalImpactWeights>,
    pub max_drift: f64,
    pub drifted: Vec<String>,
}

/// Recomputes the weight vector the manager should have stored and compares
/// it with what it did store.
pub struct WeightCalculationVerifier {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
    weights: WeightConfig,
}

impl WeightCalculationVerifier {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        config: AuditConfig,
        weights: WeightConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            weights,
        }
    }

    pub async fn evaluate(&self, season: i32) -> WeightVerificationReport {
        let now = self.clock.now();
        let history = match self.store.weight_history(season).await {
            Ok(history) => history,
            Err(e) => return unavailable(ValidationResult::unavailable(now, "weight history", e)),
        };
        let analysis = match self.store.latest_regression_analysis(season).await {
            Ok(analysis) => analysis,
            Err(e) => return unavailable(ValidationResult::unavailable(now, "regression analysis", e)),
        };
        self.verify(&history, analysis.as_ref(), ValidationResult::new(now))
    }

    /// `history` is newest first, as the store returns it.
    pub fn verify(
        &self,
        history: &[WeightChangeLog],
        analysis: Option<&RegressionAnalysisResult>,
        mut base: ValidationResult,
    ) -> WeightVerificationReport {
        let latest = history.first();
        let stored = latest
            .map(|entry| entry.new_weights)
            .unwrap_or_else(StatisticalImpactWeights::fallback);

        let stored_check = validate_weights(&stored, &self.weights);
        for error in &stored_check.errors {
            base.error("INVALID_STORED_WEIGHTS", error.clone(), Severity::High);
        }
        if stored_check.normalized_weights.is_some() {
            base.warn(format!(
                "Stored weights total {:.3}, outside the accepted band around {:.2}",
                stored.total(),
                self.weights.target_total
            ));
        }

        let expected = match latest {
            None => {
                base.warn("No weight history; fallback weights are in effect");
                if analysis.is_some() {
                    base.warn("STALE_WEIGHTS: a regression analysis exists but was never applied");
                    base.recommend("Apply the latest regression analysis with `gridcast regress --apply`");
                }
                Some(StatisticalImpactWeights::fallback())
            }
            Some(entry) => self.expected_for(entry, analysis, &mut base),
        };

        let mut drifted = Vec::new();
        let mut max_drift: f64 = 0.0;
        if let Some(expected) = &expected {
            for key in WeightKey::ALL {
                let drift = (stored.get(key) - expected.get(key)).abs();
                let drift = if drift.is_finite() { drift } else { f64::INFINITY };
                max_drift = max_drift.max(drift);
                if drift > self.config.weight_drift_tolerance {
                    drifted.push(key.to_string());
                    base.error(
                        "WEIGHT_DRIFT",
                        format!(
                            "{} stored as {:.4}, expected {:.4}",
                            key,
                            stored.get(key),
                            expected.get(key)
                        ),
                        Severity::High,
                    );
                }
            }
            if !drifted.is_empty() {
                base.recommend("Reapply the latest regression analysis to restore derived weights");
            }
        }

        // Each entry's previous vector should be the next older entry's new one.
        let links = history.len().saturating_sub(1);
        let mut continuous = 0;
        for pair in history.windows(2) {
            if pair[0].previous_weights == pair[1].new_weights {
                continuous += 1;
            } else {
                base.warn(format!(
                    "History gap: entry {} does not start from the weights set by {}",
                    pair[0].id, pair[1].id
                ));
            }
        }

        let present = usize::from(latest.is_some()) + usize::from(analysis.is_some());
        let validity = match &expected {
            Some(_) => percent(WeightKey::ALL.len() - drifted.len(), WeightKey::ALL.len()),
            None if stored_check.is_valid => 100.0,
            None => 0.0,
        };
        let is_valid = base.errors.is_empty();
        base.finish(
            SubScores {
                completeness: percent(present, 2),
                consistency: percent(continuous, links),
                validity: if stored_check.is_valid { validity } else { 0.0 },
            },
            is_valid,
        );

        WeightVerificationReport {
            base,
            stored_weights: stored,
            expected_weights: expected,
            max_drift,
            drifted,
        }
    }

    fn expected_for(
        &self,
        entry: &WeightChangeLog,
        analysis: Option<&RegressionAnalysisResult>,
        base: &mut ValidationResult,
    ) -> Option<StatisticalImpactWeights> {
        let newer_analysis = analysis.filter(|a| a.created_at > entry.timestamp);

        match &entry.reason {
            WeightChangeReason::FallbackReset => {
                if newer_analysis.is_some() {
                    stale(base);
                }
                Some(StatisticalImpactWeights::fallback())
            }
            WeightChangeReason::ManualOverride(note) => {
                base.warn(format!(
                    "Manual override in effect ({}); weights cannot be recomputed",
                    note
                ));
                if newer_analysis.is_some() {
                    stale(base);
                }
                None
            }
            WeightChangeReason::RegressionAnalysis => {
                let Some(analysis) = analysis.filter(|a| applied(entry, a)) else {
                    base.warn(format!(
                        "Weight entry {} was derived from an analysis that is no longer the latest",
                        entry.id
                    ));
                    stale(base);
                    return None;
                };
                let derived = derive_weights_from_regression(&entry.previous_weights, analysis, &self.weights);
                let check = validate_weights(&derived, &self.weights);
                Some(check.normalized_weights.unwrap_or(derived))
            }
        }
    }
}

fn applied(entry: &WeightChangeLog, analysis: &RegressionAnalysisResult) -> bool {
    entry.regression_metrics.as_ref().is_some_and(|m| {
        m.sample_size == analysis.sample_size
            && (m.r_squared - analysis.overall_model_r_squared).abs() < 1e-9
            && entry.timestamp >= analysis.created_at
    })
}

fn stale(base: &mut ValidationResult) {
    base.warn("STALE_WEIGHTS: a newer regression analysis has not been applied");
    base.recommend("Apply the latest regression analysis with `gridcast regress --apply`");
}

fn unavailable(base: ValidationResult) -> WeightVerificationReport {
    WeightVerificationReport {
        base,
        stored_weights: StatisticalImpactWeights::fallback(),
        expected_weights: None,
        max_drift: 0.0,
        drifted: Vec::new(),
    }
}

#[async_trait]
impl Validator for WeightCalculationVerifier {
    fn name(&self) -> &'static str {
        "weight-verification"
    }

    async fn validate(&self, season: i32) -> AuditReport {
        AuditReport::WeightVerification(self.evaluate(season).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::DATA_UNAVAILABLE;
    use crate::db::MemoryStore;
    use crate::models::{ConfidenceInterval, MetricRegression, PartialWeights};
    use crate::services::WeightManager;
    use crate::utils::FixedClock;
    use chrono::{Duration, TimeZone, Utc};

    fn analysis() -> RegressionAnalysisResult {
        let metric = |name: &str, r_squared: f64, p_value: f64| MetricRegression {
            metric_name: name.to_string(),
            coefficient: 1.0,
            r_squared,
            p_value,
            confidence_interval: ConfidenceInterval { lower: 0.5, upper: 1.5 },
            calculated_weight: 0.3,
            is_statistically_significant: p_value < 0.05,
        };
        RegressionAnalysisResult {
            id: "ra-1".to_string(),
            season: 2024,
            overall_model_r_squared: 0.55,
            sample_size: 66,
            predictive_accuracy: 0.7,
            regression_results: vec![
                metric("scoringEfficiency", 0.4, 0.001),
                metric("rushingOffense", 0.1, 0.02),
                metric("specialTeams", 0.01, 0.5),
            ],
            created_at: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap(),
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<FixedClock>, WeightManager, WeightCalculationVerifier) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 11, 2, 0, 0, 0).unwrap()));
        let manager = WeightManager::new(store.clone(), clock.clone(), WeightConfig::default());
        let verifier = WeightCalculationVerifier::new(
            store.clone(),
            clock.clone(),
            AuditConfig::default(),
            WeightConfig::default(),
        );
        (store, clock, manager, verifier)
    }

    #[tokio::test]
    async fn test_regression_weights_verify() {
        let (store, _, manager, verifier) = setup();
        let analysis = analysis();
        store.insert_regression_analysis(&analysis).await.unwrap();
        manager.update_weights_from_regression(2024, &analysis, None).await.unwrap();

        let report = verifier.evaluate(2024).await;
        assert!(report.base.is_valid, "{:?}", report.base.errors);
        assert!(report.drifted.is_empty());
        assert!(report.max_drift < 1e-12);
        assert!(report.expected_weights.is_some());
    }

    #[tokio::test]
    async fn test_tampered_weights_drift() {
        let (store, _, manager, verifier) = setup();
        let analysis = analysis();
        store.insert_regression_analysis(&analysis).await.unwrap();
        let mut entry = manager.update_weights_from_regression(2024, &analysis, None).await.unwrap();
        entry.new_weights.scoring_efficiency += 0.05;

        let report = verifier.verify(&[entry], Some(&analysis), ValidationResult::new(Utc::now()));
        assert!(!report.base.is_valid);
        assert!(report.base.has_code("WEIGHT_DRIFT"));
        assert_eq!(report.drifted, vec!["scoringEfficiency"]);
        assert!((report.max_drift - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_history_expects_fallback() {
        let (store, _, _, verifier) = setup();
        store.insert_regression_analysis(&analysis()).await.unwrap();

        let report = verifier.evaluate(2024).await;
        assert!(report.base.is_valid);
        assert_eq!(report.stored_weights, StatisticalImpactWeights::fallback());
        assert!(report.base.warnings.iter().any(|w| w.starts_with("STALE_WEIGHTS")));
    }

    #[tokio::test]
    async fn test_manual_override_is_not_recomputed() {
        let (store, clock, manager, verifier) = setup();
        manager
            .update_weights_manually(
                2024,
                &PartialWeights::default().with(WeightKey::SpecialTeams, 0.15),
                "kicker injury",
                Some("analyst"),
            )
            .await
            .unwrap();
        clock.advance(Duration::days(1));
        let mut newer = analysis();
        newer.created_at = clock.now();
        store.insert_regression_analysis(&newer).await.unwrap();

        let report = verifier.evaluate(2024).await;
        assert!(report.base.is_valid);
        assert!(report.expected_weights.is_none());
        assert!(report.base.warnings.iter().any(|w| w.starts_with("Manual override")));
        assert!(report.base.warnings.iter().any(|w| w.starts_with("STALE_WEIGHTS")));
    }

    #[tokio::test]
    async fn test_history_gap_lowers_consistency() {
        let (_, _, manager, verifier) = setup();
        let first = manager.reset_to_fallback_weights(2024, "season start", None).await.unwrap();
        let mut second = manager
            .update_weights_manually(
                2024,
                &PartialWeights::default().with(WeightKey::PassingOffense, 0.3),
                "tweak",
                None,
            )
            .await
            .unwrap();
        second.previous_weights.passing_offense = 9.0;

        let report = verifier.verify(&[second, first], None, ValidationResult::new(Utc::now()));
        assert!(report.base.warnings.iter().any(|w| w.starts_with("History gap")));
        assert!(report.base.score < 100.0);
    }

    #[tokio::test]
    async fn test_unreadable_history() {
        let (store, _, _, verifier) = setup();
        store.set_fail_reads(true);
        let report = verifier.evaluate(2024).await;
        assert!(report.base.has_code(DATA_UNAVAILABLE));
        assert!(!report.base.is_valid);
    }
}
