use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::audit::{percent, AuditReport, Severity, SubScores, ValidationResult, Validator};
use crate::config::{AuditConfig, WeightConfig};
use crate::db::Store;
use crate::models::RegressionAnalysisResult;
use crate::utils::Clock;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionAuditReport {
    pub base: ValidationResult,
    pub analysis_id: Option<String>,
    pub sample_size: u32,
    pub overall_r_squared: Option<f64>,
    pub significant_metrics: Vec<String>,
    /// Metrics with at least one failed internal check.
    pub flagged_metrics: Vec<String>,
}

/// Re-checks the latest published regression result for internal
/// consistency.
pub struct RegressionAnalysisAuditor {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
    weights: WeightConfig,
}

impl RegressionAnalysisAuditor {
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

    pub async fn evaluate(&self, season: i32) -> RegressionAuditReport {
        let now = self.clock.now();
        match self.store.latest_regression_analysis(season).await {
            Ok(Some(analysis)) => self.audit(&analysis, ValidationResult::new(now)),
            Ok(None) => {
                let mut base = ValidationResult::new(now);
                base.error(
                    "NO_REGRESSION_ANALYSIS",
                    format!("No regression analysis published for {}", season),
                    Severity::Medium,
                );
                base.recommend("Run `gridcast regress` once profiles are calculated");
                base.finish(
                    SubScores {
                        completeness: 0.0,
                        consistency: 100.0,
                        validity: 0.0,
                    },
                    false,
                );
                empty_report(base)
            }
            Err(e) => empty_report(ValidationResult::unavailable(now, "regression analysis", e)),
        }
    }

    /// Pure consistency audit of one analysis.
    pub fn audit(
        &self,
        analysis: &RegressionAnalysisResult,
        mut base: ValidationResult,
    ) -> RegressionAuditReport {
        let metrics = &analysis.regression_results;
        let fair_share = if metrics.is_empty() {
            0.0
        } else {
            self.weights.target_total / metrics.len() as f64
        };

        let mut flagged = Vec::new();
        let mut checks = 0usize;
        let mut failures = 0usize;

        for metric in metrics {
            let name = &metric.metric_name;
            let mut problems = Vec::new();

            checks += 4;
            if !metric.r_squared.is_finite() || !(0.0..=1.0).contains(&metric.r_squared) {
                problems.push(("INVALID_R_SQUARED", format!("{} R² {} outside [0, 1]", name, metric.r_squared)));
            }
            if !metric.p_value.is_finite() || !(0.0..=1.0).contains(&metric.p_value) {
                problems.push(("INVALID_P_VALUE", format!("{} p-value {} outside [0, 1]", name, metric.p_value)));
            }
            if !metric.confidence_interval.contains(metric.coefficient) {
                problems.push((
                    "INTERVAL_EXCLUDES_COEFFICIENT",
                    format!(
                        "{} coefficient {:.4} outside its interval [{:.4}, {:.4}]",
                        name,
                        metric.coefficient,
                        metric.confidence_interval.lower,
                        metric.confidence_interval.upper
                    ),
                ));
            }
            let expected_significant = metric.p_value < self.weights.significance_level;
            if metric.is_statistically_significant != expected_significant {
                problems.push((
                    "SIGNIFICANCE_MISMATCH",
                    format!(
                        "{} flagged {} but p = {:.4}",
                        name,
                        if metric.is_statistically_significant { "significant" } else { "not significant" },
                        metric.p_value
                    ),
                ));
            }

            let excludes_zero = !metric.confidence_interval.contains(0.0);
            if excludes_zero != metric.is_statistically_significant && metric.confidence_interval.width() > 0.0 {
                base.warn(format!(
                    "{} interval and significance flag disagree about a zero effect",
                    name
                ));
            }
            if !metric.is_statistically_significant && fair_share > 0.0 && metric.calculated_weight > fair_share {
                base.warn(format!(
                    "Non-significant metric {} retained with disproportionate weight {:.3} (fair share {:.3})",
                    name, metric.calculated_weight, fair_share
                ));
                base.recommend(format!("Consider dropping {} from the weight derivation", name));
            }

            failures += problems.len();
            if !problems.is_empty() {
                flagged.push(name.clone());
            }
            for (code, message) in problems {
                base.error(code, message, Severity::Medium);
            }
        }

        checks += 3;
        let overall = analysis.overall_model_r_squared;
        if !overall.is_finite() || !(0.0..=1.0).contains(&overall) {
            failures += 1;
            base.error("INVALID_R_SQUARED", format!("Overall R² {} outside [0, 1]", overall), Severity::High);
        } else if overall > self.config.suspicious_r_squared {
            failures += 1;
            base.error(
                "SUSPICIOUS_R_SQUARED",
                format!("Overall R² {:.4} is implausibly high; check for target leakage", overall),
                Severity::High,
            );
            base.recommend("Verify that regression inputs exclude the outcomes being explained");
        }
        let best_single = metrics
            .iter()
            .map(|m| m.r_squared)
            .filter(|r| r.is_finite())
            .fold(0.0, f64::max);
        if overall.is_finite() && overall + 1e-9 < best_single {
            failures += 1;
            base.error(
                "R_SQUARED_INCONSISTENT",
                format!(
                    "Overall R² {:.4} is below the best single-metric R² {:.4}",
                    overall, best_single
                ),
                Severity::High,
            );
        }
        if !(0.0..=1.0).contains(&analysis.predictive_accuracy) {
            failures += 1;
            base.error(
                "INVALID_ACCURACY",
                format!("Predictive accuracy {} outside [0, 1]", analysis.predictive_accuracy),
                Severity::Medium,
            );
        }

        let min_sample = self.config.min_regression_sample as u32;
        if analysis.sample_size < min_sample {
            base.warn(format!(
                "Sample of {} games is below the recommended {}",
                analysis.sample_size, min_sample
            ));
            base.recommend("Rerun the regression later in the season");
        }
        if metrics.is_empty() {
            base.error("NO_METRICS", "Regression analysis has no metric rows", Severity::High);
        }

        let completeness = if min_sample == 0 {
            100.0
        } else {
            (100.0 * analysis.sample_size as f64 / min_sample as f64).min(100.0)
        };
        let is_valid = base.errors.is_empty();
        base.finish(
            SubScores {
                completeness,
                consistency: percent(checks - failures, checks),
                validity: if is_valid { 100.0 } else { 0.0 },
            },
            is_valid,
        );

        RegressionAuditReport {
            base,
            analysis_id: Some(analysis.id.clone()),
            sample_size: analysis.sample_size,
            overall_r_squared: Some(overall),
            significant_metrics: analysis.significant_metrics(),
            flagged_metrics: flagged,
        }
    }
}

fn empty_report(base: ValidationResult) -> RegressionAuditReport {
    RegressionAuditReport {
        base,
        analysis_id: None,
        sample_size: 0,
        overall_r_squared: None,
        significant_metrics: Vec::new(),
        flagged_metrics: Vec::new(),
    }
}

#[async_trait]
impl Validator for RegressionAnalysisAuditor {
    fn name(&self) -> &'static str {
        "regression-audit"
    }

    async fn validate(&self, season: i32) -> AuditReport {
        AuditReport::RegressionAudit(self.evaluate(season).await)
    }
}
