//! Read-only validators that grade every stage of the prediction pipeline.
//!
//! Each validator returns an [`AuditReport`] variant sharing the
//! [`ValidationResult`] base. Validators never fail: storage problems are
//! reported as `DATA_UNAVAILABLE` errors inside the result.

pub mod accuracy;
pub mod data_pipeline;
pub mod regression_audit;
pub mod sample_games;
pub mod weight_verification;

pub use accuracy::*;
pub use data_pipeline::*;
pub use regression_audit::*;
pub use sample_games::*;
pub use weight_verification::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Store;
use crate::services::PredictionEngine;
use crate::utils::Clock;

pub const DATA_UNAVAILABLE: &str = "DATA_UNAVAILABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

/// Completeness, consistency and validity, each on a 0-100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubScores {
    pub completeness: f64,
    pub consistency: f64,
    pub validity: f64,
}

impl SubScores {
    pub fn blended(&self) -> f64 {
        let score = 0.4 * self.completeness + 0.3 * self.consistency + 0.3 * self.validity;
        if score.is_finite() {
            score.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Percentage of `part` in `whole`; 100 when there is nothing to measure.
pub(crate) fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        100.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub score: f64,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            is_valid: true,
            score: 100.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            recommendations: Vec::new(),
            timestamp,
        }
    }

    /// Result for a validator that could not read its inputs.
    pub fn unavailable(timestamp: DateTime<Utc>, what: &str, cause: impl std::fmt::Display) -> Self {
        let mut result = Self::new(timestamp);
        result.error(
            DATA_UNAVAILABLE,
            format!("Could not load {}: {}", what, cause),
            Severity::Critical,
        );
        result.recommend("Check database connectivity and rerun the audit");
        result.is_valid = false;
        result.score = 0.0;
        result
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>, severity: Severity) {
        self.errors.push(ValidationIssue {
            code: code.to_string(),
            message: message.into(),
            severity,
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn recommend(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.recommendations.contains(&message) {
            self.recommendations.push(message);
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    pub fn finish(&mut self, scores: SubScores, is_valid: bool) {
        self.score = scores.blended();
        self.is_valid = is_valid;
    }
}

/// Combines base results: valid only if all are, mean score, issues
/// concatenated in order, latest timestamp.
pub fn merge_validation_results<'a>(
    results: impl IntoIterator<Item = &'a ValidationResult>,
) -> Option<ValidationResult> {
    let mut iter = results.into_iter();
    let mut merged = iter.next()?.clone();
    let mut count = 1.0;
    let mut score_sum = merged.score;

    for result in iter {
        merged.is_valid &= result.is_valid;
        score_sum += result.score;
        count += 1.0;
        merged.errors.extend(result.errors.iter().cloned());
        merged.warnings.extend(result.warnings.iter().cloned());
        for recommendation in &result.recommendations {
            merged.recommend(recommendation.clone());
        }
        merged.timestamp = merged.timestamp.max(result.timestamp);
    }
    merged.score = score_sum / count;
    Some(merged)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "validator", rename_all = "camelCase")]
pub enum AuditReport {
    DataPipeline(DataPipelineReport),
    RegressionAudit(RegressionAuditReport),
    WeightVerification(WeightVerificationReport),
    PredictionAccuracy(AccuracyReport),
    SampleGames(SampleGameReport),
}

impl AuditReport {
    pub fn base(&self) -> &ValidationResult {
        match self {
            AuditReport::DataPipeline(r) => &r.base,
            AuditReport::RegressionAudit(r) => &r.base,
            AuditReport::WeightVerification(r) => &r.base,
            AuditReport::PredictionAccuracy(r) => &r.base,
            AuditReport::SampleGames(r) => &r.base,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuditReport::DataPipeline(_) => "data-pipeline",
            AuditReport::RegressionAudit(_) => "regression-audit",
            AuditReport::WeightVerification(_) => "weight-verification",
            AuditReport::PredictionAccuracy(_) => "prediction-accuracy",
            AuditReport::SampleGames(_) => "sample-games",
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn validate(&self, season: i32) -> AuditReport;
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub season: i32,
    pub overall: ValidationResult,
    pub reports: Vec<AuditReport>,
}

/// All five validators over one store.
pub struct AuditSuite {
    data_pipeline: DataPipelineValidator,
    regression: RegressionAnalysisAuditor,
    weights: WeightCalculationVerifier,
    accuracy: Arc<PredictionAccuracyTester>,
    samples: SampleGameAnalyzer,
    clock: Arc<dyn Clock>,
}

impl AuditSuite {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let engine = Arc::new(PredictionEngine::new(store.clone(), clock.clone(), config.clone()));
        let accuracy = Arc::new(PredictionAccuracyTester::new(
            engine,
            clock.clone(),
            config.audit.clone(),
        ));
        Self {
            data_pipeline: DataPipelineValidator::new(store.clone(), clock.clone(), config.audit.clone()),
            regression: RegressionAnalysisAuditor::new(
                store.clone(),
                clock.clone(),
                config.audit.clone(),
                config.weights.clone(),
            ),
            weights: WeightCalculationVerifier::new(
                store,
                clock.clone(),
                config.audit.clone(),
                config.weights,
            ),
            samples: SampleGameAnalyzer::new(accuracy.clone(), clock.clone(), config.audit),
            accuracy,
            clock,
        }
    }

    /// Runs every validator concurrently.
    pub async fn run(&self, season: i32) -> SuiteReport {
        tracing::info!("Running audit suite for {}", season);
        let (pipeline, regression, weights, accuracy, samples) = tokio::join!(
            self.data_pipeline.validate(season),
            self.regression.validate(season),
            self.weights.validate(season),
            self.accuracy.validate(season),
            self.samples.validate(season),
        );
        let reports = vec![pipeline, regression, weights, accuracy, samples];

        for report in &reports {
            let base = report.base();
            tracing::info!(
                "{}: score {:.1}, {} errors, {} warnings",
                report.name(),
                base.score,
                base.errors.len(),
                base.warnings.len()
            );
        }

        let overall = merge_validation_results(reports.iter().map(|r| r.base()))
            .unwrap_or_else(|| ValidationResult::new(self.clock.now()));
        SuiteReport {
            season,
            overall,
            reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_blended_score_weights() {
        let scores = SubScores {
            completeness: 100.0,
            consistency: 50.0,
            validity: 0.0,
        };
        assert!((scores.blended() - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_validation_results() {
        let mut a = ValidationResult::new(at(1));
        a.score = 90.0;
        a.warn("thin sample");
        a.recommend("collect more games");

        let mut b = ValidationResult::new(at(3));
        b.error("YARDAGE_MISMATCH", "totals disagree", Severity::Medium);
        b.recommend("collect more games");
        b.finish(
            SubScores {
                completeness: 60.0,
                consistency: 60.0,
                validity: 60.0,
            },
            false,
        );

        let merged = merge_validation_results([&a, &b]).unwrap();
        assert!(!merged.is_valid);
        assert!((merged.score - 75.0).abs() < 1e-9);
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.warnings, vec!["thin sample".to_string()]);
        assert_eq!(merged.recommendations.len(), 1);
        assert_eq!(merged.timestamp, at(3));

        assert!(merge_validation_results(std::iter::empty()).is_none());
    }

    #[test]
    fn test_unavailable_result() {
        let result = ValidationResult::unavailable(at(0), "season games", "connection refused");
        assert!(!result.is_valid);
        assert_eq!(result.score, 0.0);
        assert!(result.has_code(DATA_UNAVAILABLE));
        assert_eq!(result.errors[0].severity, Severity::Critical);
    }
}
