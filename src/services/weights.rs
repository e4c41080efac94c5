use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::WeightConfig;
use crate::db::Store;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    PartialWeights, RegressionAnalysisResult, RegressionMetrics, StatisticalImpactWeights,
    WeightChangeLog, WeightChangeReason, WeightKey,
};
use crate::utils::Clock;

const DEFAULT_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub normalized_weights: Option<StatisticalImpactWeights>,
}

/// Applies a regression result to a base vector: significant metrics with a
/// high R² are boosted by `1 + R²`, other significant metrics by `1 + R²/2`,
/// non-significant metrics are damped. Metrics without a matching weight and
/// weights without a matching metric are left alone.
pub fn derive_weights_from_regression(
    base: &StatisticalImpactWeights,
    analysis: &RegressionAnalysisResult,
    config: &WeightConfig,
) -> StatisticalImpactWeights {
    let mut derived = *base;
    for metric in &analysis.regression_results {
        let Ok(key) = metric.metric_name.parse::<WeightKey>() else {
            tracing::debug!("Regression metric {} has no weight; skipping", metric.metric_name);
            continue;
        };
        let factor = if !metric.is_statistically_significant {
            config.non_significant_factor
        } else if metric.r_squared >= config.high_r_squared {
            1.0 + metric.r_squared
        } else {
            1.0 + metric.r_squared / 2.0
        };
        derived.set(key, base.get(key) * factor);
    }
    derived
}

/// Checks the weight-vector invariants and, when the total drifts out of the
/// accepted band, proposes a proportionally rescaled vector.
pub fn validate_weights(weights: &StatisticalImpactWeights, config: &WeightConfig) -> WeightValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for (key, value) in weights.iter() {
        if !value.is_finite() {
            errors.push(format!("Invalid {}: must be a valid number", key));
        } else if value < 0.0 {
            errors.push(format!("Negative weight not allowed: {} = {}", key, value));
        } else if value > config.high_weight_threshold {
            warnings.push(format!("Unusually high weight: {} = {}", key, value));
        }
    }

    let total: f64 = weights.iter().map(|(_, v)| v).filter(|v| v.is_finite()).sum();
    if errors.is_empty() && total == 0.0 {
        errors.push("Total weight sum cannot be zero".to_string());
    }

    let mut normalized_weights = None;
    if errors.is_empty() {
        let lower = config.target_total * (1.0 - config.total_band);
        let upper = config.target_total * (1.0 + config.total_band);
        if total < lower || total > upper {
            normalized_weights = Some(weights.scaled(config.target_total / total));
            warnings.push(format!(
                "Weights normalized: total {:.3} scaled to {:.2}",
                total, config.target_total
            ));
        }
    }

    WeightValidation {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        normalized_weights,
    }
}

/// Stores and retrieves per-season weight vectors. Reads are fail-soft;
/// writes propagate failures.
pub struct WeightManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: WeightConfig,
}

impl WeightManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: WeightConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &WeightConfig {
        &self.config
    }

    /// Latest persisted vector for the season, or the fallback vector.
    pub async fn current_weights(&self, season: i32) -> StatisticalImpactWeights {
        match self.store.latest_weight_change(season).await {
            Ok(Some(entry)) => entry.new_weights,
            Ok(None) => StatisticalImpactWeights::fallback(),
            Err(e) => {
                tracing::warn!("Weight lookup for {} failed, using fallback weights: {}", season, e);
                StatisticalImpactWeights::fallback()
            }
        }
    }

    pub async fn update_weights_from_regression(
        &self,
        season: i32,
        analysis: &RegressionAnalysisResult,
        actor: Option<&str>,
    ) -> EngineResult<WeightChangeLog> {
        let previous = self.current_weights(season).await;
        let derived = derive_weights_from_regression(&previous, analysis, &self.config);

        let validation = self.validate_weights(&derived);
        if !validation.is_valid {
            tracing::warn!(
                "Rejected regression weights for {}: {}",
                season,
                validation.errors.join("; ")
            );
            return Err(EngineError::InvalidRegressionWeights(validation.errors));
        }

        let entry = WeightChangeLog {
            id: Uuid::new_v4().to_string(),
            season,
            timestamp: self.clock.now(),
            reason: WeightChangeReason::RegressionAnalysis,
            notes: (!validation.warnings.is_empty()).then(|| validation.warnings.join("; ")),
            previous_weights: previous,
            new_weights: validation.normalized_weights.unwrap_or(derived),
            regression_metrics: Some(RegressionMetrics {
                r_squared: analysis.overall_model_r_squared,
                sample_size: analysis.sample_size,
                significant_metrics: analysis.significant_metrics(),
            }),
            actor: actor.unwrap_or(DEFAULT_ACTOR).to_string(),
        };
        self.store.append_weight_change(&entry).await?;

        tracing::info!(
            "Updated {} weights from regression analysis {} (R² {:.3}, n={})",
            season,
            analysis.id,
            analysis.overall_model_r_squared,
            analysis.sample_size
        );
        Ok(entry)
    }

    pub async fn update_weights_manually(
        &self,
        season: i32,
        overrides: &PartialWeights,
        note: &str,
        actor: Option<&str>,
    ) -> EngineResult<WeightChangeLog> {
        let previous = self.current_weights(season).await;
        let merged = overrides.merged_onto(&previous);

        let validation = self.validate_weights(&merged);
        if !validation.is_valid {
            return Err(EngineError::InvalidManualWeights(validation.errors));
        }

        let entry = WeightChangeLog {
            id: Uuid::new_v4().to_string(),
            season,
            timestamp: self.clock.now(),
            reason: WeightChangeReason::ManualOverride(note.to_string()),
            notes: (!validation.warnings.is_empty()).then(|| validation.warnings.join("; ")),
            previous_weights: previous,
            new_weights: validation.normalized_weights.unwrap_or(merged),
            regression_metrics: None,
            actor: actor.unwrap_or(DEFAULT_ACTOR).to_string(),
        };
        self.store.append_weight_change(&entry).await?;

        tracing::info!("Manual weight override for {}: {}", season, note);
        Ok(entry)
    }

    pub async fn reset_to_fallback_weights(
        &self,
        season: i32,
        reason: &str,
        actor: Option<&str>,
    ) -> EngineResult<WeightChangeLog> {
        let entry = WeightChangeLog {
            id: Uuid::new_v4().to_string(),
            season,
            timestamp: self.clock.now(),
            reason: WeightChangeReason::FallbackReset,
            notes: Some(reason.to_string()),
            previous_weights: self.current_weights(season).await,
            new_weights: StatisticalImpactWeights::fallback(),
            regression_metrics: None,
            actor: actor.unwrap_or(DEFAULT_ACTOR).to_string(),
        };
        self.store.append_weight_change(&entry).await?;

        tracing::info!("Reset {} weights to fallback: {}", season, reason);
        Ok(entry)
    }

    pub fn validate_weights(&self, weights: &StatisticalImpactWeights) -> WeightValidation {
        validate_weights(weights, &self.config)
    }

    /// Change log for the season, newest first.
    pub async fn weight_history(&self, season: i32) -> Vec<WeightChangeLog> {
        self.store.weight_history(season).await.unwrap_or_else(|e| {
            tracing::warn!("Weight history lookup for {} failed: {}", season, e);
            Vec::new()
        })
    }

    pub async fn latest_regression_analysis(&self, season: i32) -> Option<RegressionAnalysisResult> {
        self.store
            .latest_regression_analysis(season)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Regression analysis lookup for {} failed: {}", season, e);
                None
            })
    }
}
