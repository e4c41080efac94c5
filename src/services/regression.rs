use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::WeightConfig;
use crate::db::Store;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ConfidenceInterval, MetricRegression, RegressionAnalysisResult, TeamEfficiencyProfile,
    WeightKey,
};
use crate::utils::Clock;

pub const MIN_REGRESSION_GAMES: usize = 10;

/// Metrics regressed against the final margin. Home field is not a
/// per-team signal and keeps its weight.
pub const REGRESSED_METRICS: [WeightKey; 7] = [
    WeightKey::PassingOffense,
    WeightKey::RushingOffense,
    WeightKey::ScoringEfficiency,
    WeightKey::PassingDefense,
    WeightKey::RushingDefense,
    WeightKey::TurnoverMargin,
    WeightKey::SpecialTeams,
];

/// One finished game seen through the two teams' season profiles.
#[derive(Debug, Clone)]
pub struct MatchupSample {
    pub game_id: String,
    /// Home-minus-away signal per `REGRESSED_METRICS` entry.
    pub features: [f64; 7],
    pub margin: f64,
}

fn metric_signal(profile: &TeamEfficiencyProfile, key: WeightKey) -> f64 {
    match key {
        WeightKey::PassingOffense => profile.offensive.passing_yards,
        WeightKey::RushingOffense => profile.offensive.rushing_yards,
        WeightKey::ScoringEfficiency => profile.offensive.scoring,
        WeightKey::PassingDefense => profile.defensive.passing_yards,
        WeightKey::RushingDefense => profile.defensive.rushing_yards,
        WeightKey::TurnoverMargin => profile.defensive.interceptions - profile.offensive.interceptions,
        WeightKey::SpecialTeams => profile.offensive.field_goals,
        WeightKey::HomeFieldAdvantage => 0.0,
    }
}

pub fn matchup_features(home: &TeamEfficiencyProfile, away: &TeamEfficiencyProfile) -> [f64; 7] {
    let mut features = [0.0; 7];
    for (slot, key) in REGRESSED_METRICS.iter().enumerate() {
        features[slot] = metric_signal(home, *key) - metric_signal(away, *key);
    }
    features
}

struct SimpleFit {
    coefficient: f64,
    r_squared: f64,
    p_value: f64,
    interval: ConfidenceInterval,
}

fn simple_regression(x: &[f64], y: &[f64], t_dist: &StudentsT) -> SimpleFit {
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|v| (v - x_mean).powi(2)).sum();
    let syy: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - x_mean) * (b - y_mean)).sum();

    if sxx <= f64::EPSILON || syy <= f64::EPSILON {
        return SimpleFit {
            coefficient: 0.0,
            r_squared: 0.0,
            p_value: 1.0,
            interval: ConfidenceInterval { lower: 0.0, upper: 0.0 },
        };
    }

    let coefficient = sxy / sxx;
    let r_squared = (sxy * sxy / (sxx * syy)).clamp(0.0, 1.0);
    let sse = (syy - coefficient * sxy).max(0.0);
    let standard_error = (sse / (n - 2.0) / sxx).sqrt();
    let t_critical = t_dist.inverse_cdf(0.975);

    let p_value = if standard_error > 0.0 {
        let t = coefficient / standard_error;
        (2.0 * (1.0 - t_dist.cdf(t.abs()))).clamp(0.0, 1.0)
    } else {
        0.0
    };

    SimpleFit {
        coefficient,
        r_squared,
        p_value,
        interval: ConfidenceInterval {
            lower: coefficient - t_critical * standard_error,
            upper: coefficient + t_critical * standard_error,
        },
    }
}

/// Calibrates metric importance from how well each profile signal explains
/// game margins over a season.
pub struct RegressionAnalyzer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: WeightConfig,
}

impl RegressionAnalyzer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: WeightConfig) -> Self {
        Self { store, clock, config }
    }

    /// Pairs every finished game with both teams' stored profiles.
    pub async fn season_samples(&self, season: i32) -> EngineResult<Vec<MatchupSample>> {
        let profiles: HashMap<String, TeamEfficiencyProfile> = self
            .store
            .season_profiles(season)
            .await?
            .into_iter()
            .map(|p| (p.team_id.clone(), p))
            .collect();
        let games = self.store.season_games(season).await?;

        let samples = games
            .iter()
            .filter(|g| g.is_finished())
            .filter_map(|game| {
                let home = profiles.get(&game.home_team_id)?;
                let away = profiles.get(&game.away_team_id)?;
                let (scored, allowed) = game.score_for(&game.home_team_id)?;
                Some(MatchupSample {
                    game_id: game.id.clone(),
                    features: matchup_features(home, away),
                    margin: (scored - allowed) as f64,
                })
            })
            .collect();
        Ok(samples)
    }

    pub fn analyze_samples(
        &self,
        season: i32,
        samples: &[MatchupSample],
    ) -> EngineResult<RegressionAnalysisResult> {
        if samples.len() < MIN_REGRESSION_GAMES {
            return Err(EngineError::InsufficientData(format!(
                "regression needs at least {} games with profiles, found {}",
                MIN_REGRESSION_GAMES,
                samples.len()
            )));
        }
        if samples
            .iter()
            .any(|s| !s.margin.is_finite() || s.features.iter().any(|f| !f.is_finite()))
        {
            return Err(EngineError::InvalidInput(
                "regression samples contain non-finite values".to_string(),
            ));
        }

        let n = samples.len();
        let margins: Vec<f64> = samples.iter().map(|s| s.margin).collect();
        let t_dist = StudentsT::new(0.0, 1.0, (n - 2) as f64)
            .map_err(|e| EngineError::InvalidInput(format!("t distribution: {}", e)))?;

        let mut regression_results = Vec::with_capacity(REGRESSED_METRICS.len());
        for (slot, key) in REGRESSED_METRICS.iter().enumerate() {
            let xs: Vec<f64> = samples.iter().map(|s| s.features[slot]).collect();
            let fit = simple_regression(&xs, &margins, &t_dist);
            regression_results.push(MetricRegression {
                metric_name: key.as_str().to_string(),
                coefficient: fit.coefficient,
                r_squared: fit.r_squared,
                p_value: fit.p_value,
                confidence_interval: fit.interval,
                calculated_weight: 0.0,
                is_statistically_significant: fit.p_value < self.config.significance_level,
            });
        }

        let explained: f64 = regression_results.iter().map(|m| m.r_squared).sum();
        if explained > 0.0 {
            for metric in &mut regression_results {
                metric.calculated_weight = self.config.target_total * metric.r_squared / explained;
            }
        }

        let (overall_model_r_squared, predictive_accuracy) = multiple_regression(samples)?;

        let result = RegressionAnalysisResult {
            id: Uuid::new_v4().to_string(),
            season,
            overall_model_r_squared,
            sample_size: n as u32,
            predictive_accuracy,
            regression_results,
            created_at: self.clock.now(),
        };
        tracing::info!(
            "Regression for {}: R² {:.3} over {} games, {} significant metrics",
            season,
            result.overall_model_r_squared,
            result.sample_size,
            result.significant_metrics().len()
        );
        Ok(result)
    }

    pub async fn analyze_season(&self, season: i32) -> EngineResult<RegressionAnalysisResult> {
        let samples = self.season_samples(season).await?;
        self.analyze_samples(season, &samples)
    }

    /// Analyzes the season and appends the result to storage.
    pub async fn run(&self, season: i32) -> EngineResult<RegressionAnalysisResult> {
        let result = self.analyze_season(season).await?;
        self.store.insert_regression_analysis(&result).await?;
        Ok(result)
    }
}

/// R² of the joint least-squares fit with an intercept, and the share of
/// games whose fitted margin has the right sign.
fn multiple_regression(samples: &[MatchupSample]) -> EngineResult<(f64, f64)> {
    let n = samples.len();
    let k = REGRESSED_METRICS.len();
    let x = DMatrix::from_fn(n, k + 1, |i, j| if j == 0 { 1.0 } else { samples[i].features[j - 1] });
    let y = DVector::from_iterator(n, samples.iter().map(|s| s.margin));

    let beta = x
        .clone()
        .svd(true, true)
        .solve(&y, 1e-10)
        .map_err(|e| EngineError::InvalidInput(format!("least squares failed: {}", e)))?;
    let fitted = &x * beta;

    let y_mean = y.mean();
    let sst: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let sse: f64 = y.iter().zip(fitted.iter()).map(|(a, b)| (a - b).powi(2)).sum();
    let r_squared = if sst > 0.0 { (1.0 - sse / sst).clamp(0.0, 1.0) } else { 0.0 };

    let correct = y
        .iter()
        .zip(fitted.iter())
        .filter(|(actual, predicted)| actual.signum() == predicted.signum())
        .count();
    Ok((r_squared, correct as f64 / n as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::utils::SystemClock;

    fn analyzer() -> RegressionAnalyzer {
        RegressionAnalyzer::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            WeightConfig::default(),
        )
    }

    fn noise(i: usize, salt: f64) -> f64 {
        ((i as f64 + salt) * 12.9898).sin() * 0.5
    }

    /// Margins driven by the scoring signal; the other signals are noise.
    fn samples(n: usize) -> Vec<MatchupSample> {
        (0..n)
            .map(|i| {
                let scoring = (i as f64 - n as f64 / 2.0) * 1.5;
                let mut features = [0.0; 7];
                for (slot, f) in features.iter_mut().enumerate() {
                    *f = noise(i, slot as f64 * 7.0) * 40.0;
                }
                features[2] = scoring;
                MatchupSample {
                    game_id: format!("g{}", i),
                    features,
                    margin: 2.0 * scoring + 3.0 * noise(i, 99.0),
                }
            })
            .collect()
    }

    #[test]
    fn test_driving_metric_is_significant() {
        let result = analyzer().analyze_samples(2024, &samples(40)).unwrap();
        let scoring = result
            .regression_results
            .iter()
            .find(|m| m.metric_name == "scoringEfficiency")
            .unwrap();
        assert!(scoring.is_statistically_significant);
        assert!(scoring.r_squared > 0.9);
        assert!(scoring.confidence_interval.contains(scoring.coefficient));
        assert!((scoring.coefficient - 2.0).abs() < 0.1);
        assert!(result.overall_model_r_squared >= scoring.r_squared - 1e-9);
        assert!(result.predictive_accuracy > 0.9);
        assert_eq!(result.sample_size, 40);
    }

    #[test]
    fn test_calculated_weights_share_the_target_total() {
        let result = analyzer().analyze_samples(2024, &samples(30)).unwrap();
        let total: f64 = result.regression_results.iter().map(|m| m.calculated_weight).sum();
        assert!((total - 1.80).abs() < 1e-9);
        assert_eq!(result.regression_results.len(), REGRESSED_METRICS.len());
    }

    #[test]
    fn test_too_few_games_is_insufficient_data() {
        let err = analyzer().analyze_samples(2024, &samples(9)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData(_)));
    }

    #[test]
    fn test_constant_signal_is_not_significant() {
        let mut data = samples(20);
        for sample in &mut data {
            sample.features[6] = 1.0;
        }
        let result = analyzer().analyze_samples(2024, &data).unwrap();
        let special = &result.regression_results[6];
        assert_eq!(special.r_squared, 0.0);
        assert_eq!(special.p_value, 1.0);
        assert!(!special.is_statistically_significant);
    }

    #[tokio::test]
    async fn test_season_without_profiles_is_insufficient() {
        let err = analyzer().analyze_season(2024).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData(_)));
    }
}
