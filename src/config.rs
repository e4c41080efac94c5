use std::env;
use std::str::FromStr;

use crate::models::StatLine;

/// Knobs for profile construction. The tier cutoffs and the blend ratio were
/// fitted to observed behaviour rather than derived, so they stay overridable.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Fewer games than this is a Low confidence profile.
    pub low_confidence_max_games: u32,
    /// At least this many games is a High confidence profile.
    pub high_confidence_min_games: u32,
    /// Share of the current season when blending with the prior season.
    pub current_season_blend: f64,
    pub convergence_tolerance: f64,
    pub max_iterations: usize,
    /// Huber threshold in robust standard deviations.
    pub outlier_threshold: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            low_confidence_max_games: 4,
            high_confidence_min_games: 9,
            current_season_blend: 0.85,
            convergence_tolerance: 1e-6,
            max_iterations: 50,
            outlier_threshold: 2.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeightConfig {
    /// Sum every normalized weight vector is scaled to. Matches the fallback vector.
    pub target_total: f64,
    /// Accepted relative distance from `target_total` before normalizing.
    pub total_band: f64,
    pub high_weight_threshold: f64,
    pub significance_level: f64,
    pub high_r_squared: f64,
    pub non_significant_factor: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            target_total: 1.80,
            total_band: 0.25,
            high_weight_threshold: 2.0,
            significance_level: 0.05,
            high_r_squared: 0.30,
            non_significant_factor: 0.8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Per-game value expected against an average opponent.
    pub league_averages: StatLine,
    pub home_field_points: f64,
    /// Share of the final score taken from the scoring category.
    pub scoring_blend: f64,
    pub score_std_dev: f64,
    pub margin_std_dev: f64,
    pub interval_level: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            league_averages: StatLine {
                total_yards: 400.0,
                passing_yards: 240.0,
                rushing_yards: 160.0,
                scoring: 28.0,
                interceptions: 0.8,
                sacks: 2.2,
                field_goals: 1.4,
            },
            home_field_points: 2.5,
            scoring_blend: 0.7,
            score_std_dev: 10.0,
            margin_std_dev: 14.0,
            interval_level: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_score: f64,
    pub max_differential: f64,
    pub max_std_deviations: f64,
    pub min_score_ratio: f64,
    pub min_score_floor: f64,
    pub lower_bound_ratio: f64,
    pub upper_bound_ratio: f64,
    pub upper_bound_cap: f64,
    pub default_min_score: f64,
    pub default_max_score: f64,
    pub correction_trigger_differential: f64,
    pub corrected_differential: f64,
    pub default_home_average: f64,
    pub default_away_average: f64,
    pub home_field_bonus: f64,
    pub league_average_points: f64,
    pub opponent_defense_factor: f64,
    pub fallback_confidence: f64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_score: 200.0,
            max_differential: 100.0,
            max_std_deviations: 4.0,
            min_score_ratio: 0.3,
            min_score_floor: 3.0,
            lower_bound_ratio: 0.4,
            upper_bound_ratio: 2.5,
            upper_bound_cap: 80.0,
            default_min_score: 7.0,
            default_max_score: 70.0,
            correction_trigger_differential: 50.0,
            corrected_differential: 35.0,
            default_home_average: 24.0,
            default_away_average: 21.0,
            home_field_bonus: 3.0,
            league_average_points: 24.0,
            opponent_defense_factor: 0.3,
            fallback_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub pipeline_sample_size: usize,
    pub pipeline_pass_rate: f64,
    pub yardage_tolerance: f64,
    pub max_turnovers: f64,
    pub backtest_sample_size: usize,
    pub min_prior_games: usize,
    pub calibration_bins: usize,
    pub weight_drift_tolerance: f64,
    pub suspicious_r_squared: f64,
    pub min_regression_sample: usize,
    pub bias_threshold_points: f64,
    pub sample_games: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            pipeline_sample_size: 100,
            pipeline_pass_rate: 0.70,
            yardage_tolerance: 50.0,
            max_turnovers: 10.0,
            backtest_sample_size: 50,
            min_prior_games: 2,
            calibration_bins: 10,
            weight_drift_tolerance: 0.01,
            suspicious_r_squared: 0.99,
            min_regression_sample: 30,
            bias_threshold_points: 3.0,
            sample_games: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub profile: ProfileConfig,
    pub weights: WeightConfig,
    pub model: ModelConfig,
    pub limits: ValidationLimits,
    pub audit: AuditConfig,
}

impl EngineConfig {
    /// Defaults overridden by `GRIDCAST_*` environment variables. Call after
    /// `dotenv::dotenv()` so a local `.env` file is honoured.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.profile.low_confidence_max_games = env_or(
            "GRIDCAST_LOW_CONFIDENCE_GAMES",
            config.profile.low_confidence_max_games,
        );
        config.profile.high_confidence_min_games = env_or(
            "GRIDCAST_HIGH_CONFIDENCE_GAMES",
            config.profile.high_confidence_min_games,
        );
        config.profile.current_season_blend =
            env_or("GRIDCAST_SEASON_BLEND", config.profile.current_season_blend);
        config.profile.max_iterations =
            env_or("GRIDCAST_MAX_ITERATIONS", config.profile.max_iterations);
        config.weights.high_weight_threshold = env_or(
            "GRIDCAST_HIGH_WEIGHT_THRESHOLD",
            config.weights.high_weight_threshold,
        );
        config.audit.backtest_sample_size =
            env_or("GRIDCAST_BACKTEST_SAMPLE", config.audit.backtest_sample_size);
        config.audit.calibration_bins =
            env_or("GRIDCAST_CALIBRATION_BINS", config.audit.calibration_bins);

        if config.profile.high_confidence_min_games < config.profile.low_confidence_max_games {
            tracing::warn!(
                "GRIDCAST_HIGH_CONFIDENCE_GAMES ({}) is below the low cutoff ({}); using the low cutoff",
                config.profile.high_confidence_min_games,
                config.profile.low_confidence_max_games
            );
            config.profile.high_confidence_min_games = config.profile.low_confidence_max_games;
        }
        config.profile.current_season_blend = config.profile.current_season_blend.clamp(0.0, 1.0);
        config.audit.calibration_bins = config.audit.calibration_bins.max(1);

        config
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tier_cutoffs() {
        let config = EngineConfig::default();
        assert_eq!(config.profile.low_confidence_max_games, 4);
        assert_eq!(config.profile.high_confidence_min_games, 9);
        assert_eq!(config.profile.current_season_blend, 0.85);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("GRIDCAST_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("GRIDCAST_TEST_ENV_OR", 7u32), 7);
        std::env::set_var("GRIDCAST_TEST_ENV_OR", "11");
        assert_eq!(env_or("GRIDCAST_TEST_ENV_OR", 7u32), 11);
        std::env::remove_var("GRIDCAST_TEST_ENV_OR");
    }
}
