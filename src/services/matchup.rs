use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    CategoryPrediction, ConfidenceInterval, ConfidenceLevel, MatchupPrediction,
    RegressionMetadata, ScorePrediction, SidePrediction, StatCategory, StatisticalImpactWeights,
    TeamEfficiencyProfile, WeightKey,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedPerformance {
    pub prediction: CategoryPrediction,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundsCheck {
    pub is_valid: bool,
    pub adjusted_value: f64,
    pub reason: Option<String>,
}

fn offense_weights(category: StatCategory) -> &'static [WeightKey] {
    match category {
        StatCategory::TotalYards => &[WeightKey::PassingOffense, WeightKey::RushingOffense],
        StatCategory::PassingYards => &[WeightKey::PassingOffense],
        StatCategory::RushingYards => &[WeightKey::RushingOffense],
        StatCategory::Scoring => &[WeightKey::ScoringEfficiency],
        StatCategory::Interceptions => &[WeightKey::TurnoverMargin],
        StatCategory::Sacks => &[WeightKey::PassingDefense],
        StatCategory::FieldGoals => &[WeightKey::SpecialTeams],
    }
}

fn defense_weights(category: StatCategory) -> &'static [WeightKey] {
    match category {
        StatCategory::TotalYards => &[WeightKey::PassingDefense, WeightKey::RushingDefense],
        StatCategory::PassingYards => &[WeightKey::PassingDefense],
        StatCategory::RushingYards => &[WeightKey::RushingDefense],
        StatCategory::Scoring => &[WeightKey::ScoringEfficiency],
        StatCategory::Interceptions => &[WeightKey::TurnoverMargin],
        StatCategory::Sacks => &[WeightKey::PassingOffense],
        StatCategory::FieldGoals => &[WeightKey::SpecialTeams],
    }
}

fn tier_base(level: ConfidenceLevel) -> f64 {
    match level {
        ConfidenceLevel::High => 0.82,
        ConfidenceLevel::Medium => 0.6,
        ConfidenceLevel::Low => 0.35,
    }
}

fn standard_normal() -> EngineResult<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| EngineError::InvalidInput(format!("normal distribution: {}", e)))
}

fn check_profile(profile: &TeamEfficiencyProfile) -> EngineResult<()> {
    if !profile.offensive.is_finite() || !profile.defensive.is_finite() {
        return Err(EngineError::InvalidInput(format!(
            "profile for {} ({}) has non-finite efficiencies",
            profile.team_id, profile.season
        )));
    }
    Ok(())
}

/// Turns two efficiency profiles and a weight vector into category and score
/// predictions. Stateless apart from its inputs.
pub struct MatchupPredictionModel {
    config: ModelConfig,
    weights: StatisticalImpactWeights,
    model_r_squared: f64,
}

impl MatchupPredictionModel {
    pub fn new(config: ModelConfig, weights: StatisticalImpactWeights, model_r_squared: f64) -> Self {
        Self {
            config,
            weights,
            model_r_squared: if model_r_squared.is_finite() {
                model_r_squared.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    pub fn weights(&self) -> &StatisticalImpactWeights {
        &self.weights
    }

    /// Applied weight relative to the fallback weight for the same
    /// components; 1.0 under the fallback vector.
    fn multiplier(&self, keys: &[WeightKey]) -> f64 {
        let fallback = StatisticalImpactWeights::fallback();
        let applied: f64 = keys.iter().map(|k| self.weights.get(*k)).sum();
        let reference: f64 = keys.iter().map(|k| fallback.get(*k)).sum();
        applied / reference
    }

    /// Confidence from the weaker of the two profiles: its tier's base plus a
    /// bonus for a consistent sample.
    pub fn profile_confidence(&self, a: &TeamEfficiencyProfile, b: &TeamEfficiencyProfile) -> f64 {
        let weaker = if (a.confidence_level, a.convergence_score) <= (b.confidence_level, b.convergence_score) {
            a
        } else {
            b
        };
        (tier_base(weaker.confidence_level) + 0.1 * weaker.convergence_score.clamp(0.1, 1.0)).min(0.99)
    }

    /// Expected output of `offense` against `defense` in one category, before
    /// bounds checking. The baseline is the league per-game average.
    pub fn calculate_expected_performance(
        &self,
        offense: &TeamEfficiencyProfile,
        defense: &TeamEfficiencyProfile,
        category: StatCategory,
    ) -> EngineResult<ExpectedPerformance> {
        check_profile(offense)?;
        check_profile(defense)?;

        let baseline = self.config.league_averages.get(category);
        let team_offense = offense.offensive.get(category);
        let opponent_defense = defense.defensive.get(category);
        let m_off = self.multiplier(offense_weights(category));
        let m_def = self.multiplier(defense_weights(category));

        let expected = baseline + team_offense * m_off - opponent_defense * m_def;
        if !expected.is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "non-finite {} expectation for {} vs {}",
                category, offense.team_id, defense.team_id
            )));
        }

        Ok(ExpectedPerformance {
            prediction: CategoryPrediction {
                category,
                team_offensive_efficiency: team_offense,
                opponent_defensive_efficiency: opponent_defense,
                opponent_baseline: baseline,
                predicted_value: expected,
                weight_applied: offense_weights(category)
                    .iter()
                    .map(|k| self.weights.get(*k))
                    .sum(),
                bounds_adjustment: None,
            },
            confidence: self.profile_confidence(offense, defense),
        })
    }

    /// Same as `calculate_expected_performance` for a category given by name.
    pub fn expected_performance_for(
        &self,
        offense: &TeamEfficiencyProfile,
        defense: &TeamEfficiencyProfile,
        category: &str,
    ) -> EngineResult<ExpectedPerformance> {
        self.calculate_expected_performance(offense, defense, category.parse()?)
    }

    pub fn validate_prediction_bounds(
        &self,
        predicted_value: f64,
        category: StatCategory,
        opponent_baseline: f64,
        team_season_average: Option<f64>,
    ) -> BoundsCheck {
        if predicted_value < 0.0 {
            return BoundsCheck {
                is_valid: false,
                adjusted_value: 0.1 * opponent_baseline,
                reason: Some(format!("Negative prediction not allowed for {}", category)),
            };
        }

        if opponent_baseline > 0.0
            && (predicted_value - opponent_baseline).abs() / opponent_baseline > 2.0
        {
            return BoundsCheck {
                is_valid: false,
                adjusted_value: 3.0 * opponent_baseline,
                reason: Some(format!(
                    "{} prediction {:.1} exceeded reasonable bounds relative to opponent baseline {:.1}",
                    category, predicted_value, opponent_baseline
                )),
            };
        }

        if let Some(average) = team_season_average.filter(|a| *a > 0.0) {
            if (predicted_value - average).abs() / average > 1.5 {
                return BoundsCheck {
                    is_valid: false,
                    adjusted_value: 2.5 * average,
                    reason: Some(format!(
                        "{} prediction {:.1} deviated too much from team average {:.1}",
                        category, predicted_value, average
                    )),
                };
            }
        }

        BoundsCheck {
            is_valid: true,
            adjusted_value: predicted_value,
            reason: None,
        }
    }

    fn side(
        &self,
        offense: &TeamEfficiencyProfile,
        defense: &TeamEfficiencyProfile,
    ) -> EngineResult<SidePrediction> {
        let mut categories = Vec::with_capacity(StatCategory::PREDICTED.len());
        for category in StatCategory::PREDICTED {
            let mut prediction = self.calculate_expected_performance(offense, defense, category)?.prediction;
            let team_average = (offense.games_played > 0).then(|| offense.offensive_averages.get(category));
            let check = self.validate_prediction_bounds(
                prediction.predicted_value,
                category,
                prediction.opponent_baseline,
                team_average,
            );
            if !check.is_valid {
                tracing::debug!(
                    "Clamped {} {} from {:.1} to {:.1}",
                    offense.team_id,
                    category,
                    prediction.predicted_value,
                    check.adjusted_value
                );
                prediction.predicted_value = check.adjusted_value;
                prediction.bounds_adjustment = check.reason;
            }
            categories.push(prediction);
        }
        Ok(SidePrediction {
            team_id: offense.team_id.clone(),
            categories,
        })
    }

    /// Points from the scoring prediction blended with points implied by the
    /// total-yards prediction at the league points-per-yard rate.
    fn points_for(&self, side: &SidePrediction) -> f64 {
        let league = &self.config.league_averages;
        let scoring = side
            .category(StatCategory::Scoring)
            .map(|p| p.predicted_value)
            .unwrap_or(league.scoring);
        let yards = side
            .category(StatCategory::TotalYards)
            .map(|p| p.predicted_value)
            .unwrap_or(league.total_yards);
        let implied = yards * league.scoring / league.total_yards;
        self.config.scoring_blend * scoring + (1.0 - self.config.scoring_blend) * implied
    }

    pub fn calculate_matchup_analysis(
        &self,
        home: &TeamEfficiencyProfile,
        away: &TeamEfficiencyProfile,
    ) -> EngineResult<MatchupPrediction> {
        self.analyze(home, away, false)
    }

    pub fn calculate_neutral_site_analysis(
        &self,
        home: &TeamEfficiencyProfile,
        away: &TeamEfficiencyProfile,
    ) -> EngineResult<MatchupPrediction> {
        self.analyze(home, away, true)
    }

    fn analyze(
        &self,
        home: &TeamEfficiencyProfile,
        away: &TeamEfficiencyProfile,
        neutral_site: bool,
    ) -> EngineResult<MatchupPrediction> {
        if home.team_id == away.team_id {
            return Err(EngineError::InvalidInput(format!(
                "{} cannot play itself",
                home.team_id
            )));
        }
        if home.season != away.season {
            return Err(EngineError::InvalidInput(format!(
                "profiles from different seasons ({} vs {})",
                home.season, away.season
            )));
        }

        let home_side = self.side(home, away)?;
        let away_side = self.side(away, home)?;

        let home_bonus = if neutral_site {
            0.0
        } else {
            let fallback = StatisticalImpactWeights::fallback().home_field_advantage;
            self.config.home_field_points * self.weights.home_field_advantage / fallback
        };
        let home_score = (self.points_for(&home_side) + home_bonus).max(0.0);
        let away_score = self.points_for(&away_side).max(0.0);

        let normal = standard_normal()?;
        let z = normal.inverse_cdf(0.5 + self.config.interval_level / 2.0);
        let half_width = z * self.config.score_std_dev * (1.0 - self.model_r_squared / 2.0);
        let interval = |score: f64| ConfidenceInterval {
            lower: (score - half_width).max(0.0),
            upper: score + half_width,
        };
        let home_win_probability = normal.cdf((home_score - away_score) / self.config.margin_std_dev);

        Ok(MatchupPrediction {
            home_team_id: home.team_id.clone(),
            away_team_id: away.team_id.clone(),
            season: home.season,
            home: home_side,
            away: away_side,
            scores: ScorePrediction {
                home_score,
                away_score,
                home_interval: interval(home_score),
                away_interval: interval(away_score),
            },
            home_win_probability,
            confidence: self.profile_confidence(home, away),
            confidence_level: home.confidence_level.min(away.confidence_level),
            regression_metadata: RegressionMetadata {
                weights_used: self.weights,
                model_r_squared: self.model_r_squared,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatLine;
    use chrono::Utc;

    fn profile(team: &str, level: ConfidenceLevel, strength: f64) -> TeamEfficiencyProfile {
        let deltas = StatLine {
            total_yards: 50.0 * strength,
            passing_yards: 30.0 * strength,
            rushing_yards: 20.0 * strength,
            scoring: 5.0 * strength,
            interceptions: 0.0,
            sacks: 0.0,
            field_goals: 0.0,
        };
        TeamEfficiencyProfile {
            team_id: team.to_string(),
            season: 2024,
            offensive: deltas,
            defensive: deltas,
            offensive_averages: ModelConfig::default().league_averages,
            games_played: 10,
            convergence_score: 0.6,
            confidence_level: level,
            blended_with_prior: false,
            last_calculated: Utc::now(),
        }
    }

    fn model() -> MatchupPredictionModel {
        MatchupPredictionModel::new(ModelConfig::default(), StatisticalImpactWeights::fallback(), 0.5)
    }

    #[test]
    fn test_bounds_negative_prediction_floors_at_ten_percent() {
        let check = model().validate_prediction_bounds(-100.0, StatCategory::TotalYards, 400.0, None);
        assert!(!check.is_valid);
        assert_eq!(check.adjusted_value, 40.0);
        assert!(check.reason.unwrap().contains("Negative prediction not allowed"));
    }

    #[test]
    fn test_bounds_relative_to_opponent() {
        let check = model().validate_prediction_bounds(1300.0, StatCategory::TotalYards, 400.0, None);
        assert!(!check.is_valid);
        assert_eq!(check.adjusted_value, 1200.0);
        assert!(check.reason.unwrap().contains("exceeded reasonable bounds relative to opponent"));
    }

    #[test]
    fn test_bounds_relative_to_team_average() {
        let check = model().validate_prediction_bounds(1100.0, StatCategory::TotalYards, 400.0, Some(400.0));
        assert!(!check.is_valid);
        assert_eq!(check.adjusted_value, 1000.0);
        assert!(check.reason.unwrap().contains("deviated too much from team average"));
    }

    #[test]
    fn test_bounds_reasonable_value_unchanged() {
        let check = model().validate_prediction_bounds(500.0, StatCategory::TotalYards, 400.0, Some(450.0));
        assert!(check.is_valid);
        assert_eq!(check.adjusted_value, 500.0);
        assert!(check.reason.is_none());
    }

    #[test]
    fn test_expected_performance_is_opponent_relative() {
        let strong = profile("ohio-state", ConfidenceLevel::High, 1.0);
        let average = profile("iowa", ConfidenceLevel::High, 0.0);
        let model = model();

        let vs_average = model
            .calculate_expected_performance(&strong, &average, StatCategory::TotalYards)
            .unwrap();
        assert_eq!(vs_average.prediction.opponent_baseline, 400.0);
        assert!((vs_average.prediction.predicted_value - 450.0).abs() < 1e-9);
        assert!((vs_average.prediction.weight_applied - 0.45).abs() < 1e-12);

        let vs_strong = model
            .calculate_expected_performance(&strong, &strong, StatCategory::TotalYards)
            .unwrap();
        assert!((vs_strong.prediction.predicted_value - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_heavier_weight_amplifies_the_edge() {
        let strong = profile("ohio-state", ConfidenceLevel::High, 1.0);
        let average = profile("iowa", ConfidenceLevel::High, 0.0);
        let mut weights = StatisticalImpactWeights::fallback();
        weights.passing_offense = 0.5;
        let heavy = MatchupPredictionModel::new(ModelConfig::default(), weights, 0.5);

        let base = model()
            .calculate_expected_performance(&strong, &average, StatCategory::PassingYards)
            .unwrap();
        let boosted = heavy
            .calculate_expected_performance(&strong, &average, StatCategory::PassingYards)
            .unwrap();
        assert!((base.prediction.predicted_value - 270.0).abs() < 1e-9);
        assert!((boosted.prediction.predicted_value - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_follows_weaker_profile() {
        let model = model();
        let high_a = profile("a", ConfidenceLevel::High, 0.5);
        let high_b = profile("b", ConfidenceLevel::High, -0.5);
        let low = profile("c", ConfidenceLevel::Low, 0.0);

        let both_high = model
            .calculate_expected_performance(&high_a, &high_b, StatCategory::Scoring)
            .unwrap();
        assert!(both_high.confidence > 0.8);

        let mixed = model
            .calculate_expected_performance(&high_a, &low, StatCategory::Scoring)
            .unwrap();
        assert!(mixed.confidence < 0.5);
    }

    #[test]
    fn test_unknown_category_name_is_rejected() {
        let a = profile("a", ConfidenceLevel::High, 0.0);
        let b = profile("b", ConfidenceLevel::High, 0.0);
        let err = model().expected_performance_for(&a, &b, "puntReturnYards").unwrap_err();
        assert!(err.to_string().contains("unsupported statistical category"));
    }

    #[test]
    fn test_matchup_favors_stronger_team_and_takes_lower_tier() {
        let home = profile("georgia", ConfidenceLevel::High, 1.0);
        let away = profile("auburn", ConfidenceLevel::Medium, -0.5);
        let prediction = model().calculate_matchup_analysis(&home, &away).unwrap();

        assert_eq!(prediction.confidence_level, ConfidenceLevel::Medium);
        assert_eq!(prediction.home.categories.len(), 4);
        assert!(prediction.scores.home_score > prediction.scores.away_score);
        assert!(prediction.home_win_probability > 0.5 && prediction.home_win_probability < 1.0);
        assert_eq!(prediction.regression_metadata.model_r_squared, 0.5);
        assert_eq!(prediction.regression_metadata.weights_used, StatisticalImpactWeights::fallback());
        assert!(prediction.scores.home_interval.contains(prediction.scores.home_score));
    }

    #[test]
    fn test_home_field_bonus_and_neutral_site() {
        let a = profile("a", ConfidenceLevel::High, 0.0);
        let b = profile("b", ConfidenceLevel::High, 0.0);
        let model = model();

        let home = model.calculate_matchup_analysis(&a, &b).unwrap();
        assert!((home.scores.home_score - 30.5).abs() < 1e-9);
        assert!((home.scores.away_score - 28.0).abs() < 1e-9);

        let neutral = model.calculate_neutral_site_analysis(&a, &b).unwrap();
        assert!((neutral.scores.home_score - neutral.scores.away_score).abs() < 1e-9);
        assert!((neutral.home_win_probability - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_interval_widens_as_r_squared_falls() {
        let a = profile("a", ConfidenceLevel::High, 0.3);
        let b = profile("b", ConfidenceLevel::High, 0.1);
        let weak = MatchupPredictionModel::new(ModelConfig::default(), StatisticalImpactWeights::fallback(), 0.1);
        let strong = MatchupPredictionModel::new(ModelConfig::default(), StatisticalImpactWeights::fallback(), 0.9);

        let weak_width = weak.calculate_matchup_analysis(&a, &b).unwrap().scores.home_interval.width();
        let strong_width = strong.calculate_matchup_analysis(&a, &b).unwrap().scores.home_interval.width();
        assert!(weak_width > strong_width);
    }

    #[test]
    fn test_extreme_profile_is_clamped() {
        let mut monster = profile("monster", ConfidenceLevel::High, 0.0);
        monster.offensive.total_yards = 2_000.0;
        let average = profile("iowa", ConfidenceLevel::High, 0.0);
        let prediction = model().calculate_matchup_analysis(&monster, &average).unwrap();
        let total = prediction.home.category(StatCategory::TotalYards).unwrap();
        assert_eq!(total.predicted_value, 1_200.0);
        assert!(total.bounds_adjustment.is_some());
    }
}
