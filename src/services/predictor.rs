use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Store;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ConfidenceLevel, FinalPrediction, GameRecord, GameType, MatchupPrediction,
    StatisticalImpactWeights, TeamEfficiencyProfile, TeamGameStats, WeightChangeLog,
};
use crate::services::{
    EfficiencyProfileBuilder, MatchupPredictionModel, PerformanceRecordAssembler, PredictionCheck,
    PredictionValidationService, WeightManager,
};
use crate::utils::Clock;

/// The weights and regression R² that were in effect at `at`: the newest
/// change logged strictly before it, or the fallback weights with no R².
/// R² only carries over from entries that came from a regression.
pub fn weights_as_of(history: &[WeightChangeLog], at: DateTime<Utc>) -> (StatisticalImpactWeights, f64) {
    history
        .iter()
        .filter(|entry| entry.timestamp < at)
        .max_by_key(|entry| entry.timestamp)
        .map(|entry| {
            let r_squared = entry.regression_metrics.as_ref().map_or(0.0, |m| m.r_squared);
            (entry.new_weights, r_squared)
        })
        .unwrap_or((StatisticalImpactWeights::fallback(), 0.0))
}

/// Raw games and box scores for one season, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct SeasonData {
    pub season: i32,
    pub games: Vec<GameRecord>,
    pub stats: Vec<TeamGameStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationSummary {
    pub season: i32,
    pub updated: Vec<String>,
    /// (team id, error message)
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePrediction {
    /// Absent when the fallback predictor was used.
    pub matchup: Option<MatchupPrediction>,
    pub prediction: FinalPrediction,
    pub check: PredictionCheck,
}

/// A pre-game prediction for a finished game next to what happened.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestPrediction {
    pub game_id: String,
    pub week: u32,
    pub home_team_id: String,
    pub away_team_id: String,
    pub game_type: GameType,
    pub predicted_home: f64,
    pub predicted_away: f64,
    pub home_win_probability: f64,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub actual_home: f64,
    pub actual_away: f64,
}

impl BacktestPrediction {
    pub fn predicted_margin(&self) -> f64 {
        self.predicted_home - self.predicted_away
    }

    pub fn actual_margin(&self) -> f64 {
        self.actual_home - self.actual_away
    }

    pub fn home_won(&self) -> bool {
        self.actual_home > self.actual_away
    }

    pub fn picked_correctly(&self) -> bool {
        (self.home_win_probability >= 0.5) == self.home_won()
    }
}

/// Runs the profile → weights → matchup → validation chain.
pub struct PredictionEngine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    builder: EfficiencyProfileBuilder,
    weights: WeightManager,
}

impl PredictionEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            builder: EfficiencyProfileBuilder::new(config.profile.clone()),
            weights: WeightManager::new(store.clone(), clock.clone(), config.weights.clone()),
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightManager {
        &self.weights
    }

    pub fn validation_service(&self, season: i32) -> PredictionValidationService {
        PredictionValidationService::new(self.store.clone(), self.config.limits.clone(), season)
    }

    pub async fn season_data(&self, season: i32) -> EngineResult<SeasonData> {
        Ok(SeasonData {
            season,
            games: self.store.season_games(season).await?,
            stats: self.store.season_team_stats(season).await?,
        })
    }

    /// Stored profile, or `None` if missing or unreadable.
    pub async fn load_profile(&self, team_id: &str, season: i32) -> Option<TeamEfficiencyProfile> {
        self.store.load_profile(team_id, season).await.unwrap_or_else(|e| {
            tracing::warn!("Profile lookup for {} {} failed: {}", team_id, season, e);
            None
        })
    }

    async fn build_profile(
        &self,
        team_id: &str,
        data: &SeasonData,
        assembler: &PerformanceRecordAssembler<'_>,
    ) -> EngineResult<TeamEfficiencyProfile> {
        let records = assembler.records_for(team_id, None);
        let prior = self.load_profile(team_id, data.season - 1).await;
        self.builder
            .build(team_id, data.season, &records, prior.as_ref(), self.clock.now())
    }

    /// Rebuilds and overwrites one team's profile for the season.
    pub async fn recalculate_profile(
        &self,
        team_id: &str,
        season: i32,
    ) -> EngineResult<TeamEfficiencyProfile> {
        if !self.store.team_exists(team_id).await? {
            return Err(EngineError::TeamNotFound(team_id.to_string()));
        }
        let data = self.season_data(season).await?;
        let assembler = PerformanceRecordAssembler::new(
            &data.games,
            &data.stats,
            self.config.model.league_averages,
        );

        let profile = self.build_profile(team_id, &data, &assembler).await?;
        self.store.save_profile(&profile).await?;
        tracing::info!(
            "Saved {} {} profile: {} games, {} confidence, convergence {:.2}",
            team_id,
            season,
            profile.games_played,
            profile.confidence_level,
            profile.convergence_score
        );
        Ok(profile)
    }

    /// Rebuilds every team with usable games. Each team is saved on its own,
    /// so one failure leaves the others committed.
    pub async fn recalculate_season(&self, season: i32) -> EngineResult<RecalculationSummary> {
        let data = self.season_data(season).await?;
        let assembler = PerformanceRecordAssembler::new(
            &data.games,
            &data.stats,
            self.config.model.league_averages,
        );

        let mut summary = RecalculationSummary {
            season,
            ..Default::default()
        };
        for team_id in assembler.teams() {
            let outcome = match self.build_profile(&team_id, &data, &assembler).await {
                Ok(profile) => self.store.save_profile(&profile).await.map_err(EngineError::from),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => summary.updated.push(team_id),
                Err(e) => {
                    tracing::warn!("Recalculation of {} {} failed: {}", team_id, season, e);
                    summary.failed.push((team_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Recalculated {} season: {} profiles updated, {} failed",
            season,
            summary.updated.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    async fn model_for(&self, season: i32) -> MatchupPredictionModel {
        let weights = self.weights.current_weights(season).await;
        let r_squared = self
            .weights
            .latest_regression_analysis(season)
            .await
            .map(|a| a.overall_model_r_squared)
            .unwrap_or(0.0);
        MatchupPredictionModel::new(self.config.model.clone(), weights, r_squared)
    }

    /// Full prediction for a matchup from stored profiles. Falls back to the
    /// score-baseline predictor when either profile is missing.
    pub async fn predict_matchup(
        &self,
        season: i32,
        home_id: &str,
        away_id: &str,
        game_id: &str,
        neutral_site: bool,
    ) -> EngineResult<GamePrediction> {
        let validation = self.validation_service(season);
        let home = self.load_profile(home_id, season).await;
        let away = self.load_profile(away_id, season).await;

        let (Some(home), Some(away)) = (home, away) else {
            tracing::warn!(
                "Missing profile for {} vs {} ({}); using fallback prediction",
                home_id,
                away_id,
                season
            );
            let prediction = validation
                .generate_fallback_prediction(home_id, away_id, game_id)
                .await;
            let check = validation.validate_prediction(&prediction).await;
            return Ok(GamePrediction {
                matchup: None,
                prediction: check.corrected_prediction.clone().unwrap_or(prediction),
                check,
            });
        };

        let model = self.model_for(season).await;
        let matchup = if neutral_site {
            model.calculate_neutral_site_analysis(&home, &away)?
        } else {
            model.calculate_matchup_analysis(&home, &away)?
        };
        let proposed = matchup.to_final(game_id);
        let check = validation.validate_prediction(&proposed).await;

        Ok(GamePrediction {
            prediction: check.corrected_prediction.clone().unwrap_or(proposed),
            matchup: Some(matchup),
            check,
        })
    }

    pub async fn predict_game(&self, game: &GameRecord) -> EngineResult<GamePrediction> {
        self.predict_matchup(
            game.season,
            &game.home_team_id,
            &game.away_team_id,
            &game.id,
            game.neutral_site,
        )
        .await
    }

    /// Predicts a finished game using only games played before it. Nothing
    /// is written.
    /// Predicts a finished game as it would have been predicted at kickoff.
    /// Profiles come from earlier games only and the weights are the ones in
    /// effect before kickoff per `history` (the season's weight change log).
    pub async fn backtest_game(
        &self,
        game: &GameRecord,
        data: &SeasonData,
        history: &[WeightChangeLog],
    ) -> EngineResult<BacktestPrediction> {
        let (Some(actual_home), Some(actual_away)) = (game.home_score, game.away_score) else {
            return Err(EngineError::InvalidInput(format!("game {} has no final score", game.id)));
        };

        let assembler = PerformanceRecordAssembler::new(
            &data.games,
            &data.stats,
            self.config.model.league_averages,
        );
        let cutoff = Some(game.order_key());
        let mut profiles = Vec::with_capacity(2);
        for team_id in [&game.home_team_id, &game.away_team_id] {
            let records = assembler.records_for(team_id, cutoff);
            if records.len() < self.config.audit.min_prior_games {
                return Err(EngineError::InsufficientData(format!(
                    "{} has {} games before {}",
                    team_id,
                    records.len(),
                    game.id
                )));
            }
            let prior = self.load_profile(team_id, game.season - 1).await;
            profiles.push(self.builder.build(
                team_id,
                game.season,
                &records,
                prior.as_ref(),
                game.start_date,
            )?);
        }

        let (weights, r_squared) = weights_as_of(history, game.start_date);
        let model = MatchupPredictionModel::new(self.config.model.clone(), weights, r_squared);
        let matchup = if game.neutral_site {
            model.calculate_neutral_site_analysis(&profiles[0], &profiles[1])?
        } else {
            model.calculate_matchup_analysis(&profiles[0], &profiles[1])?
        };

        // Season score baselines would leak the result; only the history-free
        // checks apply here.
        let validation = self.validation_service(game.season);
        let proposed = matchup.to_final(game.id.clone());
        let final_prediction = validation
            .check_against(&proposed, None, None)
            .corrected_prediction
            .unwrap_or(proposed);

        Ok(BacktestPrediction {
            game_id: game.id.clone(),
            week: game.week,
            home_team_id: game.home_team_id.clone(),
            away_team_id: game.away_team_id.clone(),
            game_type: game.game_type(),
            predicted_home: final_prediction.home_score,
            predicted_away: final_prediction.away_score,
            home_win_probability: matchup.home_win_probability,
            confidence: final_prediction.confidence,
            confidence_level: matchup.confidence_level,
            actual_home: actual_home as f64,
            actual_away: actual_away as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{demo_season, MemoryStore};
    use crate::models::{
        PartialWeights, RegressionMetrics, WeightChangeReason, WeightKey, METHOD_FALLBACK_BASELINE,
    };
    use crate::utils::FixedClock;
    use chrono::{TimeZone, Utc};

    fn engine() -> (Arc<MemoryStore>, PredictionEngine) {
        let store = Arc::new(MemoryStore::with_data(demo_season(2024)));
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 11, 20, 12, 0, 0).unwrap()));
        let engine = PredictionEngine::new(store.clone(), clock, EngineConfig::default());
        (store, engine)
    }

    #[tokio::test]
    async fn test_recalculate_profile_is_idempotent() {
        let (store, engine) = engine();
        let first = engine.recalculate_profile("georgia", 2024).await.unwrap();
        let second = engine.recalculate_profile("georgia", 2024).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.games_played, 11);
        assert_eq!(first.confidence_level, ConfidenceLevel::High);
        assert_eq!(store.season_profiles(2024).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_team_is_rejected() {
        let (_, engine) = engine();
        let err = engine.recalculate_profile("harvard", 2024).await.unwrap_err();
        assert!(matches!(err, EngineError::TeamNotFound(_)));
    }

    #[tokio::test]
    async fn test_recalculate_season_reports_write_failures_per_team() {
        let (store, engine) = engine();
        let summary = engine.recalculate_season(2024).await.unwrap();
        assert_eq!(summary.updated.len(), 12);
        assert!(summary.failed.is_empty());

        store.set_fail_writes(true);
        let summary = engine.recalculate_season(2024).await.unwrap();
        assert!(summary.updated.is_empty());
        assert_eq!(summary.failed.len(), 12);
        // Earlier commits survive.
        assert_eq!(store.season_profiles(2024).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_predict_without_profiles_falls_back() {
        let (_, engine) = engine();
        let result = engine
            .predict_matchup(2024, "georgia", "alabama", "2024-w12-1", false)
            .await
            .unwrap();
        assert!(result.matchup.is_none());
        assert_eq!(result.prediction.method, METHOD_FALLBACK_BASELINE);
    }

    #[tokio::test]
    async fn test_predict_with_profiles_uses_matchup_model() {
        let (store, engine) = engine();
        engine.recalculate_season(2024).await.unwrap();
        let scheduled = store
            .season_games(2024)
            .await
            .unwrap()
            .into_iter()
            .find(|g| !g.completed)
            .unwrap();

        let result = engine.predict_game(&scheduled).await.unwrap();
        let matchup = result.matchup.unwrap();
        assert_eq!(matchup.home_team_id, scheduled.home_team_id);
        assert!(result.prediction.home_score > 0.0 && result.prediction.away_score > 0.0);
        assert!((0.0..=1.0).contains(&matchup.home_win_probability));
    }

    #[tokio::test]
    async fn test_backtest_uses_only_earlier_games() {
        let (store, engine) = engine();
        let data = engine.season_data(2024).await.unwrap();

        let week_one = data.games.iter().find(|g| g.week == 1).unwrap();
        let err = engine.backtest_game(week_one, &data, &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData(_)));

        let week_nine = data.games.iter().find(|g| g.week == 9).unwrap();
        let backtest = engine.backtest_game(week_nine, &data, &[]).await.unwrap();
        assert_eq!(backtest.actual_home, week_nine.home_score.unwrap() as f64);
        assert!(backtest.predicted_home >= 0.0);
        // Read-only.
        assert!(store.season_profiles(2024).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_later_results_do_not_change_earlier_backtest() {
        let (_, engine) = engine();
        let data = engine.season_data(2024).await.unwrap();
        let week_nine = data.games.iter().find(|g| g.week == 9).unwrap().clone();
        let before = engine.backtest_game(&week_nine, &data, &[]).await.unwrap();

        // Rewrite every later result and log a weight change after kickoff.
        let mut rewritten = data.clone();
        let mut later = Vec::new();
        for game in rewritten.games.iter_mut().filter(|g| g.order_key() > week_nine.order_key()) {
            game.home_score = Some(99);
            game.away_score = Some(0);
            later.push(game.id.clone());
        }
        assert!(!later.is_empty());
        for stats in rewritten.stats.iter_mut().filter(|s| later.contains(&s.game_id)) {
            stats.points = Some(99.0);
            stats.total_yards = Some(900.0);
        }
        engine
            .weights()
            .update_weights_manually(
                2024,
                &PartialWeights::default().with(WeightKey::SpecialTeams, 0.2),
                "late season",
                None,
            )
            .await
            .unwrap();
        let history = engine.weights().weight_history(2024).await;
        assert_eq!(history.len(), 1);

        let after = engine.backtest_game(&week_nine, &rewritten, &history).await.unwrap();
        assert_eq!(after.predicted_home, before.predicted_home);
        assert_eq!(after.predicted_away, before.predicted_away);
        assert_eq!(after.home_win_probability, before.home_win_probability);
        assert_eq!(after.confidence, before.confidence);
    }

    fn change(at: DateTime<Utc>, weights: StatisticalImpactWeights, r_squared: Option<f64>) -> WeightChangeLog {
        WeightChangeLog {
            id: at.to_rfc3339(),
            season: 2024,
            timestamp: at,
            reason: if r_squared.is_some() {
                WeightChangeReason::RegressionAnalysis
            } else {
                WeightChangeReason::ManualOverride("test".to_string())
            },
            notes: None,
            previous_weights: StatisticalImpactWeights::fallback(),
            new_weights: weights,
            regression_metrics: r_squared.map(|r_squared| RegressionMetrics {
                r_squared,
                sample_size: 40,
                significant_metrics: Vec::new(),
            }),
            actor: "test".to_string(),
        }
    }

    #[test]
    fn test_weights_as_of_picks_the_change_before_kickoff() {
        let fallback = StatisticalImpactWeights::fallback();
        let fitted = PartialWeights::default()
            .with(WeightKey::SpecialTeams, 0.3)
            .merged_onto(&fallback);
        let manual = PartialWeights::default()
            .with(WeightKey::SpecialTeams, 0.2)
            .merged_onto(&fallback);
        let t = |day| Utc.with_ymd_and_hms(2024, 10, day, 12, 0, 0).unwrap();
        // Newest first, as the change log is read.
        let history = vec![change(t(20), manual, None), change(t(10), fitted, Some(0.4))];

        assert_eq!(weights_as_of(&[], t(15)), (fallback, 0.0));
        assert_eq!(weights_as_of(&history, t(10)), (fallback, 0.0));
        assert_eq!(weights_as_of(&history, t(15)), (fitted, 0.4));
        assert_eq!(weights_as_of(&history, t(25)), (manual, 0.0));
    }
}
