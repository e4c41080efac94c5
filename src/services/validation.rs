use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ValidationLimits;
use crate::db::Store;
use crate::models::{
    FinalPrediction, ScoreSummary, TeamPerformanceBaseline, METHOD_FALLBACK_BASELINE,
};

const FALLBACK_HOME_RANGE: (f64, f64) = (10.0, 60.0);
const FALLBACK_AWAY_RANGE: (f64, f64) = (7.0, 55.0);
const CORRECTED_SUFFIX: &str = "-corrected";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionCheck {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub corrected_prediction: Option<FinalPrediction>,
    pub correction_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionBounds {
    pub home_min: f64,
    pub home_max: f64,
    pub away_min: f64,
    pub away_max: f64,
    pub max_differential: f64,
    pub reasoning: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    Valid,
    Corrected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub game_id: String,
    pub outcome: BatchOutcome,
    pub check: PredictionCheck,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub valid: usize,
    pub corrected: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchValidation {
    pub items: Vec<BatchItem>,
    pub summary: BatchSummary,
}

impl BatchValidation {
    pub fn with_outcome(&self, outcome: BatchOutcome) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(move |i| i.outcome == outcome)
    }
}

/// Points for and against per team over the season's finished games.
type ScoreBook = HashMap<String, (Vec<f64>, Vec<f64>)>;

/// Independent sanity pass over final score predictions, driven only by each
/// team's points-for/against history in the season.
pub struct PredictionValidationService {
    store: Arc<dyn Store>,
    limits: ValidationLimits,
    season: i32,
}

impl PredictionValidationService {
    pub fn new(store: Arc<dyn Store>, limits: ValidationLimits, season: i32) -> Self {
        Self { store, limits, season }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    async fn score_book(&self) -> ScoreBook {
        let games = match self.store.season_games(self.season).await {
            Ok(games) => games,
            Err(e) => {
                tracing::warn!("Could not load {} games for score baselines: {}", self.season, e);
                return ScoreBook::new();
            }
        };

        let mut book = ScoreBook::new();
        for game in games.iter().filter(|g| g.is_finished()) {
            for team in [&game.home_team_id, &game.away_team_id] {
                if let Some((scored, allowed)) = game.score_for(team) {
                    let entry = book.entry(team.clone()).or_default();
                    entry.0.push(scored as f64);
                    entry.1.push(allowed as f64);
                }
            }
        }
        book
    }

    fn baseline_from(&self, team_id: &str, book: &ScoreBook) -> TeamPerformanceBaseline {
        let empty: &[f64] = &[];
        let (scored, allowed) = match book.get(team_id) {
            Some((s, a)) => (s.as_slice(), a.as_slice()),
            None => (empty, empty),
        };
        TeamPerformanceBaseline {
            team_id: team_id.to_string(),
            season: self.season,
            games_played: scored.len() as u32,
            points_for: ScoreSummary::from_values(scored),
            points_against: ScoreSummary::from_values(allowed),
        }
    }

    async fn lookup(&self, team_id: &str, book: &ScoreBook) -> Option<TeamPerformanceBaseline> {
        match self.store.team_exists(team_id).await {
            Ok(true) => Some(self.baseline_from(team_id, book)),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!("Team lookup for {} failed: {}", team_id, e);
                None
            }
        }
    }

    /// `None` when the team does not exist (or cannot be looked up); a
    /// zero-valued baseline when it exists but has no finished games.
    pub async fn team_performance_baseline(&self, team_id: &str) -> Option<TeamPerformanceBaseline> {
        let book = self.score_book().await;
        self.lookup(team_id, &book).await
    }

    pub async fn validate_prediction(&self, prediction: &FinalPrediction) -> PredictionCheck {
        let book = self.score_book().await;
        let home = self.lookup(&prediction.home_team_id, &book).await;
        let away = self.lookup(&prediction.away_team_id, &book).await;
        self.check_against(prediction, home.as_ref(), away.as_ref())
    }

    /// Runs the checks against already-loaded baselines.
    pub fn check_against(
        &self,
        prediction: &FinalPrediction,
        home: Option<&TeamPerformanceBaseline>,
        away: Option<&TeamPerformanceBaseline>,
    ) -> PredictionCheck {
        let limits = &self.limits;
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let sides = [
            ("home", prediction.home_score, home),
            ("away", prediction.away_score, away),
        ];

        if prediction.home_team_id == prediction.away_team_id {
            errors.push(format!("Home and away team are both {}", prediction.home_team_id));
        }
        for (side, score, _) in sides {
            if !score.is_finite() {
                errors.push(format!("Invalid {} score: must be a finite number", side));
            }
        }
        for (side, score, _) in sides {
            if score < 0.0 {
                errors.push(format!("Negative {} score not allowed: {:.1}", side, score));
            }
        }
        for (side, score, _) in sides {
            if score > limits.max_score {
                errors.push(format!(
                    "{} score {:.1} exceeds maximum of {}",
                    side, score, limits.max_score
                ));
            }
        }
        let differential = prediction.differential().abs();
        if differential > limits.max_differential {
            errors.push(format!(
                "Point differential {:.1} exceeds maximum of {}",
                differential, limits.max_differential
            ));
        }
        for (side, score, baseline) in sides {
            let Some(baseline) = baseline.filter(|b| b.has_games()) else { continue };
            let summary = &baseline.points_for;
            if summary.std_dev > 0.0
                && (score - summary.mean).abs() > limits.max_std_deviations * summary.std_dev
            {
                warnings.push(format!(
                    "{} score {:.1} is more than {} standard deviations from {}'s average of {:.1}",
                    side, score, limits.max_std_deviations, baseline.team_id, summary.mean
                ));
            }
        }
        for (side, score, baseline) in sides {
            let Some(baseline) = baseline.filter(|b| b.has_games()) else { continue };
            let floor = (baseline.points_for.mean * limits.min_score_ratio).max(limits.min_score_floor);
            if score < floor {
                errors.push(format!(
                    "{} score {:.1} is below the minimum of {:.1} for {}",
                    side, score, floor, baseline.team_id
                ));
            }
        }

        if errors.is_empty() {
            return PredictionCheck {
                is_valid: true,
                errors,
                warnings,
                corrected_prediction: None,
                correction_reason: None,
            };
        }

        let corrected = self.correct_prediction(prediction, home, away);
        tracing::warn!(
            "Prediction for {} failed validation ({}); corrected to {:.1}-{:.1}",
            prediction.game_id,
            errors.join("; "),
            corrected.home_score,
            corrected.away_score
        );
        PredictionCheck {
            is_valid: false,
            correction_reason: Some(format!("Corrected: {}", errors.join("; "))),
            errors,
            warnings,
            corrected_prediction: Some(corrected),
        }
    }

    fn side_bounds(&self, baseline: Option<&TeamPerformanceBaseline>) -> (f64, f64) {
        let limits = &self.limits;
        match baseline.filter(|b| b.has_games()) {
            Some(b) => {
                let mean = b.points_for.mean;
                let lower = (mean * limits.lower_bound_ratio).max(limits.min_score_floor);
                let upper = (mean * limits.upper_bound_ratio).min(limits.upper_bound_cap);
                (lower, upper.max(lower))
            }
            None => (limits.default_min_score, limits.default_max_score),
        }
    }

    /// Clamps each score into its side's bounds. If the clamped game is still
    /// a blowout, the margin is pulled to the corrected differential and the
    /// pair is shifted to sit inside both sides' bounds.
    pub fn correct_prediction(
        &self,
        prediction: &FinalPrediction,
        home: Option<&TeamPerformanceBaseline>,
        away: Option<&TeamPerformanceBaseline>,
    ) -> FinalPrediction {
        let limits = &self.limits;
        let (home_min, home_max) = self.side_bounds(home);
        let (away_min, away_max) = self.side_bounds(away);

        let finite_or = |score: f64, lower: f64, upper: f64| {
            if score.is_finite() {
                score.clamp(lower, upper)
            } else {
                (lower + upper) / 2.0
            }
        };
        let mut home_score = finite_or(prediction.home_score, home_min, home_max);
        let mut away_score = finite_or(prediction.away_score, away_min, away_max);

        let clamped = home_score - away_score;
        if clamped.abs() > limits.correction_trigger_differential {
            let half = clamped.signum() * limits.corrected_differential / 2.0;
            // Midpoints that keep home = mid + half and away = mid - half in bounds.
            let lo = (home_min - half).max(away_min + half);
            let hi = (home_max - half).min(away_max + half);
            let mid = (home_score + away_score) / 2.0;
            let mid = if lo <= hi { mid.clamp(lo, hi) } else { (lo + hi) / 2.0 };
            home_score = (mid + half).clamp(home_min, home_max).max(0.0);
            away_score = (mid - half).clamp(away_min, away_max).max(0.0);
        }

        let method = if prediction.method.ends_with(CORRECTED_SUFFIX) {
            prediction.method.clone()
        } else {
            format!("{}{}", prediction.method, CORRECTED_SUFFIX)
        };

        FinalPrediction {
            game_id: prediction.game_id.clone(),
            home_team_id: prediction.home_team_id.clone(),
            away_team_id: prediction.away_team_id.clone(),
            home_score,
            away_score,
            confidence: prediction.confidence / 2.0,
            method,
        }
    }

    pub async fn calculate_prediction_bounds(&self, home_id: &str, away_id: &str) -> PredictionBounds {
        let book = self.score_book().await;
        let home = self.lookup(home_id, &book).await;
        let away = self.lookup(away_id, &book).await;

        let mut reasoning = Vec::new();
        for (side, team_id, baseline) in [("Home", home_id, &home), ("Away", away_id, &away)] {
            match baseline.as_ref().filter(|b| b.has_games()) {
                Some(b) => reasoning.push(format!(
                    "{} bounds from {} games of {} history (avg {:.1})",
                    side, b.games_played, team_id, b.points_for.mean
                )),
                None => reasoning.push(format!(
                    "{} bounds use defaults: no {} history for {}",
                    side, self.season, team_id
                )),
            }
        }
        reasoning.push(format!(
            "Maximum differential fixed at {}",
            self.limits.correction_trigger_differential
        ));

        let (home_min, home_max) = self.side_bounds(home.as_ref());
        let (away_min, away_max) = self.side_bounds(away.as_ref());
        PredictionBounds {
            home_min,
            home_max,
            away_min,
            away_max,
            max_differential: self.limits.correction_trigger_differential,
            reasoning,
        }
    }

    /// Baseline-only prediction for when the efficiency model cannot run.
    pub async fn generate_fallback_prediction(
        &self,
        home_id: &str,
        away_id: &str,
        game_id: &str,
    ) -> FinalPrediction {
        let limits = &self.limits;
        let book = self.score_book().await;
        let home = self.lookup(home_id, &book).await.filter(|b| b.has_games());
        let away = self.lookup(away_id, &book).await.filter(|b| b.has_games());

        let scored = |b: &Option<TeamPerformanceBaseline>, default: f64| {
            b.as_ref().map(|b| b.points_for.mean).unwrap_or(default)
        };
        let allowed = |b: &Option<TeamPerformanceBaseline>| {
            b.as_ref()
                .map(|b| b.points_against.mean)
                .unwrap_or(limits.league_average_points)
        };

        let home_score = scored(&home, limits.default_home_average)
            + limits.home_field_bonus
            + limits.opponent_defense_factor * (allowed(&away) - limits.league_average_points);
        let away_score = scored(&away, limits.default_away_average)
            + limits.opponent_defense_factor * (allowed(&home) - limits.league_average_points);

        FinalPrediction {
            game_id: game_id.to_string(),
            home_team_id: home_id.to_string(),
            away_team_id: away_id.to_string(),
            home_score: home_score.clamp(FALLBACK_HOME_RANGE.0, FALLBACK_HOME_RANGE.1),
            away_score: away_score.clamp(FALLBACK_AWAY_RANGE.0, FALLBACK_AWAY_RANGE.1),
            confidence: limits.fallback_confidence,
            method: METHOD_FALLBACK_BASELINE.to_string(),
        }
    }

    /// Validates every prediction independently against one load of the
    /// season's scores.
    pub async fn validate_prediction_batch(&self, predictions: &[FinalPrediction]) -> BatchValidation {
        let book = self.score_book().await;
        let mut baselines: HashMap<String, Option<TeamPerformanceBaseline>> = HashMap::new();
        for prediction in predictions {
            for team_id in [&prediction.home_team_id, &prediction.away_team_id] {
                if !baselines.contains_key(team_id) {
                    let baseline = self.lookup(team_id, &book).await;
                    baselines.insert(team_id.clone(), baseline);
                }
            }
        }

        let mut items = Vec::with_capacity(predictions.len());
        let mut summary = BatchSummary {
            total: predictions.len(),
            ..Default::default()
        };
        for prediction in predictions {
            let home = baselines.get(&prediction.home_team_id).and_then(|b| b.as_ref());
            let away = baselines.get(&prediction.away_team_id).and_then(|b| b.as_ref());
            let check = self.check_against(prediction, home, away);

            let outcome = if check.is_valid {
                summary.valid += 1;
                BatchOutcome::Valid
            } else if check
                .corrected_prediction
                .as_ref()
                .is_some_and(|c| self.check_against(c, home, away).is_valid)
            {
                summary.corrected += 1;
                BatchOutcome::Corrected
            } else {
                summary.failed += 1;
                BatchOutcome::Failed
            };
            items.push(BatchItem {
                game_id: prediction.game_id.clone(),
                outcome,
                check,
            });
        }

        tracing::info!(
            "Validated {} predictions: {} valid, {} corrected, {} failed",
            summary.total,
            summary.valid,
            summary.corrected,
            summary.failed
        );
        BatchValidation { items, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{demo_season, MemoryStore};
    use crate::models::{Team, METHOD_EFFICIENCY_MATCHUP};

    fn service() -> (Arc<MemoryStore>, PredictionValidationService) {
        let store = Arc::new(MemoryStore::with_data(demo_season(2024)));
        store.insert_team(Team {
            id: "charlotte".to_string(),
            name: "Charlotte".to_string(),
            conference: None,
        });
        let service = PredictionValidationService::new(store.clone(), ValidationLimits::default(), 2024);
        (store, service)
    }

    fn prediction(home: f64, away: f64) -> FinalPrediction {
        FinalPrediction {
            game_id: "g".to_string(),
            home_team_id: "georgia".to_string(),
            away_team_id: "alabama".to_string(),
            home_score: home,
            away_score: away,
            confidence: 0.8,
            method: METHOD_EFFICIENCY_MATCHUP.to_string(),
        }
    }

    fn baseline(team: &str, mean: f64, games: u32) -> TeamPerformanceBaseline {
        TeamPerformanceBaseline {
            team_id: team.to_string(),
            season: 2024,
            games_played: games,
            points_for: ScoreSummary { mean, std_dev: 6.0, min: mean - 10.0, max: mean + 10.0 },
            points_against: ScoreSummary { mean: 24.0, std_dev: 6.0, min: 14.0, max: 34.0 },
        }
    }

    #[tokio::test]
    async fn test_baseline_distinguishes_missing_team_from_empty_history() {
        let (_, service) = service();
        assert!(service.team_performance_baseline("not-a-team").await.is_none());

        let empty = service.team_performance_baseline("charlotte").await.unwrap();
        assert!(!empty.has_games());
        assert_eq!(empty.points_for, ScoreSummary::default());

        let georgia = service.team_performance_baseline("georgia").await.unwrap();
        assert_eq!(georgia.games_played, 11);
        assert!(georgia.points_for.mean > 0.0);
        assert!(georgia.points_for.min <= georgia.points_for.max);
    }

    #[tokio::test]
    async fn test_reasonable_prediction_passes() {
        let (_, service) = service();
        let georgia = service.team_performance_baseline("georgia").await.unwrap();
        let alabama = service.team_performance_baseline("alabama").await.unwrap();
        let check = service
            .validate_prediction(&prediction(georgia.points_for.mean, alabama.points_for.mean))
            .await;
        assert!(check.is_valid, "{:?}", check.errors);
        assert!(check.corrected_prediction.is_none());
    }

    #[tokio::test]
    async fn test_negative_score_is_corrected() {
        let (_, service) = service();
        let check = service.validate_prediction(&prediction(-3.0, 24.0)).await;
        assert!(!check.is_valid);
        assert!(check.errors[0].starts_with("Negative home score"));
        let corrected = check.corrected_prediction.unwrap();
        assert!(corrected.home_score >= 3.0);
        assert_eq!(corrected.confidence, 0.4);
        assert_eq!(corrected.method, "efficiency-matchup-corrected");
        assert!(check.correction_reason.unwrap().contains("Negative home score"));
    }

    #[tokio::test]
    async fn test_absurd_scores_and_margins_are_errors() {
        let (_, service) = service();
        let check = service.validate_prediction(&prediction(250.0, 20.0)).await;
        assert!(check.errors.iter().any(|e| e.contains("exceeds maximum of 200")));
        assert!(check.errors.iter().any(|e| e.contains("Point differential 230.0")));
    }

    #[test]
    fn test_deviation_is_a_warning_and_low_score_an_error() {
        let (_, service) = service();
        let home = baseline("georgia", 40.0, 8);
        let away = baseline("alabama", 30.0, 8);

        let high = service.check_against(&prediction(66.0, 30.0), Some(&home), Some(&away));
        assert!(high.is_valid);
        assert_eq!(high.warnings.len(), 1);

        let low = service.check_against(&prediction(11.0, 30.0), Some(&home), Some(&away));
        assert!(!low.is_valid);
        assert!(low.errors[0].contains("below the minimum of 12.0"));
    }

    #[test]
    fn test_no_history_skips_baseline_checks() {
        let (_, service) = service();
        let empty = baseline("georgia", 0.0, 0);
        let check = service.check_against(&prediction(4.0, 5.0), Some(&empty), None);
        assert!(check.is_valid);
        assert!(check.warnings.is_empty());
    }

    #[test]
    fn test_blowouts_correct_to_exact_differential() {
        let (_, service) = service();
        let home = baseline("georgia", 42.0, 10);
        let pairs = [(90.0, 3.0), (77.0, 10.0), (3.0, 68.0), (150.0, -20.0)];
        for (h, a) in pairs {
            for (hb, ab) in [(Some(&home), None), (None, None)] {
                let corrected = service.correct_prediction(&prediction(h, a), hb, ab);
                assert!(
                    (corrected.differential().abs() - 35.0).abs() < 1e-9,
                    "{} - {} corrected to {} - {}",
                    h,
                    a,
                    corrected.home_score,
                    corrected.away_score
                );
                assert_eq!(corrected.confidence, 0.4);
                assert_eq!(corrected.differential().signum(), (h - a).signum());
            }
        }
    }

    #[test]
    fn test_correction_clamps_to_default_bounds() {
        let (_, service) = service();
        let corrected = service.correct_prediction(&prediction(f64::NAN, 2.0), None, None);
        assert_eq!(corrected.home_score, 38.5);
        assert_eq!(corrected.away_score, 7.0);

        let twice = service.correct_prediction(&corrected, None, None);
        assert_eq!(twice.method, "efficiency-matchup-corrected");
    }

    #[test]
    fn test_corrected_prediction_passes_its_own_check() {
        let (_, service) = service();
        let low = baseline("georgia", 10.0, 8);
        let mid = baseline("alabama", 32.0, 8);
        let huge = baseline("alabama", 200.0, 8);
        let cases = [
            (70.0, 5.0, Some(&low), Some(&low)),
            (120.0, 0.0, Some(&mid), Some(&low)),
            (0.0, 200.0, Some(&low), Some(&mid)),
            (0.0, 300.0, Some(&low), Some(&huge)),
            (-40.0, 500.0, None, None),
            (f64::INFINITY, -5.0, Some(&mid), None),
        ];
        for (h, a, hb, ab) in cases {
            let corrected = service.correct_prediction(&prediction(h, a), hb, ab);
            let recheck = service.check_against(&corrected, hb, ab);
            assert!(
                recheck.is_valid,
                "{} - {} corrected to {} - {}: {:?}",
                h, a, corrected.home_score, corrected.away_score, recheck.errors
            );

            let (home_min, home_max) = service.side_bounds(hb);
            let (away_min, away_max) = service.side_bounds(ab);
            assert!((home_min..=home_max).contains(&corrected.home_score));
            assert!((away_min..=away_max).contains(&corrected.away_score));
            assert!(corrected.home_score >= 0.0 && corrected.away_score >= 0.0);
        }

        let corrected = service.correct_prediction(&prediction(70.0, 5.0), Some(&low), Some(&low));
        assert_eq!((corrected.home_score, corrected.away_score), (25.0, 5.0));
    }

    #[test]
    fn test_far_from_average_score_warns_without_correcting() {
        let (_, service) = service();
        let home = baseline("georgia", 10.0, 8);
        let check = service.check_against(&prediction(70.0, 20.0), Some(&home), None);
        assert!(check.is_valid, "{:?}", check.errors);
        assert!(check.corrected_prediction.is_none());
        assert_eq!(check.warnings.len(), 1);
        assert!(check.warnings[0].contains("standard deviations from georgia's average of 10.0"));
    }

    #[tokio::test]
    async fn test_prediction_bounds_reasoning() {
        let (_, service) = service();
        let bounds = service.calculate_prediction_bounds("georgia", "charlotte").await;
        assert_eq!((bounds.away_min, bounds.away_max), (7.0, 70.0));
        assert!(bounds.home_min >= 3.0 && bounds.home_max <= 80.0);
        assert_eq!(bounds.max_differential, 50.0);
        assert!(bounds.reasoning[0].starts_with("Home bounds from 11 games"));
        assert!(bounds.reasoning[1].starts_with("Away bounds use defaults"));
    }

    #[tokio::test]
    async fn test_fallback_prediction_without_history() {
        let (_, service) = service();
        let fallback = service
            .generate_fallback_prediction("charlotte", "not-a-team", "2024-w13-1")
            .await;
        assert_eq!(fallback.home_score, 27.0);
        assert_eq!(fallback.away_score, 21.0);
        assert_eq!(fallback.confidence, 0.3);
        assert_eq!(fallback.method, METHOD_FALLBACK_BASELINE);
    }

    #[tokio::test]
    async fn test_fallback_prediction_with_history_stays_in_range() {
        let (_, service) = service();
        let fallback = service.generate_fallback_prediction("ohio-state", "auburn", "x").await;
        assert!((10.0..=60.0).contains(&fallback.home_score));
        assert!((7.0..=55.0).contains(&fallback.away_score));
        assert!(fallback.home_score > fallback.away_score);
    }

    #[tokio::test]
    async fn test_fallback_survives_store_outage() {
        let (store, service) = service();
        store.set_fail_reads(true);
        let fallback = service.generate_fallback_prediction("georgia", "alabama", "x").await;
        assert_eq!((fallback.home_score, fallback.away_score), (27.0, 21.0));
    }

    #[tokio::test]
    async fn test_batch_accounts_for_every_item() {
        let (_, service) = service();
        let mut same_team = prediction(30.0, 20.0);
        same_team.away_team_id = "georgia".to_string();
        let batch = vec![
            prediction(31.0, 27.0),
            prediction(-7.0, 20.0),
            prediction(95.0, 3.0),
            same_team,
        ];

        let result = service.validate_prediction_batch(&batch).await;
        let s = result.summary;
        assert_eq!(s.total, 4);
        assert_eq!(s.valid + s.corrected + s.failed, s.total);
        assert_eq!(s.failed, 1);
        assert_eq!(s.corrected, 2);
        assert_eq!(result.with_outcome(BatchOutcome::Failed).count(), 1);
    }
}
