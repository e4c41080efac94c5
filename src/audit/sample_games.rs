use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::audit::{
    percent, pick_confidence, AccuracyReport, AuditReport, PredictionAccuracyTester, Severity,
    SubScores, ValidationResult, Validator, DATA_UNAVAILABLE,
};
use crate::config::AuditConfig;
use crate::models::GameType;
use crate::services::BacktestPrediction;
use crate::utils::{round_to, stride_sample, Clock};

/// Named pick-confidence bands: (name, lower, upper, description).
const BANDS: [(&str, f64, f64, &str); 4] = [
    ("Toss-up", 0.50, 0.55, "Essentially a coin flip; the model sees no real edge"),
    ("Lean", 0.55, 0.65, "A slight edge for the favorite; upsets are common"),
    ("Solid", 0.65, 0.80, "A clear favorite backed by the efficiency profiles"),
    ("Strong", 0.80, 1.00, "A heavy favorite; misses here usually mean bad data or injuries"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleReason {
    MostConfidentHit,
    MostConfidentMiss,
    ClosestGame,
    BiggestBlowout,
    Representative,
}

impl fmt::Display for SampleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleReason::MostConfidentHit => "most confident correct pick",
            SampleReason::MostConfidentMiss => "most confident miss",
            SampleReason::ClosestGame => "closest finish",
            SampleReason::BiggestBlowout => "biggest blowout",
            SampleReason::Representative => "representative game",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameExplanation {
    pub game_id: String,
    pub reason: SampleReason,
    pub matchup: String,
    pub predicted_score: String,
    pub actual_score: String,
    pub home_win_probability: f64,
    pub band: String,
    pub correct: bool,
    pub key_factors: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceBand {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub description: String,
    pub games: usize,
    /// Observed pick accuracy this season; `None` with no games in the band.
    pub typical_accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceGuide {
    pub bands: Vec<ConfidenceBand>,
    pub tips: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleGameReport {
    pub base: ValidationResult,
    pub games: Vec<GameExplanation>,
    pub guide: ConfidenceGuide,
}

pub fn band_name(confidence: f64) -> &'static str {
    BANDS
        .iter()
        .find(|(_, lower, upper, _)| confidence >= *lower && confidence < *upper)
        .map(|(name, ..)| *name)
        .unwrap_or("Strong")
}

/// Picks up to `count` games: the notable extremes first, then an even
/// spread of the rest.
pub fn select_sample_games(
    predictions: &[BacktestPrediction],
    count: usize,
) -> Vec<(SampleReason, &BacktestPrediction)> {
    let by = |f: fn(&BacktestPrediction) -> f64| {
        move |a: &&BacktestPrediction, b: &&BacktestPrediction| f(a).total_cmp(&f(b))
    };
    let confidence: fn(&BacktestPrediction) -> f64 = pick_confidence;
    let closeness: fn(&BacktestPrediction) -> f64 = |p| -p.actual_margin().abs();
    let spread: fn(&BacktestPrediction) -> f64 = |p| p.actual_margin().abs();

    let candidates = [
        (
            SampleReason::MostConfidentHit,
            predictions.iter().filter(|p| p.picked_correctly()).max_by(by(confidence)),
        ),
        (
            SampleReason::MostConfidentMiss,
            predictions.iter().filter(|p| !p.picked_correctly()).max_by(by(confidence)),
        ),
        (SampleReason::ClosestGame, predictions.iter().max_by(by(closeness))),
        (SampleReason::BiggestBlowout, predictions.iter().max_by(by(spread))),
    ];

    let mut selected: Vec<(SampleReason, &BacktestPrediction)> = Vec::new();
    for (reason, game) in candidates {
        if let Some(game) = game {
            if selected.len() < count && !selected.iter().any(|(_, s)| s.game_id == game.game_id) {
                selected.push((reason, game));
            }
        }
    }

    let remaining: Vec<&BacktestPrediction> = predictions
        .iter()
        .filter(|p| !selected.iter().any(|(_, s)| s.game_id == p.game_id))
        .collect();
    let fill = count.saturating_sub(selected.len());
    for game in stride_sample(&remaining, fill) {
        selected.push((SampleReason::Representative, game));
    }
    selected
}

pub fn explain(reason: SampleReason, p: &BacktestPrediction) -> GameExplanation {
    let favorite_is_home = p.home_win_probability >= 0.5;
    let (favorite, underdog) = if favorite_is_home {
        (&p.home_team_id, &p.away_team_id)
    } else {
        (&p.away_team_id, &p.home_team_id)
    };
    let confidence = pick_confidence(p);
    let band = band_name(confidence);
    let error = p.predicted_margin() - p.actual_margin();

    let mut key_factors = vec![format!(
        "Model favored {} over {} with {:.0}% win probability",
        favorite,
        underdog,
        confidence * 100.0
    )];
    key_factors.push(format!(
        "Projected margin {:+.1} for {}, actual {:+.0}",
        p.predicted_margin(),
        p.home_team_id,
        p.actual_margin()
    ));
    key_factors.push(match p.game_type {
        GameType::NeutralSite => "Neutral site: no home-field adjustment".to_string(),
        GameType::Conference => format!("Conference game with home-field edge for {}", p.home_team_id),
        GameType::NonConference => format!("Non-conference game with home-field edge for {}", p.home_team_id),
    });
    key_factors.push(format!("Efficiency profiles rated {} confidence", p.confidence_level));
    if error.abs() >= 14.0 {
        key_factors.push(format!("Margin missed by {:.1} points", error.abs()));
    }

    let correct = p.picked_correctly();
    let summary = format!(
        "{}: {} pick on {} {}; predicted {:.0}-{:.0}, finished {:.0}-{:.0}",
        reason,
        band,
        favorite,
        if correct { "was right" } else { "was wrong" },
        p.predicted_home,
        p.predicted_away,
        p.actual_home,
        p.actual_away
    );

    let separator = if p.game_type == GameType::NeutralSite { "vs" } else { "@" };
    GameExplanation {
        game_id: p.game_id.clone(),
        reason,
        matchup: format!("{} {} {}", p.away_team_id, separator, p.home_team_id),
        predicted_score: format!("{:.0}-{:.0}", p.predicted_away, p.predicted_home),
        actual_score: format!("{:.0}-{:.0}", p.actual_away, p.actual_home),
        home_win_probability: round_to(p.home_win_probability, 3),
        band: band.to_string(),
        correct,
        key_factors,
        summary,
    }
}

pub fn build_confidence_guide(report: &AccuracyReport) -> ConfidenceGuide {
    let bands: Vec<ConfidenceBand> = BANDS
        .iter()
        .map(|(name, lower, upper, description)| {
            let members: Vec<&BacktestPrediction> = report
                .predictions
                .iter()
                .filter(|p| band_name(pick_confidence(p)) == *name)
                .collect();
            let hits = members.iter().filter(|p| p.picked_correctly()).count();
            ConfidenceBand {
                name: name.to_string(),
                lower: *lower,
                upper: *upper,
                description: description.to_string(),
                games: members.len(),
                typical_accuracy: (!members.is_empty()).then(|| hits as f64 / members.len() as f64),
            }
        })
        .collect();

    let mut tips = vec![
        "Win probability is the chance the favorite wins, not a point spread".to_string(),
        "Toss-up and Lean picks should be read as close games either way".to_string(),
    ];
    if band_accuracy_inversions(&bands) > 0 {
        tips.push("Higher bands have not been more accurate this season; weigh Strong picks with care".to_string());
    }
    if let Some(scores) = &report.score_metrics {
        tips.push(format!(
            "Projected margins have missed by {:.1} points on average",
            scores.margin_mae
        ));
    }
    for bias in &report.biases {
        tips.push(format!("Adjust mentally: {}", bias.description));
    }
    if report.predictions.len() < 20 {
        tips.push("Few games have been backtested; band accuracies are still noisy".to_string());
    }

    ConfidenceGuide { bands, tips }
}

/// Adjacent populated bands where the higher band was less accurate.
fn band_accuracy_inversions(bands: &[ConfidenceBand]) -> usize {
    let observed: Vec<f64> = bands.iter().filter_map(|b| b.typical_accuracy).collect();
    observed.windows(2).filter(|w| w[1] < w[0]).count()
}

/// Explains a handful of backtested games and turns the tester's numbers
/// into an operator-facing guide.
pub struct SampleGameAnalyzer {
    tester: Arc<PredictionAccuracyTester>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
}

impl SampleGameAnalyzer {
    pub fn new(tester: Arc<PredictionAccuracyTester>, clock: Arc<dyn Clock>, config: AuditConfig) -> Self {
        Self { tester, clock, config }
    }

    pub async fn evaluate(&self, season: i32) -> SampleGameReport {
        let accuracy = self.tester.evaluate(season).await;
        self.analyze(&accuracy)
    }

    pub fn analyze(&self, accuracy: &AccuracyReport) -> SampleGameReport {
        let mut base = ValidationResult::new(self.clock.now());

        if accuracy.base.has_code(DATA_UNAVAILABLE) {
            for issue in accuracy.base.errors.iter().filter(|e| e.code == DATA_UNAVAILABLE) {
                base.error(DATA_UNAVAILABLE, issue.message.clone(), issue.severity);
            }
            base.finish(
                SubScores {
                    completeness: 0.0,
                    consistency: 0.0,
                    validity: 0.0,
                },
                false,
            );
            return SampleGameReport {
                base,
                games: Vec::new(),
                guide: ConfidenceGuide::default(),
            };
        }

        let games: Vec<GameExplanation> = select_sample_games(&accuracy.predictions, self.config.sample_games)
            .into_iter()
            .map(|(reason, p)| explain(reason, p))
            .collect();
        let guide = build_confidence_guide(accuracy);

        if games.is_empty() {
            base.error(
                "NO_SAMPLE_GAMES",
                "No backtested games available to explain",
                Severity::Medium,
            );
            base.recommend("Run the accuracy backtest once enough games are final");
        }
        if !games.iter().any(|g| !g.correct) && !games.is_empty() {
            base.warn("Sample contains no missed picks; failure modes are not illustrated");
        }

        let wanted = self.config.sample_games.min(accuracy.predictions.len());
        let populated = guide.bands.iter().filter(|b| b.games > 0).count();
        let pairs = populated.saturating_sub(1);
        let inversions = band_accuracy_inversions(&guide.bands);
        let explained = games.iter().filter(|g| !g.key_factors.is_empty()).count();

        let is_valid = base.errors.is_empty();
        base.finish(
            SubScores {
                completeness: percent(games.len(), wanted),
                consistency: percent(pairs - inversions, pairs),
                validity: if games.is_empty() { 0.0 } else { percent(explained, games.len()) },
            },
            is_valid,
        );

        SampleGameReport { base, games, guide }
    }
}

#[async_trait]
impl Validator for SampleGameAnalyzer {
    fn name(&self) -> &'static str {
        "sample-games"
    }

    async fn validate(&self, season: i32) -> AuditReport {
        AuditReport::SampleGames(self.evaluate(season).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::MemoryStore;
    use crate::models::ConfidenceLevel;
    use crate::services::PredictionEngine;
    use crate::utils::SystemClock;
    use chrono::Utc;

    fn backtest(id: &str, p_home: f64, actual: (f64, f64)) -> BacktestPrediction {
        BacktestPrediction {
            game_id: id.to_string(),
            week: 6,
            home_team_id: format!("{}-home", id),
            away_team_id: format!("{}-away", id),
            game_type: GameType::Conference,
            predicted_home: 27.0,
            predicted_away: 20.0,
            home_win_probability: p_home,
            confidence: 0.7,
            confidence_level: ConfidenceLevel::High,
            actual_home: actual.0,
            actual_away: actual.1,
        }
    }

    fn analyzer() -> SampleGameAnalyzer {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = Arc::new(PredictionEngine::new(store, clock.clone(), EngineConfig::default()));
        let tester = Arc::new(PredictionAccuracyTester::new(engine, clock.clone(), AuditConfig::default()));
        SampleGameAnalyzer::new(tester, clock, AuditConfig::default())
    }

    fn accuracy_report(predictions: Vec<BacktestPrediction>) -> AccuracyReport {
        AccuracyReport {
            base: ValidationResult::new(Utc::now()),
            sampled: predictions.len(),
            predictions,
            rejected: Vec::new(),
            failures: Vec::new(),
            win_metrics: None,
            score_metrics: None,
            calibration: None,
            biases: Vec::new(),
            by_confidence: Vec::new(),
            by_game_type: Vec::new(),
        }
    }

    #[test]
    fn test_band_names() {
        assert_eq!(band_name(0.5), "Toss-up");
        assert_eq!(band_name(0.6), "Lean");
        assert_eq!(band_name(0.7), "Solid");
        assert_eq!(band_name(0.95), "Strong");
        assert_eq!(band_name(1.0), "Strong");
    }

    #[test]
    fn test_selects_extremes_first() {
        let predictions = vec![
            backtest("hit", 0.9, (35.0, 10.0)),
            backtest("miss", 0.85, (14.0, 21.0)),
            backtest("close", 0.6, (21.0, 20.0)),
            backtest("rout", 0.7, (63.0, 3.0)),
            backtest("a", 0.55, (24.0, 17.0)),
            backtest("b", 0.52, (17.0, 24.0)),
        ];
        let selected = select_sample_games(&predictions, 5);
        let ids: Vec<(&SampleReason, &str)> = selected.iter().map(|(r, p)| (r, p.game_id.as_str())).collect();
        assert_eq!(ids[0], (&SampleReason::MostConfidentHit, "hit"));
        assert_eq!(ids[1], (&SampleReason::MostConfidentMiss, "miss"));
        assert_eq!(ids[2], (&SampleReason::ClosestGame, "close"));
        assert_eq!(ids[3], (&SampleReason::BiggestBlowout, "rout"));
        assert_eq!(selected.len(), 5);
        assert_eq!(selected[4].0, SampleReason::Representative);
    }

    #[test]
    fn test_explanation_mentions_favorite_and_neutral_site() {
        let mut p = backtest("g", 0.3, (17.0, 24.0));
        p.game_type = GameType::NeutralSite;
        let explanation = explain(SampleReason::Representative, &p);
        assert_eq!(explanation.matchup, "g-away vs g-home");
        assert!(explanation.key_factors[0].starts_with("Model favored g-away"));
        assert!(explanation.key_factors.iter().any(|f| f.starts_with("Neutral site")));
        assert!(explanation.correct);
        assert_eq!(explanation.band, "Solid");
    }

    #[test]
    fn test_guide_flags_inverted_bands() {
        let report = accuracy_report(vec![
            backtest("l1", 0.6, (24.0, 17.0)),
            backtest("l2", 0.6, (24.0, 17.0)),
            backtest("s1", 0.9, (17.0, 24.0)),
            backtest("s2", 0.9, (17.0, 24.0)),
        ]);
        let guide = build_confidence_guide(&report);
        assert_eq!(guide.bands.len(), 4);
        assert_eq!(guide.bands[1].typical_accuracy, Some(1.0));
        assert_eq!(guide.bands[3].typical_accuracy, Some(0.0));
        assert_eq!(guide.bands[0].typical_accuracy, None);
        assert!(guide.tips.iter().any(|t| t.starts_with("Higher bands")));

        let report = analyzer().analyze(&report);
        assert!(report.base.is_valid);
        assert!(report.base.score < 100.0);
        assert_eq!(report.games.len(), 4);
    }

    #[test]
    fn test_empty_backtest_is_an_error() {
        let report = analyzer().analyze(&accuracy_report(Vec::new()));
        assert!(report.base.has_code("NO_SAMPLE_GAMES"));
        assert!(!report.base.is_valid);
    }

    #[tokio::test]
    async fn test_propagates_unavailable_data() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_reads(true);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = Arc::new(PredictionEngine::new(store, clock.clone(), EngineConfig::default()));
        let tester = Arc::new(PredictionAccuracyTester::new(engine, clock.clone(), AuditConfig::default()));
        let report = SampleGameAnalyzer::new(tester, clock, AuditConfig::default())
            .evaluate(2024)
            .await;
        assert!(report.base.has_code(DATA_UNAVAILABLE));
        assert!(report.games.is_empty());
    }
}
