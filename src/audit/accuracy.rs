use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::audit::{percent, AuditReport, Severity, SubScores, ValidationResult, Validator};
use crate::config::AuditConfig;
use crate::models::GameRecord;
use crate::services::{BacktestPrediction, PredictionEngine, SeasonData};
use crate::utils::{mean, median, stride_sample, Clock};

/// Scores above this are treated as data errors.
const MAX_REALISTIC_SCORE: i32 = 200;
/// Calibration gap tolerated before a bin counts as over- or under-confident.
const CALIBRATION_SLACK: f64 = 0.05;
const ECE_WARNING: f64 = 0.15;
const MIN_ACCURACY: f64 = 0.55;
/// Minimum games per half before the score-range split is judged.
const MIN_RANGE_SAMPLE: usize = 4;

// ── Report types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedGame {
    pub game_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WinMetrics {
    pub accuracy: f64,
    pub brier_score: f64,
    pub log_loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `None` when every game went the same way.
    pub roc_auc: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub median_ae: f64,
    pub margin_mae: f64,
    /// Mean signed error (predicted − actual) of the home score.
    pub home_bias: f64,
    pub away_bias: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_confidence: f64,
    pub observed_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    pub bins: Vec<CalibrationBin>,
    pub expected_calibration_error: f64,
    pub maximum_calibration_error: f64,
    /// Share of predictions sitting in bins whose stated confidence exceeds
    /// observed accuracy.
    pub over_confidence_rate: f64,
    pub under_confidence_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BiasKind {
    HomeTeam,
    AwayTeam,
    HighScoring,
    LowScoring,
}

impl fmt::Display for BiasKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BiasKind::HomeTeam => "home team",
            BiasKind::AwayTeam => "away team",
            BiasKind::HighScoring => "high-scoring games",
            BiasKind::LowScoring => "low-scoring games",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedBias {
    pub kind: BiasKind,
    /// Mean signed error in points; positive means over-predicted.
    pub mean_error: f64,
    pub sample_size: usize,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityBucket {
    pub label: String,
    pub count: usize,
    pub accuracy: f64,
    pub margin_mae: f64,
    pub reliability: Reliability,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyReport {
    pub base: ValidationResult,
    pub sampled: usize,
    pub predictions: Vec<BacktestPrediction>,
    pub rejected: Vec<SkippedGame>,
    pub failures: Vec<SkippedGame>,
    pub win_metrics: Option<WinMetrics>,
    pub score_metrics: Option<ScoreMetrics>,
    pub calibration: Option<Calibration>,
    pub biases: Vec<DetectedBias>,
    pub by_confidence: Vec<ReliabilityBucket>,
    pub by_game_type: Vec<ReliabilityBucket>,
}

impl AccuracyReport {
    fn empty(base: ValidationResult) -> Self {
        Self {
            base,
            sampled: 0,
            predictions: Vec::new(),
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
}

// ── Metrics ──────────────────────────────────────────────────────────────────

/// Classification metrics with "home team wins" as the positive class.
pub fn win_metrics(predictions: &[BacktestPrediction]) -> WinMetrics {
    let n = predictions.len() as f64;
    let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
    let mut correct = 0.0;
    let mut brier = 0.0;
    let mut log_loss = 0.0;

    for p in predictions {
        let y = if p.home_won() { 1.0 } else { 0.0 };
        let prob = p.home_win_probability;
        let predicted_home = prob >= 0.5;
        if p.picked_correctly() {
            correct += 1.0;
        }
        match (predicted_home, p.home_won()) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fn_ += 1.0,
            (false, false) => {}
        }
        brier += (prob - y).powi(2);
        let clamped = prob.clamp(1e-15, 1.0 - 1e-15);
        log_loss -= y * clamped.ln() + (1.0 - y) * (1.0 - clamped).ln();
    }

    let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    WinMetrics {
        accuracy: ratio(correct, n),
        brier_score: ratio(brier, n),
        log_loss: ratio(log_loss, n),
        precision,
        recall,
        f1: ratio(2.0 * precision * recall, precision + recall),
        roc_auc: roc_auc(predictions),
    }
}

/// Mann-Whitney estimate: the probability a random home win was given a
/// higher home-win probability than a random home loss.
pub fn roc_auc(predictions: &[BacktestPrediction]) -> Option<f64> {
    let (wins, losses): (Vec<&BacktestPrediction>, Vec<&BacktestPrediction>) =
        predictions.iter().partition(|p| p.home_won());
    if wins.is_empty() || losses.is_empty() {
        return None;
    }
    let mut concordant = 0.0;
    for w in &wins {
        for l in &losses {
            if w.home_win_probability > l.home_win_probability {
                concordant += 1.0;
            } else if w.home_win_probability == l.home_win_probability {
                concordant += 0.5;
            }
        }
    }
    Some(concordant / (wins.len() * losses.len()) as f64)
}

pub fn score_metrics(predictions: &[BacktestPrediction]) -> ScoreMetrics {
    let abs_errors: Vec<f64> = predictions
        .iter()
        .flat_map(|p| {
            [
                (p.predicted_home - p.actual_home).abs(),
                (p.predicted_away - p.actual_away).abs(),
            ]
        })
        .collect();
    let squared: Vec<f64> = abs_errors.iter().map(|e| e * e).collect();
    let margin_errors: Vec<f64> = predictions
        .iter()
        .map(|p| (p.predicted_margin() - p.actual_margin()).abs())
        .collect();
    let home: Vec<f64> = predictions.iter().map(|p| p.predicted_home - p.actual_home).collect();
    let away: Vec<f64> = predictions.iter().map(|p| p.predicted_away - p.actual_away).collect();

    ScoreMetrics {
        mae: mean(&abs_errors),
        rmse: mean(&squared).sqrt(),
        median_ae: median(&abs_errors),
        margin_mae: mean(&margin_errors),
        home_bias: mean(&home),
        away_bias: mean(&away),
    }
}

/// Probability assigned to the side that was picked, in [0.5, 1].
pub fn pick_confidence(p: &BacktestPrediction) -> f64 {
    p.home_win_probability.max(1.0 - p.home_win_probability)
}

/// Reliability diagram over pick confidence, `bins` equal-width bins
/// spanning [0.5, 1].
pub fn calibration(predictions: &[BacktestPrediction], bins: usize) -> Calibration {
    let bins = bins.max(1);
    let width = 0.5 / bins as f64;
    let mut grouped: Vec<Vec<&BacktestPrediction>> = vec![Vec::new(); bins];
    for p in predictions {
        let index = (((pick_confidence(p) - 0.5) / width).floor().max(0.0) as usize).min(bins - 1);
        grouped[index].push(p);
    }

    let total = predictions.len() as f64;
    let mut ece = 0.0;
    let mut mce: f64 = 0.0;
    let mut over = 0usize;
    let mut under = 0usize;
    let bins = grouped
        .iter()
        .enumerate()
        .map(|(i, members)| {
            let confidences: Vec<f64> = members.iter().map(|p| pick_confidence(p)).collect();
            let hits = members.iter().filter(|p| p.picked_correctly()).count();
            let mean_confidence = mean(&confidences);
            let observed_accuracy = if members.is_empty() {
                0.0
            } else {
                hits as f64 / members.len() as f64
            };
            if !members.is_empty() {
                let gap = mean_confidence - observed_accuracy;
                ece += members.len() as f64 / total * gap.abs();
                mce = mce.max(gap.abs());
                if gap > CALIBRATION_SLACK {
                    over += members.len();
                } else if gap < -CALIBRATION_SLACK {
                    under += members.len();
                }
            }
            CalibrationBin {
                lower: 0.5 + i as f64 * width,
                upper: 0.5 + (i + 1) as f64 * width,
                count: members.len(),
                mean_confidence,
                observed_accuracy,
            }
        })
        .collect();

    let rate = |count: usize| if total > 0.0 { count as f64 / total } else { 0.0 };
    Calibration {
        bins,
        expected_calibration_error: ece,
        maximum_calibration_error: mce,
        over_confidence_rate: rate(over),
        under_confidence_rate: rate(under),
    }
}

/// Side and score-range biases whose mean signed error exceeds `threshold`
/// points. Score ranges split the sample at the median actual total.
pub fn detect_biases(predictions: &[BacktestPrediction], threshold: f64) -> Vec<DetectedBias> {
    let mut biases = Vec::new();
    let mut check = |kind: BiasKind, errors: Vec<f64>| {
        let mean_error = mean(&errors);
        if errors.is_empty() || mean_error.abs() <= threshold {
            return;
        }
        let direction = if mean_error > 0.0 { "over-predicted" } else { "under-predicted" };
        biases.push(DetectedBias {
            kind,
            mean_error,
            sample_size: errors.len(),
            description: format!(
                "Scores for {} are {} by {:.1} points on average",
                kind,
                direction,
                mean_error.abs()
            ),
        });
    };

    check(
        BiasKind::HomeTeam,
        predictions.iter().map(|p| p.predicted_home - p.actual_home).collect(),
    );
    check(
        BiasKind::AwayTeam,
        predictions.iter().map(|p| p.predicted_away - p.actual_away).collect(),
    );

    let totals: Vec<f64> = predictions.iter().map(|p| p.actual_home + p.actual_away).collect();
    let cut = median(&totals);
    let total_error = |p: &BacktestPrediction| (p.predicted_home + p.predicted_away) - (p.actual_home + p.actual_away);
    let high: Vec<f64> = predictions
        .iter()
        .filter(|p| p.actual_home + p.actual_away > cut)
        .map(total_error)
        .collect();
    let low: Vec<f64> = predictions
        .iter()
        .filter(|p| p.actual_home + p.actual_away <= cut)
        .map(total_error)
        .collect();
    if high.len() >= MIN_RANGE_SAMPLE && low.len() >= MIN_RANGE_SAMPLE {
        check(BiasKind::HighScoring, high);
        check(BiasKind::LowScoring, low);
    }
    biases
}

fn rate(accuracy: f64, count: usize) -> Reliability {
    if count < 3 {
        Reliability::Low
    } else if accuracy >= 0.65 {
        Reliability::High
    } else if accuracy >= MIN_ACCURACY {
        Reliability::Medium
    } else {
        Reliability::Low
    }
}

/// Pick accuracy grouped by `key`, in key order.
pub fn reliability_by<K, F>(predictions: &[BacktestPrediction], key: F) -> Vec<ReliabilityBucket>
where
    K: Ord + fmt::Display,
    F: Fn(&BacktestPrediction) -> K,
{
    let mut groups: BTreeMap<K, Vec<&BacktestPrediction>> = BTreeMap::new();
    for p in predictions {
        groups.entry(key(p)).or_default().push(p);
    }
    groups
        .into_iter()
        .map(|(label, members)| {
            let hits = members.iter().filter(|p| p.picked_correctly()).count();
            let accuracy = hits as f64 / members.len() as f64;
            let margins: Vec<f64> = members
                .iter()
                .map(|p| (p.predicted_margin() - p.actual_margin()).abs())
                .collect();
            ReliabilityBucket {
                label: label.to_string(),
                count: members.len(),
                accuracy,
                margin_mae: mean(&margins),
                reliability: rate(accuracy, members.len()),
            }
        })
        .collect()
}

// ── Tester ───────────────────────────────────────────────────────────────────

/// Backtests a sample of finished games through the live pipeline and grades
/// the results.
pub struct PredictionAccuracyTester {
    engine: Arc<PredictionEngine>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
}

impl PredictionAccuracyTester {
    pub fn new(engine: Arc<PredictionEngine>, clock: Arc<dyn Clock>, config: AuditConfig) -> Self {
        Self { engine, clock, config }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Finished, data-complete games with enough history on both sides,
    /// plus the games turned away and why.
    pub fn eligible_games(&self, data: &SeasonData) -> (Vec<GameRecord>, Vec<SkippedGame>) {
        let mut finished: Vec<&GameRecord> = data.games.iter().filter(|g| g.is_finished()).collect();
        finished.sort_by_key(|g| g.order_key());

        let mut eligible = Vec::new();
        let mut rejected = Vec::new();
        for game in &finished {
            match self.rejection_reason(game, data) {
                Some(reason) => rejected.push(SkippedGame {
                    game_id: game.id.clone(),
                    reason,
                }),
                None => eligible.push((*game).clone()),
            }
        }
        (eligible, rejected)
    }

    fn rejection_reason(&self, game: &GameRecord, data: &SeasonData) -> Option<String> {
        let (Some(home), Some(away)) = (game.home_score, game.away_score) else {
            return Some("missing final score".to_string());
        };
        if !(0..=MAX_REALISTIC_SCORE).contains(&home) || !(0..=MAX_REALISTIC_SCORE).contains(&away) {
            return Some(format!("unrealistic score {}-{}", home, away));
        }
        for team in [&game.home_team_id, &game.away_team_id] {
            let complete = data
                .stats
                .iter()
                .any(|s| s.game_id == game.id && &s.team_id == team && s.stat_line().is_some());
            if !complete {
                return Some(format!("incomplete box score for {}", team));
            }
            let prior = data
                .games
                .iter()
                .filter(|g| g.is_finished() && g.involves(team) && g.order_key() < game.order_key())
                .count();
            if prior < self.config.min_prior_games {
                return Some(format!("{} has only {} prior games", team, prior));
            }
        }
        None
    }

    pub async fn evaluate(&self, season: i32) -> AccuracyReport {
        let now = self.clock.now();
        let data = match self.engine.season_data(season).await {
            Ok(data) => data,
            Err(e) => return AccuracyReport::empty(ValidationResult::unavailable(now, "season games", e)),
        };

        let (eligible, rejected) = self.eligible_games(&data);
        let sample = stride_sample(&eligible, self.config.backtest_sample_size);
        let history = self.engine.weights().weight_history(season).await;

        let mut predictions = Vec::with_capacity(sample.len());
        let mut failures = Vec::new();
        for game in &sample {
            match self.engine.backtest_game(game, &data, &history).await {
                Ok(prediction) => predictions.push(prediction),
                Err(e) => {
                    tracing::warn!("Backtest of {} failed: {}", game.id, e);
                    failures.push(SkippedGame {
                        game_id: game.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            "Backtested {} of {} sampled games for {} ({} rejected)",
            predictions.len(),
            sample.len(),
            season,
            rejected.len()
        );

        let mut report = AccuracyReport {
            sampled: sample.len(),
            predictions,
            rejected,
            failures,
            ..AccuracyReport::empty(ValidationResult::new(now))
        };
        self.grade(&mut report);
        report
    }

    /// Fills metrics and the base result from `report.predictions`.
    pub fn grade(&self, report: &mut AccuracyReport) {
        let base = &mut report.base;

        if report.failures.len() * 2 > report.sampled {
            base.error(
                "HIGH_FAILURE_RATE",
                format!("{} of {} backtests failed", report.failures.len(), report.sampled),
                Severity::High,
            );
        } else if !report.failures.is_empty() {
            base.warn(format!("{} backtests failed", report.failures.len()));
        }

        if report.predictions.is_empty() {
            base.error(
                "NO_PREDICTIONS",
                "No finished games could be backtested",
                Severity::High,
            );
            base.recommend("Load more completed games with full box scores");
            base.finish(
                SubScores {
                    completeness: 0.0,
                    consistency: 0.0,
                    validity: 0.0,
                },
                false,
            );
            return;
        }

        let predictions = &report.predictions;
        let win = win_metrics(predictions);
        let scores = score_metrics(predictions);
        let calibration = calibration(predictions, self.config.calibration_bins);
        let biases = detect_biases(predictions, self.config.bias_threshold_points);

        if win.accuracy < MIN_ACCURACY {
            base.warn(format!("Pick accuracy {:.1}% is below {:.0}%", win.accuracy * 100.0, MIN_ACCURACY * 100.0));
            base.recommend("Rerun the regression and reapply weights");
        }
        if calibration.expected_calibration_error > ECE_WARNING {
            base.warn(format!(
                "Expected calibration error {:.3} exceeds {:.2}",
                calibration.expected_calibration_error, ECE_WARNING
            ));
            base.recommend("Review the margin standard deviation used for win probabilities");
        }
        for bias in &biases {
            base.warn(bias.description.clone());
        }
        if !biases.is_empty() {
            base.recommend("Recalibrate home-field and scoring blend settings against recent results");
        }

        report.by_confidence = reliability_by(predictions, |p| p.confidence_level);
        report.by_game_type = reliability_by(predictions, |p| p.game_type.as_str());

        let is_valid = base.errors.is_empty();
        base.finish(
            SubScores {
                completeness: percent(predictions.len(), report.sampled),
                consistency: (100.0 * (1.0 - calibration.expected_calibration_error)).clamp(0.0, 100.0),
                validity: win.accuracy * 100.0,
            },
            is_valid,
        );

        report.win_metrics = Some(win);
        report.score_metrics = Some(scores);
        report.calibration = Some(calibration);
        report.biases = biases;
    }
}

#[async_trait]
impl Validator for PredictionAccuracyTester {
    fn name(&self) -> &'static str {
        "prediction-accuracy"
    }

    async fn validate(&self, season: i32) -> AuditReport {
        AuditReport::PredictionAccuracy(self.evaluate(season).await)
    }
}
