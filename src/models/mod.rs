use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub const METHOD_EFFICIENCY_MATCHUP: &str = "efficiency-matchup";
pub const METHOD_FALLBACK_BASELINE: &str = "fallback-baseline";

/// Opponent baselines below one unit (e.g. a defense that averages 0.4
/// interceptions) would blow up relative efficiencies.
const RELATIVE_BASELINE_FLOOR: f64 = 1.0;

// ── Raw game data (read-only to the engine) ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub conference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameType {
    Conference,
    NonConference,
    NeutralSite,
}

impl GameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameType::Conference => "conference",
            GameType::NonConference => "non-conference",
            GameType::NeutralSite => "neutral-site",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub season: i32,
    pub week: u32,
    pub home_team_id: String,
    pub away_team_id: String,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub completed: bool,
    pub neutral_site: bool,
    pub conference_game: bool,
    pub start_date: DateTime<Utc>,
}

impl GameRecord {
    pub fn is_finished(&self) -> bool {
        self.completed && self.home_score.is_some() && self.away_score.is_some()
    }

    pub fn involves(&self, team_id: &str) -> bool {
        self.home_team_id == team_id || self.away_team_id == team_id
    }

    pub fn opponent_of(&self, team_id: &str) -> Option<&str> {
        if self.home_team_id == team_id {
            Some(&self.away_team_id)
        } else if self.away_team_id == team_id {
            Some(&self.home_team_id)
        } else {
            None
        }
    }

    /// Points scored and allowed by `team_id`, if the game is finished.
    pub fn score_for(&self, team_id: &str) -> Option<(i32, i32)> {
        let (home, away) = (self.home_score?, self.away_score?);
        if self.home_team_id == team_id {
            Some((home, away))
        } else if self.away_team_id == team_id {
            Some((away, home))
        } else {
            None
        }
    }

    pub fn game_type(&self) -> GameType {
        if self.neutral_site {
            GameType::NeutralSite
        } else if self.conference_game {
            GameType::Conference
        } else {
            GameType::NonConference
        }
    }

    /// Chronological ordering key used wherever "games before this one" matters.
    pub fn order_key(&self) -> (u32, DateTime<Utc>) {
        (self.week, self.start_date)
    }
}

/// One team's box score in one game. Every field is optional because the
/// upstream feed is incomplete; the data-pipeline audit grades the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamGameStats {
    pub game_id: String,
    pub team_id: String,
    pub points: Option<f64>,
    pub total_yards: Option<f64>,
    pub passing_yards: Option<f64>,
    pub rushing_yards: Option<f64>,
    pub turnovers: Option<f64>,
    pub interceptions: Option<f64>,
    pub sacks: Option<f64>,
    pub field_goals: Option<f64>,
    pub success_rate: Option<f64>,
    pub explosiveness: Option<f64>,
    pub third_down_rate: Option<f64>,
}

impl TeamGameStats {
    /// The box score as a complete stat line. Yardage and points are required;
    /// the low-volume counting stats default to zero.
    pub fn stat_line(&self) -> Option<StatLine> {
        Some(StatLine {
            total_yards: self.total_yards?,
            passing_yards: self.passing_yards?,
            rushing_yards: self.rushing_yards?,
            scoring: self.points?,
            interceptions: self.interceptions.unwrap_or(0.0),
            sacks: self.sacks.unwrap_or(0.0),
            field_goals: self.field_goals.unwrap_or(0.0),
        })
    }
}

// ── Statistical categories ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatCategory {
    TotalYards,
    PassingYards,
    RushingYards,
    Scoring,
    Interceptions,
    Sacks,
    FieldGoals,
}

impl StatCategory {
    pub const ALL: [StatCategory; 7] = [
        StatCategory::TotalYards,
        StatCategory::PassingYards,
        StatCategory::RushingYards,
        StatCategory::Scoring,
        StatCategory::Interceptions,
        StatCategory::Sacks,
        StatCategory::FieldGoals,
    ];

    /// Categories the matchup model predicts for each side.
    pub const PREDICTED: [StatCategory; 4] = [
        StatCategory::TotalYards,
        StatCategory::PassingYards,
        StatCategory::RushingYards,
        StatCategory::Scoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatCategory::TotalYards => "totalYards",
            StatCategory::PassingYards => "passingYards",
            StatCategory::RushingYards => "rushingYards",
            StatCategory::Scoring => "scoring",
            StatCategory::Interceptions => "interceptions",
            StatCategory::Sacks => "sacks",
            StatCategory::FieldGoals => "fieldGoals",
        }
    }
}

impl fmt::Display for StatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "totalYards" | "total_yards" => Ok(StatCategory::TotalYards),
            "passingYards" | "passing_yards" => Ok(StatCategory::PassingYards),
            "rushingYards" | "rushing_yards" => Ok(StatCategory::RushingYards),
            "scoring" | "points" => Ok(StatCategory::Scoring),
            "interceptions" => Ok(StatCategory::Interceptions),
            "sacks" => Ok(StatCategory::Sacks),
            "fieldGoals" | "field_goals" => Ok(StatCategory::FieldGoals),
            other => Err(EngineError::UnsupportedCategory(other.to_string())),
        }
    }
}

/// One value per statistical category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatLine {
    pub total_yards: f64,
    pub passing_yards: f64,
    pub rushing_yards: f64,
    pub scoring: f64,
    pub interceptions: f64,
    pub sacks: f64,
    pub field_goals: f64,
}

impl StatLine {
    pub fn from_fn(mut f: impl FnMut(StatCategory) -> f64) -> Self {
        let mut line = StatLine::default();
        for category in StatCategory::ALL {
            line.set(category, f(category));
        }
        line
    }

    pub fn get(&self, category: StatCategory) -> f64 {
        match category {
            StatCategory::TotalYards => self.total_yards,
            StatCategory::PassingYards => self.passing_yards,
            StatCategory::RushingYards => self.rushing_yards,
            StatCategory::Scoring => self.scoring,
            StatCategory::Interceptions => self.interceptions,
            StatCategory::Sacks => self.sacks,
            StatCategory::FieldGoals => self.field_goals,
        }
    }

    pub fn set(&mut self, category: StatCategory, value: f64) {
        match category {
            StatCategory::TotalYards => self.total_yards = value,
            StatCategory::PassingYards => self.passing_yards = value,
            StatCategory::RushingYards => self.rushing_yards = value,
            StatCategory::Scoring => self.scoring = value,
            StatCategory::Interceptions => self.interceptions = value,
            StatCategory::Sacks => self.sacks = value,
            StatCategory::FieldGoals => self.field_goals = value,
        }
    }

    pub fn is_finite(&self) -> bool {
        StatCategory::ALL.iter().all(|c| self.get(*c).is_finite())
    }
}

// ── Per-game performance ─────────────────────────────────────────────────────

/// What a specific opponent typically allows and produces per game.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentBaseline {
    pub allowed: StatLine,
    pub produced: StatLine,
    pub games: u32,
}

/// Opponent-relative efficiency for one game. Positive is better than the
/// opponent's norm on both sides of the ball.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyDeltas {
    pub offense: StatLine,
    pub defense: StatLine,
    pub offense_relative: StatLine,
    pub defense_relative: StatLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePerformanceRecord {
    pub game_id: String,
    pub team_id: String,
    pub opponent_id: String,
    pub season: i32,
    pub week: u32,
    pub is_home: bool,
    pub produced: StatLine,
    pub allowed: StatLine,
    pub opponent_baseline: OpponentBaseline,
    deltas: EfficiencyDeltas,
}

impl GamePerformanceRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        game_id: impl Into<String>,
        team_id: impl Into<String>,
        opponent_id: impl Into<String>,
        season: i32,
        week: u32,
        is_home: bool,
        produced: StatLine,
        allowed: StatLine,
        opponent_baseline: OpponentBaseline,
    ) -> Self {
        let offense = StatLine::from_fn(|c| produced.get(c) - opponent_baseline.allowed.get(c));
        let defense = StatLine::from_fn(|c| opponent_baseline.produced.get(c) - allowed.get(c));
        let offense_relative = StatLine::from_fn(|c| {
            offense.get(c) / opponent_baseline.allowed.get(c).max(RELATIVE_BASELINE_FLOOR)
        });
        let defense_relative = StatLine::from_fn(|c| {
            defense.get(c) / opponent_baseline.produced.get(c).max(RELATIVE_BASELINE_FLOOR)
        });

        Self {
            game_id: game_id.into(),
            team_id: team_id.into(),
            opponent_id: opponent_id.into(),
            season,
            week,
            is_home,
            produced,
            allowed,
            opponent_baseline,
            deltas: EfficiencyDeltas {
                offense,
                defense,
                offense_relative,
                defense_relative,
            },
        }
    }

    pub fn deltas(&self) -> &EfficiencyDeltas {
        &self.deltas
    }

    /// Single-number quality of the performance: mean relative efficiency over
    /// the yardage and scoring categories, offense and defense together.
    pub fn quality_score(&self) -> f64 {
        let sum: f64 = StatCategory::PREDICTED
            .iter()
            .map(|c| self.deltas.offense_relative.get(*c) + self.deltas.defense_relative.get(*c))
            .sum();
        sum / (2 * StatCategory::PREDICTED.len()) as f64
    }
}

// ── Season profiles ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::High => "High",
        }
    }

    pub fn raised(self) -> Self {
        match self {
            ConfidenceLevel::Low => ConfidenceLevel::Medium,
            ConfidenceLevel::Medium | ConfidenceLevel::High => ConfidenceLevel::High,
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(ConfidenceLevel::Low),
            "Medium" => Ok(ConfidenceLevel::Medium),
            "High" => Ok(ConfidenceLevel::High),
            other => Err(EngineError::InvalidInput(format!(
                "unknown confidence level '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamEfficiencyProfile {
    pub team_id: String,
    pub season: i32,
    pub offensive: StatLine,
    pub defensive: StatLine,
    /// Raw per-game offensive output, used as the team's season average in
    /// prediction bounds checks.
    pub offensive_averages: StatLine,
    pub games_played: u32,
    pub convergence_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub blended_with_prior: bool,
    pub last_calculated: DateTime<Utc>,
}

// ── Weights ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WeightKey {
    PassingOffense,
    RushingOffense,
    ScoringEfficiency,
    PassingDefense,
    RushingDefense,
    TurnoverMargin,
    SpecialTeams,
    HomeFieldAdvantage,
}

impl WeightKey {
    pub const ALL: [WeightKey; 8] = [
        WeightKey::PassingOffense,
        WeightKey::RushingOffense,
        WeightKey::ScoringEfficiency,
        WeightKey::PassingDefense,
        WeightKey::RushingDefense,
        WeightKey::TurnoverMargin,
        WeightKey::SpecialTeams,
        WeightKey::HomeFieldAdvantage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightKey::PassingOffense => "passingOffense",
            WeightKey::RushingOffense => "rushingOffense",
            WeightKey::ScoringEfficiency => "scoringEfficiency",
            WeightKey::PassingDefense => "passingDefense",
            WeightKey::RushingDefense => "rushingDefense",
            WeightKey::TurnoverMargin => "turnoverMargin",
            WeightKey::SpecialTeams => "specialTeams",
            WeightKey::HomeFieldAdvantage => "homeFieldAdvantage",
        }
    }
}

impl fmt::Display for WeightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WeightKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WeightKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown weight '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticalImpactWeights {
    pub passing_offense: f64,
    pub rushing_offense: f64,
    pub scoring_efficiency: f64,
    pub passing_defense: f64,
    pub rushing_defense: f64,
    pub turnover_margin: f64,
    pub special_teams: f64,
    pub home_field_advantage: f64,
}

impl StatisticalImpactWeights {
    /// Used whenever no persisted vector exists or storage is unreachable.
    pub fn fallback() -> Self {
        Self {
            passing_offense: 0.25,
            rushing_offense: 0.20,
            scoring_efficiency: 0.30,
            passing_defense: 0.25,
            rushing_defense: 0.20,
            turnover_margin: 0.35,
            special_teams: 0.15,
            home_field_advantage: 0.10,
        }
    }

    pub fn get(&self, key: WeightKey) -> f64 {
        match key {
            WeightKey::PassingOffense => self.passing_offense,
            WeightKey::RushingOffense => self.rushing_offense,
            WeightKey::ScoringEfficiency => self.scoring_efficiency,
            WeightKey::PassingDefense => self.passing_defense,
            WeightKey::RushingDefense => self.rushing_defense,
            WeightKey::TurnoverMargin => self.turnover_margin,
            WeightKey::SpecialTeams => self.special_teams,
            WeightKey::HomeFieldAdvantage => self.home_field_advantage,
        }
    }

    pub fn set(&mut self, key: WeightKey, value: f64) {
        match key {
            WeightKey::PassingOffense => self.passing_offense = value,
            WeightKey::RushingOffense => self.rushing_offense = value,
            WeightKey::ScoringEfficiency => self.scoring_efficiency = value,
            WeightKey::PassingDefense => self.passing_defense = value,
            WeightKey::RushingDefense => self.rushing_defense = value,
            WeightKey::TurnoverMargin => self.turnover_margin = value,
            WeightKey::SpecialTeams => self.special_teams = value,
            WeightKey::HomeFieldAdvantage => self.home_field_advantage = value,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (WeightKey, f64)> + '_ {
        WeightKey::ALL.into_iter().map(move |k| (k, self.get(k)))
    }

    pub fn total(&self) -> f64 {
        self.iter().map(|(_, v)| v).sum()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        let mut out = *self;
        for key in WeightKey::ALL {
            out.set(key, self.get(key) * factor);
        }
        out
    }
}

impl Default for StatisticalImpactWeights {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Manual overrides; `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialWeights {
    pub passing_offense: Option<f64>,
    pub rushing_offense: Option<f64>,
    pub scoring_efficiency: Option<f64>,
    pub passing_defense: Option<f64>,
    pub rushing_defense: Option<f64>,
    pub turnover_margin: Option<f64>,
    pub special_teams: Option<f64>,
    pub home_field_advantage: Option<f64>,
}

impl PartialWeights {
    pub fn with(mut self, key: WeightKey, value: f64) -> Self {
        let slot = match key {
            WeightKey::PassingOffense => &mut self.passing_offense,
            WeightKey::RushingOffense => &mut self.rushing_offense,
            WeightKey::ScoringEfficiency => &mut self.scoring_efficiency,
            WeightKey::PassingDefense => &mut self.passing_defense,
            WeightKey::RushingDefense => &mut self.rushing_defense,
            WeightKey::TurnoverMargin => &mut self.turnover_margin,
            WeightKey::SpecialTeams => &mut self.special_teams,
            WeightKey::HomeFieldAdvantage => &mut self.home_field_advantage,
        };
        *slot = Some(value);
        self
    }

    pub fn merged_onto(&self, base: &StatisticalImpactWeights) -> StatisticalImpactWeights {
        StatisticalImpactWeights {
            passing_offense: self.passing_offense.unwrap_or(base.passing_offense),
            rushing_offense: self.rushing_offense.unwrap_or(base.rushing_offense),
            scoring_efficiency: self.scoring_efficiency.unwrap_or(base.scoring_efficiency),
            passing_defense: self.passing_defense.unwrap_or(base.passing_defense),
            rushing_defense: self.rushing_defense.unwrap_or(base.rushing_defense),
            turnover_margin: self.turnover_margin.unwrap_or(base.turnover_margin),
            special_teams: self.special_teams.unwrap_or(base.special_teams),
            home_field_advantage: self.home_field_advantage.unwrap_or(base.home_field_advantage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightChangeReason {
    RegressionAnalysis,
    ManualOverride(String),
    FallbackReset,
}

impl fmt::Display for WeightChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightChangeReason::RegressionAnalysis => f.write_str("regression_analysis"),
            WeightChangeReason::ManualOverride(note) => write!(f, "manual_override:{}", note),
            WeightChangeReason::FallbackReset => f.write_str("fallback_reset"),
        }
    }
}

impl FromStr for WeightChangeReason {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regression_analysis" => Ok(WeightChangeReason::RegressionAnalysis),
            "fallback_reset" => Ok(WeightChangeReason::FallbackReset),
            other => other
                .strip_prefix("manual_override:")
                .map(|note| WeightChangeReason::ManualOverride(note.to_string()))
                .ok_or_else(|| {
                    EngineError::InvalidInput(format!("unknown weight change reason '{}'", other))
                }),
        }
    }
}

impl Serialize for WeightChangeReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WeightChangeReason {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionMetrics {
    pub r_squared: f64,
    pub sample_size: u32,
    pub significant_metrics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightChangeLog {
    pub id: String,
    pub season: i32,
    pub timestamp: DateTime<Utc>,
    pub reason: WeightChangeReason,
    pub notes: Option<String>,
    pub previous_weights: StatisticalImpactWeights,
    pub new_weights: StatisticalImpactWeights,
    pub regression_metrics: Option<RegressionMetrics>,
    pub actor: String,
}

// ── Regression analysis ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRegression {
    pub metric_name: String,
    pub coefficient: f64,
    pub r_squared: f64,
    pub p_value: f64,
    pub confidence_interval: ConfidenceInterval,
    pub calculated_weight: f64,
    pub is_statistically_significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionAnalysisResult {
    pub id: String,
    pub season: i32,
    pub overall_model_r_squared: f64,
    pub sample_size: u32,
    pub predictive_accuracy: f64,
    pub regression_results: Vec<MetricRegression>,
    pub created_at: DateTime<Utc>,
}

impl RegressionAnalysisResult {
    pub fn significant_metrics(&self) -> Vec<String> {
        self.regression_results
            .iter()
            .filter(|m| m.is_statistically_significant)
            .map(|m| m.metric_name.clone())
            .collect()
    }
}

// ── Predictions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPrediction {
    pub category: StatCategory,
    pub team_offensive_efficiency: f64,
    pub opponent_defensive_efficiency: f64,
    pub opponent_baseline: f64,
    pub predicted_value: f64,
    pub weight_applied: f64,
    /// Reason the raw value was clamped, if it was.
    pub bounds_adjustment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidePrediction {
    pub team_id: String,
    pub categories: Vec<CategoryPrediction>,
}

impl SidePrediction {
    pub fn category(&self, category: StatCategory) -> Option<&CategoryPrediction> {
        self.categories.iter().find(|p| p.category == category)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorePrediction {
    pub home_score: f64,
    pub away_score: f64,
    pub home_interval: ConfidenceInterval,
    pub away_interval: ConfidenceInterval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegressionMetadata {
    pub weights_used: StatisticalImpactWeights,
    pub model_r_squared: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchupPrediction {
    pub home_team_id: String,
    pub away_team_id: String,
    pub season: i32,
    pub home: SidePrediction,
    pub away: SidePrediction,
    pub scores: ScorePrediction,
    pub home_win_probability: f64,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub regression_metadata: RegressionMetadata,
}

impl MatchupPrediction {
    pub fn to_final(&self, game_id: impl Into<String>) -> FinalPrediction {
        FinalPrediction {
            game_id: game_id.into(),
            home_team_id: self.home_team_id.clone(),
            away_team_id: self.away_team_id.clone(),
            home_score: self.scores.home_score,
            away_score: self.scores.away_score,
            confidence: self.confidence,
            method: METHOD_EFFICIENCY_MATCHUP.to_string(),
        }
    }
}

/// The score pair the validation layer checks and, if needed, corrects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalPrediction {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub home_score: f64,
    pub away_score: f64,
    pub confidence: f64,
    pub method: String,
}

impl FinalPrediction {
    pub fn differential(&self) -> f64 {
        self.home_score - self.away_score
    }
}

// ── Score baselines ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreSummary {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        Self {
            mean: crate::utils::mean(values),
            std_dev: crate::utils::std_dev(values),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamPerformanceBaseline {
    pub team_id: String,
    pub season: i32,
    pub games_played: u32,
    pub points_for: ScoreSummary,
    pub points_against: ScoreSummary,
}

impl TeamPerformanceBaseline {
    pub fn has_games(&self) -> bool {
        self.games_played > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(value: f64) -> StatLine {
        StatLine::from_fn(|_| value)
    }

    #[test]
    fn test_unknown_category_is_rejected() {
        let err = "kickReturnYards".parse::<StatCategory>().unwrap_err();
        assert!(err.to_string().contains("unsupported statistical category"));
        assert_eq!("passingYards".parse::<StatCategory>().unwrap(), StatCategory::PassingYards);
    }

    #[test]
    fn test_record_deltas_are_opponent_relative() {
        let baseline = OpponentBaseline {
            allowed: line(200.0),
            produced: line(300.0),
            games: 5,
        };
        let record = GamePerformanceRecord::new(
            "g1", "a", "b", 2024, 1, true, line(250.0), line(240.0), baseline,
        );
        assert_eq!(record.deltas().offense.total_yards, 50.0);
        assert_eq!(record.deltas().defense.total_yards, 60.0);
        assert!((record.deltas().offense_relative.total_yards - 0.25).abs() < 1e-12);
        assert!((record.deltas().defense_relative.total_yards - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_weight_change_reason_round_trip() {
        let reason = WeightChangeReason::ManualOverride("coach feedback".to_string());
        assert_eq!(reason.to_string(), "manual_override:coach feedback");
        assert_eq!(reason.to_string().parse::<WeightChangeReason>().unwrap(), reason);
        assert!("something_else".parse::<WeightChangeReason>().is_err());
    }

    #[test]
    fn test_partial_weights_merge() {
        let merged = PartialWeights::default()
            .with(WeightKey::SpecialTeams, 0.5)
            .merged_onto(&StatisticalImpactWeights::fallback());
        assert_eq!(merged.special_teams, 0.5);
        assert_eq!(merged.passing_offense, 0.25);
    }

    #[test]
    fn test_confidence_level_ordering() {
        assert!(ConfidenceLevel::Low < ConfidenceLevel::Medium);
        assert!(ConfidenceLevel::Medium < ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::Low.raised(), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::High.raised(), ConfidenceLevel::High);
    }
}
