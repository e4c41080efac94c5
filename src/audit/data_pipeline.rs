use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::audit::{percent, AuditReport, Severity, SubScores, ValidationResult, Validator};
use crate::config::AuditConfig;
use crate::db::Store;
use crate::models::{GameRecord, TeamGameStats};
use crate::utils::{stride_sample, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldTier {
    Critical,
    Important,
    Advanced,
}

type FieldGetter = fn(&TeamGameStats) -> Option<f64>;

const FIELDS: [(&str, FieldTier, FieldGetter); 11] = [
    ("points", FieldTier::Critical, |s: &TeamGameStats| s.points),
    ("totalYards", FieldTier::Critical, |s: &TeamGameStats| s.total_yards),
    ("passingYards", FieldTier::Critical, |s: &TeamGameStats| s.passing_yards),
    ("rushingYards", FieldTier::Critical, |s: &TeamGameStats| s.rushing_yards),
    ("turnovers", FieldTier::Important, |s: &TeamGameStats| s.turnovers),
    ("interceptions", FieldTier::Important, |s: &TeamGameStats| s.interceptions),
    ("sacks", FieldTier::Important, |s: &TeamGameStats| s.sacks),
    ("fieldGoals", FieldTier::Important, |s: &TeamGameStats| s.field_goals),
    ("successRate", FieldTier::Advanced, |s: &TeamGameStats| s.success_rate),
    ("explosiveness", FieldTier::Advanced, |s: &TeamGameStats| s.explosiveness),
    ("thirdDownRate", FieldTier::Advanced, |s: &TeamGameStats| s.third_down_rate),
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPipelineReport {
    pub base: ValidationResult,
    pub games_checked: usize,
    pub games_passed: usize,
    pub pass_rate: f64,
    pub completeness_score: f64,
    pub consistency_score: f64,
    /// Missing-value counts per field over the sampled box scores.
    pub missing_by_field: BTreeMap<String, usize>,
    /// Consistency failure counts per issue code.
    pub inconsistencies: BTreeMap<String, usize>,
}

/// Findings for one game's pair of box scores.
#[derive(Debug, Default)]
struct GameFindings {
    missing: Vec<(&'static str, FieldTier)>,
    inconsistent: Vec<&'static str>,
    checks: usize,
    fields_expected: usize,
}

impl GameFindings {
    fn passes(&self) -> bool {
        self.inconsistent.is_empty()
            && !self.missing.iter().any(|(_, tier)| *tier == FieldTier::Critical)
    }
}

/// Grades field completeness and cross-field consistency of the raw box
/// scores over a sample of finished games.
pub struct DataPipelineValidator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: AuditConfig,
}

impl DataPipelineValidator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: AuditConfig) -> Self {
        Self { store, clock, config }
    }

    fn check_box_score(&self, game: &GameRecord, stats: &TeamGameStats, findings: &mut GameFindings) {
        findings.fields_expected += FIELDS.len();
        for (name, tier, get) in FIELDS {
            if get(stats).map_or(true, |v| !v.is_finite()) {
                findings.missing.push((name, tier));
            }
        }

        if let (Some(total), Some(passing), Some(rushing)) =
            (stats.total_yards, stats.passing_yards, stats.rushing_yards)
        {
            findings.checks += 1;
            if (total - (passing + rushing)).abs() > self.config.yardage_tolerance {
                findings.inconsistent.push("YARDAGE_MISMATCH");
            }
        }
        if let Some(turnovers) = stats.turnovers {
            findings.checks += 1;
            if !(0.0..=self.config.max_turnovers).contains(&turnovers) {
                findings.inconsistent.push("TURNOVERS_OUT_OF_RANGE");
            }
        }
        if let Some(rate) = stats.success_rate {
            findings.checks += 1;
            if !(0.0..=1.0).contains(&rate) {
                findings.inconsistent.push("SUCCESS_RATE_OUT_OF_RANGE");
            }
        }
        if let (Some(points), Some((scored, _))) = (stats.points, game.score_for(&stats.team_id)) {
            findings.checks += 1;
            if (points - scored as f64).abs() > f64::EPSILON {
                findings.inconsistent.push("SCORE_MISMATCH");
            }
        }
    }

    pub async fn evaluate(&self, season: i32) -> DataPipelineReport {
        let now = self.clock.now();
        let loaded = async {
            let games = self.store.season_games(season).await?;
            let stats = self.store.season_team_stats(season).await?;
            anyhow::Ok((games, stats))
        }
        .await;
        let (games, stats) = match loaded {
            Ok(data) => data,
            Err(e) => return empty_report(ValidationResult::unavailable(now, "season box scores", e)),
        };

        let mut base = ValidationResult::new(now);
        let finished: Vec<GameRecord> = games.into_iter().filter(|g| g.is_finished()).collect();
        if finished.is_empty() {
            base.error("NO_GAMES", format!("No finished games for {}", season), Severity::High);
            base.finish(
                SubScores {
                    completeness: 0.0,
                    consistency: 0.0,
                    validity: 0.0,
                },
                false,
            );
            return empty_report(base);
        }

        let by_key: HashMap<(&str, &str), &TeamGameStats> = stats
            .iter()
            .map(|s| ((s.game_id.as_str(), s.team_id.as_str()), s))
            .collect();
        let sample = stride_sample(&finished, self.config.pipeline_sample_size);

        let mut missing_by_field: BTreeMap<String, usize> = BTreeMap::new();
        let mut inconsistencies: BTreeMap<String, usize> = BTreeMap::new();
        let mut missing_box_scores = 0usize;
        let (mut fields_expected, mut fields_missing) = (0usize, 0usize);
        let (mut checks, mut failed_checks) = (0usize, 0usize);
        let mut games_passed = 0usize;

        for game in &sample {
            let mut findings = GameFindings::default();
            let mut complete = true;
            for team_id in [&game.home_team_id, &game.away_team_id] {
                match by_key.get(&(game.id.as_str(), team_id.as_str())) {
                    Some(stats) => self.check_box_score(game, stats, &mut findings),
                    None => {
                        complete = false;
                        missing_box_scores += 1;
                        findings.fields_expected += FIELDS.len();
                        findings.missing.extend(FIELDS.iter().map(|(n, t, _)| (*n, *t)));
                    }
                }
            }

            for (name, _) in &findings.missing {
                *missing_by_field.entry(name.to_string()).or_default() += 1;
            }
            for code in &findings.inconsistent {
                *inconsistencies.entry(code.to_string()).or_default() += 1;
            }
            fields_expected += findings.fields_expected;
            fields_missing += findings.missing.len();
            checks += findings.checks;
            failed_checks += findings.inconsistent.len();
            if complete && findings.passes() {
                games_passed += 1;
            }
        }

        if missing_box_scores > 0 {
            base.error(
                "MISSING_BOX_SCORE",
                format!("{} box scores missing from sampled games", missing_box_scores),
                Severity::Critical,
            );
        }
        for (name, tier, _) in FIELDS {
            let Some(count) = missing_by_field.get(name).copied() else { continue };
            match tier {
                FieldTier::Critical => base.error(
                    "MISSING_CRITICAL_FIELD",
                    format!("{} missing in {} box scores", name, count),
                    Severity::High,
                ),
                FieldTier::Important => {
                    base.warn(format!("Important field {} missing in {} box scores", name, count))
                }
                FieldTier::Advanced => {
                    base.warn(format!("Advanced field {} missing in {} box scores", name, count))
                }
            }
        }
        for (code, count) in &inconsistencies {
            base.error(
                code,
                format!("{} consistency failures of type {}", count, code),
                Severity::Medium,
            );
        }
        if inconsistencies.contains_key("YARDAGE_MISMATCH") {
            base.recommend(format!(
                "Reconcile total yards with passing + rushing (tolerance {} yards)",
                self.config.yardage_tolerance
            ));
        }
        if missing_by_field.keys().any(|k| {
            FIELDS
                .iter()
                .any(|(n, t, _)| *n == k.as_str() && *t == FieldTier::Critical)
        }) {
            base.recommend("Backfill critical box-score fields before recalculating profiles");
        }

        let pass_rate = games_passed as f64 / sample.len() as f64;
        let completeness_score = percent(fields_expected - fields_missing, fields_expected);
        let consistency_score = percent(checks - failed_checks, checks);
        let is_valid = pass_rate >= self.config.pipeline_pass_rate;
        if !is_valid {
            base.error(
                "PASS_RATE_BELOW_THRESHOLD",
                format!(
                    "{:.0}% of sampled games passed, {:.0}% required",
                    pass_rate * 100.0,
                    self.config.pipeline_pass_rate * 100.0
                ),
                Severity::High,
            );
        }
        base.finish(
            SubScores {
                completeness: completeness_score,
                consistency: consistency_score,
                validity: pass_rate * 100.0,
            },
            is_valid,
        );

        DataPipelineReport {
            base,
            games_checked: sample.len(),
            games_passed,
            pass_rate,
            completeness_score,
            consistency_score,
            missing_by_field,
            inconsistencies,
        }
    }
}

fn empty_report(base: ValidationResult) -> DataPipelineReport {
    DataPipelineReport {
        base,
        games_checked: 0,
        games_passed: 0,
        pass_rate: 0.0,
        completeness_score: 0.0,
        consistency_score: 0.0,
        missing_by_field: BTreeMap::new(),
        inconsistencies: BTreeMap::new(),
    }
}

#[async_trait]
impl Validator for DataPipelineValidator {
    fn name(&self) -> &'static str {
        "data-pipeline"
    }

    async fn validate(&self, season: i32) -> AuditReport {
        AuditReport::DataPipeline(self.evaluate(season).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::DATA_UNAVAILABLE;
    use crate::db::{demo_season, MemoryStore};
    use crate::utils::SystemClock;

    fn validator(store: Arc<MemoryStore>) -> DataPipelineValidator {
        DataPipelineValidator::new(store, Arc::new(SystemClock), AuditConfig::default())
    }

    #[tokio::test]
    async fn test_clean_season_passes() {
        let store = Arc::new(MemoryStore::with_data(demo_season(2024)));
        let report = validator(store).evaluate(2024).await;
        assert!(report.base.is_valid, "{:?}", report.base.errors);
        assert_eq!(report.games_checked, 66);
        assert_eq!(report.games_passed, 66);
        assert_eq!(report.consistency_score, 100.0);
        assert!(report.base.score > 99.0);
    }

    #[tokio::test]
    async fn test_field_tiers_and_consistency() {
        let mut data = demo_season(2024);
        // Break most games so the season-level threshold fails.
        for (i, stats) in data.stats.iter_mut().enumerate() {
            stats.explosiveness = None;
            if i % 2 == 0 {
                stats.total_yards = stats.total_yards.map(|y| y + 120.0);
            }
            if i % 3 == 0 {
                stats.points = None;
            }
            if i == 1 {
                stats.turnovers = Some(14.0);
            }
        }
        let store = Arc::new(MemoryStore::with_data(data));
        let report = validator(store).evaluate(2024).await;

        assert!(!report.base.is_valid);
        assert!(report.base.has_code("MISSING_CRITICAL_FIELD"));
        assert!(report.base.has_code("YARDAGE_MISMATCH"));
        assert!(report.base.has_code("TURNOVERS_OUT_OF_RANGE"));
        assert!(report.base.has_code("PASS_RATE_BELOW_THRESHOLD"));
        assert!(report.base.warnings.iter().any(|w| w.starts_with("Advanced field explosiveness")));
        assert_eq!(report.missing_by_field.get("explosiveness"), Some(&132));
        assert!(report.pass_rate < 0.7);
    }

    #[tokio::test]
    async fn test_missing_advanced_fields_only_warn() {
        let mut data = demo_season(2024);
        for stats in &mut data.stats {
            stats.third_down_rate = None;
        }
        let store = Arc::new(MemoryStore::with_data(data));
        let report = validator(store).evaluate(2024).await;
        assert!(report.base.is_valid);
        assert!(report.base.errors.is_empty());
        assert_eq!(report.base.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_store_is_reported() {
        let store = Arc::new(MemoryStore::with_data(demo_season(2024)));
        store.set_fail_reads(true);
        let report = validator(store).evaluate(2024).await;
        assert!(report.base.has_code(DATA_UNAVAILABLE));
        assert!(!report.base.is_valid);
    }
}
