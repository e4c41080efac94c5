use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::config::ProfileConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ConfidenceLevel, GamePerformanceRecord, GameRecord, OpponentBaseline, StatLine,
    TeamEfficiencyProfile, TeamGameStats,
};
use crate::utils::{mean, median, std_dev};

/// Quality-score dispersion at which the convergence score is 0.5.
const CONVERGENCE_HALF_POINT: f64 = 0.25;
const MIN_CONVERGENCE: f64 = 0.1;
const MAX_CONVERGENCE: f64 = 1.0;
/// Scales a median absolute deviation to a normal standard deviation.
const MAD_TO_SIGMA: f64 = 1.4826;

// ── Record assembly ──────────────────────────────────────────────────────────

/// Turns raw season games and box scores into opponent-relative
/// `GamePerformanceRecord`s.
pub struct PerformanceRecordAssembler<'a> {
    games: Vec<&'a GameRecord>,
    lines: HashMap<(&'a str, &'a str), StatLine>,
    league_averages: StatLine,
}

impl<'a> PerformanceRecordAssembler<'a> {
    pub fn new(games: &'a [GameRecord], stats: &'a [TeamGameStats], league_averages: StatLine) -> Self {
        let lines: HashMap<(&str, &str), StatLine> = stats
            .iter()
            .filter_map(|s| Some(((s.game_id.as_str(), s.team_id.as_str()), s.stat_line()?)))
            .collect();

        // Only finished games with a usable box score on both sides take part.
        let mut usable: Vec<&GameRecord> = games
            .iter()
            .filter(|g| g.is_finished())
            .filter(|g| {
                lines.contains_key(&(g.id.as_str(), g.home_team_id.as_str()))
                    && lines.contains_key(&(g.id.as_str(), g.away_team_id.as_str()))
            })
            .collect();
        usable.sort_by_key(|g| g.order_key());

        Self {
            games: usable,
            lines,
            league_averages,
        }
    }

    /// Records for `team_id`, oldest first. With `before`, only games that
    /// precede that point feed both the records and the opponent baselines.
    pub fn records_for(
        &self,
        team_id: &str,
        before: Option<(u32, DateTime<Utc>)>,
    ) -> Vec<GamePerformanceRecord> {
        self.games_before(before)
            .filter(|g| g.involves(team_id))
            .filter_map(|game| {
                let opponent_id = game.opponent_of(team_id)?;
                let produced = *self.lines.get(&(game.id.as_str(), team_id))?;
                let allowed = *self.lines.get(&(game.id.as_str(), opponent_id))?;
                let baseline = self.opponent_baseline(opponent_id, &game.id, before);

                Some(GamePerformanceRecord::new(
                    game.id.clone(),
                    team_id,
                    opponent_id,
                    game.season,
                    game.week,
                    game.home_team_id == team_id,
                    produced,
                    allowed,
                    baseline,
                ))
            })
            .collect()
    }

    /// Teams that appear in at least one usable game.
    pub fn teams(&self) -> Vec<String> {
        let mut teams: Vec<String> = self
            .games
            .iter()
            .flat_map(|g| [g.home_team_id.clone(), g.away_team_id.clone()])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        teams.sort();
        teams
    }

    fn games_before(
        &self,
        before: Option<(u32, DateTime<Utc>)>,
    ) -> impl Iterator<Item = &&'a GameRecord> + '_ {
        self.games
            .iter()
            .filter(move |g| before.map_or(true, |cutoff| g.order_key() < cutoff))
    }

    /// The opponent's per-game averages over its other games. Falls back to
    /// league averages when the opponent has no other games.
    fn opponent_baseline(
        &self,
        opponent_id: &str,
        excluded_game: &str,
        before: Option<(u32, DateTime<Utc>)>,
    ) -> OpponentBaseline {
        let mut produced = Vec::new();
        let mut allowed = Vec::new();

        for game in self.games_before(before) {
            if game.id == excluded_game {
                continue;
            }
            let Some(other) = game.opponent_of(opponent_id) else {
                continue;
            };
            if let (Some(p), Some(a)) = (
                self.lines.get(&(game.id.as_str(), opponent_id)),
                self.lines.get(&(game.id.as_str(), other)),
            ) {
                produced.push(*p);
                allowed.push(*a);
            }
        }

        if produced.is_empty() {
            return OpponentBaseline {
                allowed: self.league_averages,
                produced: self.league_averages,
                games: 0,
            };
        }

        let average = |lines: &[StatLine]| {
            StatLine::from_fn(|c| mean(&lines.iter().map(|l| l.get(c)).collect::<Vec<_>>()))
        };

        OpponentBaseline {
            allowed: average(&allowed),
            produced: average(&produced),
            games: produced.len() as u32,
        }
    }
}

// ── Profile construction ─────────────────────────────────────────────────────

/// Builds a team's season efficiency profile from its per-game records.
pub struct EfficiencyProfileBuilder {
    config: ProfileConfig,
}

impl EfficiencyProfileBuilder {
    pub fn new(config: ProfileConfig) -> Self {
        Self { config }
    }

    /// Pure: the same records, prior and timestamp always yield the same profile.
    pub fn build(
        &self,
        team_id: &str,
        season: i32,
        records: &[GamePerformanceRecord],
        prior: Option<&TeamEfficiencyProfile>,
        calculated_at: DateTime<Utc>,
    ) -> EngineResult<TeamEfficiencyProfile> {
        self.check_records(team_id, season, records)?;

        let mut offensive = self.category_estimates(records, |r| &r.deltas().offense);
        let mut defensive = self.category_estimates(records, |r| &r.deltas().defense);
        let mut offensive_averages = StatLine::from_fn(|c| {
            mean(&records.iter().map(|r| r.produced.get(c)).collect::<Vec<_>>())
        });

        let games_played = records.len() as u32;
        let mut confidence_level = self.confidence_for_games(games_played);
        let mut blended_with_prior = false;

        if games_played < self.config.low_confidence_max_games {
            match prior.filter(|p| p.team_id == team_id && p.season < season) {
                Some(prior) => {
                    let w = self.config.current_season_blend;
                    let blend = |current: &StatLine, previous: &StatLine| {
                        StatLine::from_fn(|c| w * current.get(c) + (1.0 - w) * previous.get(c))
                    };
                    offensive = blend(&offensive, &prior.offensive);
                    defensive = blend(&defensive, &prior.defensive);
                    offensive_averages = blend(&offensive_averages, &prior.offensive_averages);
                    blended_with_prior = true;

                    if prior.confidence_level > confidence_level {
                        confidence_level = confidence_level.raised();
                    }

                    tracing::debug!(
                        "Blended {} {} ({} games) with {} profile ({}), confidence {}",
                        team_id,
                        season,
                        games_played,
                        prior.season,
                        prior.confidence_level,
                        confidence_level
                    );
                }
                None => {
                    if prior.is_some() {
                        tracing::warn!(
                            "Ignoring prior profile for {} {}: it is not an earlier season of the same team",
                            team_id,
                            season
                        );
                    }
                }
            }
        }

        Ok(TeamEfficiencyProfile {
            team_id: team_id.to_string(),
            season,
            offensive,
            defensive,
            offensive_averages,
            games_played,
            convergence_score: self.convergence_score(records),
            confidence_level,
            blended_with_prior,
            last_calculated: calculated_at,
        })
    }

    pub fn confidence_for_games(&self, games: u32) -> ConfidenceLevel {
        if games < self.config.low_confidence_max_games {
            ConfidenceLevel::Low
        } else if games < self.config.high_confidence_min_games {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }

    /// Consistency of per-game quality: lower dispersion scores closer to 1.0.
    pub fn convergence_score(&self, records: &[GamePerformanceRecord]) -> f64 {
        if records.len() < 2 {
            return MIN_CONVERGENCE;
        }
        let quality: Vec<f64> = records.iter().map(|r| r.quality_score()).collect();
        let dispersion = std_dev(&quality);
        (CONVERGENCE_HALF_POINT / (CONVERGENCE_HALF_POINT + dispersion))
            .clamp(MIN_CONVERGENCE, MAX_CONVERGENCE)
    }

    fn category_estimates(
        &self,
        records: &[GamePerformanceRecord],
        pick: impl Fn(&GamePerformanceRecord) -> &StatLine,
    ) -> StatLine {
        StatLine::from_fn(|c| {
            let values: Vec<f64> = records.iter().map(|r| pick(r).get(c)).collect();
            self.converged_mean(&values)
        })
    }

    /// Huber location estimate by iterative reweighting. Values within the
    /// outlier threshold keep full weight, so clean samples give the plain mean.
    fn converged_mean(&self, values: &[f64]) -> f64 {
        let plain = mean(values);
        if values.len() < 3 {
            return plain;
        }

        let center = median(values);
        let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
        let scale = MAD_TO_SIGMA * median(&deviations);
        if scale <= f64::EPSILON {
            return plain;
        }
        let threshold = self.config.outlier_threshold * scale;

        let mut estimate = center;
        for iteration in 0..self.config.max_iterations {
            let (weighted_sum, weight_total) = values.iter().fold((0.0, 0.0), |(s, t), v| {
                let residual = (v - estimate).abs();
                let w = if residual <= threshold { 1.0 } else { threshold / residual };
                (s + w * v, t + w)
            });
            let next = weighted_sum / weight_total;
            let step = (next - estimate).abs();
            estimate = next;
            if step < self.config.convergence_tolerance {
                tracing::trace!("Efficiency estimate converged after {} iterations", iteration + 1);
                return estimate;
            }
        }

        tracing::debug!(
            "Efficiency estimate hit the {} iteration cap; using last estimate",
            self.config.max_iterations
        );
        estimate
    }

    fn check_records(
        &self,
        team_id: &str,
        season: i32,
        records: &[GamePerformanceRecord],
    ) -> EngineResult<()> {
        if records.is_empty() {
            return Err(EngineError::InsufficientData(format!(
                "no finished games for {} in {}",
                team_id, season
            )));
        }

        let mut seen = HashSet::new();
        for record in records {
            if record.team_id != team_id || record.season != season {
                return Err(EngineError::InvalidInput(format!(
                    "record {} belongs to {} {}, expected {} {}",
                    record.game_id, record.team_id, record.season, team_id, season
                )));
            }
            if !seen.insert(record.game_id.as_str()) {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate record for game {}",
                    record.game_id
                )));
            }
            let finite = [
                record.produced,
                record.allowed,
                record.opponent_baseline.allowed,
                record.opponent_baseline.produced,
            ]
            .iter()
            .all(StatLine::is_finite);
            if !finite {
                return Err(EngineError::InvalidInput(format!(
                    "record {} contains a non-numeric statistic",
                    record.game_id
                )));
            }
        }
        Ok(())
    }
}
