use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};

use crate::db::SqliteStore;
use crate::models::{GameRecord, Team, TeamGameStats};

/// A self-consistent season of raw data: teams, games and both box scores
/// for every finished game.
#[derive(Debug, Clone, Default)]
pub struct SeedData {
    pub teams: Vec<Team>,
    pub games: Vec<GameRecord>,
    pub stats: Vec<TeamGameStats>,
}

// (id, name, conference, offense rating, defense rating)
const TEAMS: [(&str, &str, &str, f64, f64); 12] = [
    ("ohio-state", "Ohio State", "Big Ten", 1.6, 1.3),
    ("michigan", "Michigan", "Big Ten", 0.9, 1.5),
    ("penn-state", "Penn State", "Big Ten", 0.8, 0.9),
    ("wisconsin", "Wisconsin", "Big Ten", -0.2, 0.3),
    ("iowa", "Iowa", "Big Ten", -0.9, 0.8),
    ("minnesota", "Minnesota", "Big Ten", -0.6, -0.4),
    ("georgia", "Georgia", "SEC", 1.3, 1.6),
    ("alabama", "Alabama", "SEC", 1.4, 0.9),
    ("lsu", "LSU", "SEC", 1.0, 0.1),
    ("tennessee", "Tennessee", "SEC", 0.7, 0.2),
    ("florida", "Florida", "SEC", -0.1, -0.5),
    ("auburn", "Auburn", "SEC", -0.4, -0.6),
];

/// Weeks 1-11 are a completed round robin; week 12 replays round one with
/// venues swapped and is still scheduled.
pub const DEMO_COMPLETED_WEEKS: u32 = 11;

/// Deterministic value in [-1, 1] for a given key.
fn jitter(key: u64) -> f64 {
    let x = ((key as f64) * 12.9898 + 78.233).sin() * 43_758.545_3;
    (x - x.floor()) * 2.0 - 1.0
}

fn box_score(
    game_id: &str,
    team_id: &str,
    offense: f64,
    defense: f64,
    home: bool,
    key: u64,
) -> TeamGameStats {
    let edge = offense - defense;
    let home_bump = if home { 1.0 } else { 0.0 };
    let passing = (240.0 + 38.0 * edge + 45.0 * jitter(key)).max(60.0).round();
    let rushing = (160.0 + 30.0 * edge + 35.0 * jitter(key + 1)).max(30.0).round();
    let points = (27.0 + 7.5 * edge + 2.5 * home_bump + 8.0 * jitter(key + 2)).clamp(0.0, 70.0).round();
    let interceptions = (0.9 - 0.3 * edge + jitter(key + 3)).clamp(0.0, 4.0).round();
    let fumbles = (0.6 + 0.7 * jitter(key + 4)).clamp(0.0, 3.0).round();

    TeamGameStats {
        game_id: game_id.to_string(),
        team_id: team_id.to_string(),
        points: Some(points),
        total_yards: Some(passing + rushing),
        passing_yards: Some(passing),
        rushing_yards: Some(rushing),
        turnovers: Some(interceptions + fumbles),
        interceptions: Some(interceptions),
        sacks: Some((2.2 - 0.5 * edge + 1.5 * jitter(key + 5)).clamp(0.0, 8.0).round()),
        field_goals: Some((1.4 + 0.2 * edge + jitter(key + 6)).clamp(0.0, 5.0).round()),
        success_rate: Some((0.42 + 0.03 * edge + 0.05 * jitter(key + 7)).clamp(0.2, 0.7)),
        explosiveness: Some((1.2 + 0.1 * edge + 0.15 * jitter(key + 8)).max(0.5)),
        third_down_rate: Some((0.4 + 0.04 * edge + 0.08 * jitter(key + 9)).clamp(0.1, 0.8)),
    }
}

/// Builds the demo season used by `gridcast seed` and the test suites.
pub fn demo_season(season: i32) -> SeedData {
    let teams: Vec<Team> = TEAMS
        .iter()
        .map(|(id, name, conference, _, _)| Team {
            id: id.to_string(),
            name: name.to_string(),
            conference: Some(conference.to_string()),
        })
        .collect();

    let kickoff = Utc
        .with_ymd_and_hms(season, 8, 31, 19, 30, 0)
        .single()
        .unwrap_or_else(Utc::now);

    // Circle-method round robin over the team indices.
    let n = TEAMS.len();
    let mut rotation: Vec<usize> = (0..n).collect();
    let mut rounds: Vec<Vec<(usize, usize)>> = Vec::new();
    for round in 0..n - 1 {
        let pairs = (0..n / 2)
            .map(|i| {
                let (a, b) = (rotation[i], rotation[n - 1 - i]);
                if (round + i) % 2 == 0 { (a, b) } else { (b, a) }
            })
            .collect();
        rounds.push(pairs);
        let last = rotation.remove(n - 1);
        rotation.insert(1, last);
    }

    let mut data = SeedData {
        teams,
        ..Default::default()
    };

    let mut key: u64 = (season as u64) * 1_000;
    for week in 1..=DEMO_COMPLETED_WEEKS + 1 {
        let completed = week <= DEMO_COMPLETED_WEEKS;
        let pairs: Vec<(usize, usize)> = if completed {
            rounds[(week - 1) as usize].clone()
        } else {
            rounds[0].iter().map(|(h, a)| (*a, *h)).collect()
        };

        for (slot, (h, a)) in pairs.into_iter().enumerate() {
            let (home_id, _, home_conf, home_off, home_def) = TEAMS[h];
            let (away_id, _, away_conf, away_off, away_def) = TEAMS[a];
            let game_id = format!("{}-w{:02}-{}", season, week, slot + 1);
            let neutral_site = week == 6 && slot == 0;
            key += 17;

            let (home_score, away_score) = if completed {
                let home_stats = box_score(&game_id, home_id, home_off, away_def, !neutral_site, key);
                let mut away_stats = box_score(&game_id, away_id, away_off, home_def, false, key + 100);
                let home_points = home_stats.points.unwrap_or(0.0);
                // No ties in college football; the visitor settles it in overtime.
                if away_stats.points == home_stats.points {
                    away_stats.points = Some(home_points + 3.0);
                    away_stats.field_goals = away_stats.field_goals.map(|fg| fg + 1.0);
                }
                let away_points = away_stats.points.unwrap_or(0.0);
                data.stats.push(home_stats);
                data.stats.push(away_stats);
                (Some(home_points as i32), Some(away_points as i32))
            } else {
                (None, None)
            };

            data.games.push(GameRecord {
                id: game_id,
                season,
                week,
                home_team_id: home_id.to_string(),
                away_team_id: away_id.to_string(),
                home_score,
                away_score,
                completed,
                neutral_site,
                conference_game: home_conf == away_conf,
                start_date: kickoff + Duration::weeks(week as i64 - 1) + Duration::hours(slot as i64),
            });
        }
    }

    data
}

pub async fn seed_data(store: &SqliteStore, season: i32) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM games WHERE season = ?")
        .bind(season)
        .fetch_one(store.pool())
        .await?;

    if count > 0 {
        tracing::info!("Season {} already seeded ({} games found), skipping.", season, count);
        return Ok(());
    }

    tracing::info!("Seeding database with the {} demo season...", season);

    let data = demo_season(season);
    for team in &data.teams {
        store.insert_team(team).await?;
    }
    for game in &data.games {
        store.insert_game(game).await?;
    }
    for stats in &data.stats {
        store.insert_team_game_stats(stats).await?;
    }

    tracing::info!(
        "Seeded {} teams, {} games, {} box scores.",
        data.teams.len(),
        data.games.len(),
        data.stats.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_demo_season_is_a_full_round_robin() {
        let data = demo_season(2024);
        let finished: Vec<&GameRecord> = data.games.iter().filter(|g| g.is_finished()).collect();
        assert_eq!(finished.len(), 66);
        assert_eq!(data.stats.len(), 132);

        let mut games_per_team: HashMap<&str, usize> = HashMap::new();
        for game in &finished {
            *games_per_team.entry(game.home_team_id.as_str()).or_default() += 1;
            *games_per_team.entry(game.away_team_id.as_str()).or_default() += 1;
        }
        assert!(games_per_team.values().all(|&n| n == 11));
        assert!(finished.iter().all(|g| g.home_score != g.away_score));
    }

    #[test]
    fn test_demo_season_is_deterministic() {
        let a = demo_season(2024);
        let b = demo_season(2024);
        assert_eq!(a.games.len(), b.games.len());
        for (x, y) in a.stats.iter().zip(&b.stats) {
            assert_eq!(x.points, y.points);
            assert_eq!(x.total_yards, y.total_yards);
        }
    }
}
