pub mod memory;
pub mod seed;

pub use memory::MemoryStore;
pub use seed::{demo_season, seed_data, SeedData};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::env;
use std::str::FromStr;

use crate::models::*;

/// Storage port. The schema is owned outside the engine; these are the only
/// reads and writes the engine performs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn team_exists(&self, team_id: &str) -> Result<bool>;
    async fn season_games(&self, season: i32) -> Result<Vec<GameRecord>>;
    async fn season_team_stats(&self, season: i32) -> Result<Vec<TeamGameStats>>;

    async fn load_profile(&self, team_id: &str, season: i32) -> Result<Option<TeamEfficiencyProfile>>;
    /// Full overwrite of the (team, season) row.
    async fn save_profile(&self, profile: &TeamEfficiencyProfile) -> Result<()>;
    async fn season_profiles(&self, season: i32) -> Result<Vec<TeamEfficiencyProfile>>;

    async fn latest_weight_change(&self, season: i32) -> Result<Option<WeightChangeLog>>;
    async fn append_weight_change(&self, entry: &WeightChangeLog) -> Result<()>;
    /// Newest first.
    async fn weight_history(&self, season: i32) -> Result<Vec<WeightChangeLog>>;

    async fn latest_regression_analysis(&self, season: i32) -> Result<Option<RegressionAnalysisResult>>;
    async fn insert_regression_analysis(&self, analysis: &RegressionAnalysisResult) -> Result<()>;
}

pub async fn create_pool() -> Result<SqlitePool> {
    let database_url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:../data/gridcast.db".to_string());

    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(&database_url);

    if let Some(parent) = std::path::Path::new(file_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }

    let options = SqliteConnectOptions::from_str(&database_url)?
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Called from the CLI where no pool exists yet.
pub async fn init_database() -> Result<()> {
    let pool = create_pool().await?;
    init_database_with_pool(&pool).await
}

pub async fn init_database_with_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            conference TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            season INTEGER NOT NULL,
            week INTEGER NOT NULL,
            home_team_id TEXT NOT NULL,
            away_team_id TEXT NOT NULL,
            home_score INTEGER,
            away_score INTEGER,
            completed INTEGER NOT NULL DEFAULT 0,
            neutral_site INTEGER NOT NULL DEFAULT 0,
            conference_game INTEGER NOT NULL DEFAULT 0,
            start_date TEXT NOT NULL,
            FOREIGN KEY (home_team_id) REFERENCES teams (id),
            FOREIGN KEY (away_team_id) REFERENCES teams (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_game_stats (
            game_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            points REAL,
            total_yards REAL,
            passing_yards REAL,
            rushing_yards REAL,
            turnovers REAL,
            interceptions REAL,
            sacks REAL,
            field_goals REAL,
            success_rate REAL,
            explosiveness REAL,
            third_down_rate REAL,
            PRIMARY KEY (game_id, team_id),
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS team_efficiency_profiles (
            team_id TEXT NOT NULL,
            season INTEGER NOT NULL,
            offensive TEXT NOT NULL,
            defensive TEXT NOT NULL,
            offensive_averages TEXT NOT NULL,
            games_played INTEGER NOT NULL,
            convergence_score REAL NOT NULL,
            confidence_level TEXT NOT NULL,
            blended_with_prior INTEGER NOT NULL DEFAULT 0,
            last_calculated TEXT NOT NULL,
            PRIMARY KEY (team_id, season)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS weight_history (
            id TEXT PRIMARY KEY,
            season INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            reason TEXT NOT NULL,
            notes TEXT,
            previous_weights TEXT NOT NULL,
            new_weights TEXT NOT NULL,
            regression_metrics TEXT,
            actor TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regression_analyses (
            id TEXT PRIMARY KEY,
            season INTEGER NOT NULL,
            overall_model_r_squared REAL NOT NULL,
            sample_size INTEGER NOT NULL,
            predictive_accuracy REAL NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regression_metrics (
            analysis_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            coefficient REAL NOT NULL,
            r_squared REAL NOT NULL,
            p_value REAL NOT NULL,
            ci_lower REAL NOT NULL,
            ci_upper REAL NOT NULL,
            calculated_weight REAL NOT NULL,
            is_significant INTEGER NOT NULL,
            PRIMARY KEY (analysis_id, metric_name),
            FOREIGN KEY (analysis_id) REFERENCES regression_analyses (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_season ON games(season, week)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_weight_history_season ON weight_history(season, timestamp)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_regression_season ON regression_analyses(season, created_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database initialized successfully");
    Ok(())
}

/// `Store` backed by SQLite through sqlx.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_team(&self, team: &Team) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO teams (id, name, conference) VALUES (?, ?, ?)")
            .bind(&team.id)
            .bind(&team.name)
            .bind(&team.conference)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_game(&self, game: &GameRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO games
            (id, season, week, home_team_id, away_team_id, home_score, away_score,
             completed, neutral_site, conference_game, start_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&game.id)
        .bind(game.season)
        .bind(game.week as i64)
        .bind(&game.home_team_id)
        .bind(&game.away_team_id)
        .bind(game.home_score)
        .bind(game.away_score)
        .bind(game.completed)
        .bind(game.neutral_site)
        .bind(game.conference_game)
        .bind(game.start_date.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_team_game_stats(&self, stats: &TeamGameStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO team_game_stats
            (game_id, team_id, points, total_yards, passing_yards, rushing_yards, turnovers,
             interceptions, sacks, field_goals, success_rate, explosiveness, third_down_rate)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stats.game_id)
        .bind(&stats.team_id)
        .bind(stats.points)
        .bind(stats.total_yards)
        .bind(stats.passing_yards)
        .bind(stats.rushing_yards)
        .bind(stats.turnovers)
        .bind(stats.interceptions)
        .bind(stats.sacks)
        .bind(stats.field_goals)
        .bind(stats.success_rate)
        .bind(stats.explosiveness)
        .bind(stats.third_down_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn regression_metric_rows(&self, analysis_id: &str) -> Result<Vec<MetricRegression>> {
        let rows = sqlx::query(
            "SELECT * FROM regression_metrics WHERE analysis_id = ? ORDER BY metric_name",
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(MetricRegression {
                metric_name: row.get("metric_name"),
                coefficient: row.get("coefficient"),
                r_squared: row.get("r_squared"),
                p_value: row.get("p_value"),
                confidence_interval: ConfidenceInterval {
                    lower: row.get("ci_lower"),
                    upper: row.get("ci_upper"),
                },
                calculated_weight: row.get("calculated_weight"),
                is_statistically_significant: row.get("is_significant"),
            });
        }
        Ok(metrics)
    }
}

fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<Utc>> {
    Ok(chrono::DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TeamEfficiencyProfile> {
    Ok(TeamEfficiencyProfile {
        team_id: row.get("team_id"),
        season: row.get("season"),
        offensive: serde_json::from_str(&row.get::<String, _>("offensive"))?,
        defensive: serde_json::from_str(&row.get::<String, _>("defensive"))?,
        offensive_averages: serde_json::from_str(&row.get::<String, _>("offensive_averages"))?,
        games_played: row.get::<i64, _>("games_played") as u32,
        convergence_score: row.get("convergence_score"),
        confidence_level: row.get::<String, _>("confidence_level").parse()?,
        blended_with_prior: row.get("blended_with_prior"),
        last_calculated: parse_timestamp(&row.get::<String, _>("last_calculated"))?,
    })
}

fn weight_change_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WeightChangeLog> {
    let regression_metrics = row
        .get::<Option<String>, _>("regression_metrics")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(WeightChangeLog {
        id: row.get("id"),
        season: row.get("season"),
        timestamp: parse_timestamp(&row.get::<String, _>("timestamp"))?,
        reason: row.get::<String, _>("reason").parse()?,
        notes: row.get("notes"),
        previous_weights: serde_json::from_str(&row.get::<String, _>("previous_weights"))?,
        new_weights: serde_json::from_str(&row.get::<String, _>("new_weights"))?,
        regression_metrics,
        actor: row.get("actor"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn team_exists(&self, team_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams WHERE id = ?")
            .bind(team_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn season_games(&self, season: i32) -> Result<Vec<GameRecord>> {
        let rows = sqlx::query("SELECT * FROM games WHERE season = ? ORDER BY week, start_date")
            .bind(season)
            .fetch_all(&self.pool)
            .await?;

        let mut games = Vec::new();
        for row in rows {
            games.push(GameRecord {
                id: row.get("id"),
                season: row.get("season"),
                week: row.get::<i64, _>("week") as u32,
                home_team_id: row.get("home_team_id"),
                away_team_id: row.get("away_team_id"),
                home_score: row.get("home_score"),
                away_score: row.get("away_score"),
                completed: row.get("completed"),
                neutral_site: row.get("neutral_site"),
                conference_game: row.get("conference_game"),
                start_date: parse_timestamp(&row.get::<String, _>("start_date"))?,
            });
        }
        Ok(games)
    }

    async fn season_team_stats(&self, season: i32) -> Result<Vec<TeamGameStats>> {
        let rows = sqlx::query(
            r#"
            SELECT s.* FROM team_game_stats s
            JOIN games g ON g.id = s.game_id
            WHERE g.season = ?
            ORDER BY g.week, g.start_date, s.team_id
            "#,
        )
        .bind(season)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TeamGameStats {
                game_id: row.get("game_id"),
                team_id: row.get("team_id"),
                points: row.get("points"),
                total_yards: row.get("total_yards"),
                passing_yards: row.get("passing_yards"),
                rushing_yards: row.get("rushing_yards"),
                turnovers: row.get("turnovers"),
                interceptions: row.get("interceptions"),
                sacks: row.get("sacks"),
                field_goals: row.get("field_goals"),
                success_rate: row.get("success_rate"),
                explosiveness: row.get("explosiveness"),
                third_down_rate: row.get("third_down_rate"),
            })
            .collect())
    }

    async fn load_profile(&self, team_id: &str, season: i32) -> Result<Option<TeamEfficiencyProfile>> {
        let row = sqlx::query("SELECT * FROM team_efficiency_profiles WHERE team_id = ? AND season = ?")
            .bind(team_id)
            .bind(season)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(profile_from_row).transpose()
    }

    async fn save_profile(&self, profile: &TeamEfficiencyProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO team_efficiency_profiles
            (team_id, season, offensive, defensive, offensive_averages, games_played,
             convergence_score, confidence_level, blended_with_prior, last_calculated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&profile.team_id)
        .bind(profile.season)
        .bind(serde_json::to_string(&profile.offensive)?)
        .bind(serde_json::to_string(&profile.defensive)?)
        .bind(serde_json::to_string(&profile.offensive_averages)?)
        .bind(profile.games_played as i64)
        .bind(profile.convergence_score)
        .bind(profile.confidence_level.as_str())
        .bind(profile.blended_with_prior)
        .bind(profile.last_calculated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn season_profiles(&self, season: i32) -> Result<Vec<TeamEfficiencyProfile>> {
        let rows = sqlx::query("SELECT * FROM team_efficiency_profiles WHERE season = ? ORDER BY team_id")
            .bind(season)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(profile_from_row).collect()
    }

    async fn latest_weight_change(&self, season: i32) -> Result<Option<WeightChangeLog>> {
        let row = sqlx::query(
            "SELECT * FROM weight_history WHERE season = ? ORDER BY timestamp DESC, rowid DESC LIMIT 1",
        )
        .bind(season)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(weight_change_from_row).transpose()
    }

    async fn append_weight_change(&self, entry: &WeightChangeLog) -> Result<()> {
        let regression_metrics = entry
            .regression_metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO weight_history
            (id, season, timestamp, reason, notes, previous_weights, new_weights, regression_metrics, actor)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(entry.season)
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.reason.to_string())
        .bind(&entry.notes)
        .bind(serde_json::to_string(&entry.previous_weights)?)
        .bind(serde_json::to_string(&entry.new_weights)?)
        .bind(regression_metrics)
        .bind(&entry.actor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn weight_history(&self, season: i32) -> Result<Vec<WeightChangeLog>> {
        let rows = sqlx::query(
            "SELECT * FROM weight_history WHERE season = ? ORDER BY timestamp DESC, rowid DESC",
        )
        .bind(season)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(weight_change_from_row).collect()
    }

    async fn latest_regression_analysis(&self, season: i32) -> Result<Option<RegressionAnalysisResult>> {
        let row = sqlx::query(
            "SELECT * FROM regression_analyses WHERE season = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(season)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.get("id");
        let regression_results = self.regression_metric_rows(&id).await?;

        Ok(Some(RegressionAnalysisResult {
            id,
            season: row.get("season"),
            overall_model_r_squared: row.get("overall_model_r_squared"),
            sample_size: row.get::<i64, _>("sample_size") as u32,
            predictive_accuracy: row.get("predictive_accuracy"),
            regression_results,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        }))
    }

    async fn insert_regression_analysis(&self, analysis: &RegressionAnalysisResult) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO regression_analyses
            (id, season, overall_model_r_squared, sample_size, predictive_accuracy, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&analysis.id)
        .bind(analysis.season)
        .bind(analysis.overall_model_r_squared)
        .bind(analysis.sample_size as i64)
        .bind(analysis.predictive_accuracy)
        .bind(analysis.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for metric in &analysis.regression_results {
            sqlx::query(
                r#"
                INSERT INTO regression_metrics
                (analysis_id, metric_name, coefficient, r_squared, p_value, ci_lower, ci_upper,
                 calculated_weight, is_significant)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&analysis.id)
            .bind(&metric.metric_name)
            .bind(metric.coefficient)
            .bind(metric.r_squared)
            .bind(metric.p_value)
            .bind(metric.confidence_interval.lower)
            .bind(metric.confidence_interval.upper)
            .bind(metric.calculated_weight)
            .bind(metric.is_statistically_significant)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_database_with_pool(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_sqlite_profile_overwrite_and_weight_history() {
        let store = SqliteStore::new(memory_pool().await);
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();

        let mut profile = TeamEfficiencyProfile {
            team_id: "ohio-state".to_string(),
            season: 2024,
            offensive: StatLine::from_fn(|_| 1.5),
            defensive: StatLine::from_fn(|_| -0.5),
            offensive_averages: StatLine::from_fn(|_| 30.0),
            games_played: 6,
            convergence_score: 0.7,
            confidence_level: ConfidenceLevel::Medium,
            blended_with_prior: false,
            last_calculated: at,
        };
        store.save_profile(&profile).await.unwrap();
        profile.games_played = 7;
        store.save_profile(&profile).await.unwrap();

        let loaded = store.load_profile("ohio-state", 2024).await.unwrap().unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(store.season_profiles(2024).await.unwrap().len(), 1);

        for (i, reason) in [WeightChangeReason::FallbackReset, WeightChangeReason::RegressionAnalysis]
            .into_iter()
            .enumerate()
        {
            store
                .append_weight_change(&WeightChangeLog {
                    id: format!("w{}", i),
                    season: 2024,
                    timestamp: at + chrono::Duration::hours(i as i64),
                    reason,
                    notes: None,
                    previous_weights: StatisticalImpactWeights::fallback(),
                    new_weights: StatisticalImpactWeights::fallback(),
                    regression_metrics: None,
                    actor: "test".to_string(),
                })
                .await
                .unwrap();
        }

        let history = store.weight_history(2024).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, WeightChangeReason::RegressionAnalysis);
        assert_eq!(store.latest_weight_change(2024).await.unwrap().unwrap().id, "w1");
    }

    #[tokio::test]
    async fn test_sqlite_regression_analysis_with_metric_rows() {
        let store = SqliteStore::new(memory_pool().await);
        let analysis = RegressionAnalysisResult {
            id: "ra-1".to_string(),
            season: 2024,
            overall_model_r_squared: 0.42,
            sample_size: 120,
            predictive_accuracy: 0.68,
            regression_results: vec![MetricRegression {
                metric_name: "passingOffense".to_string(),
                coefficient: 0.12,
                r_squared: 0.2,
                p_value: 0.01,
                confidence_interval: ConfidenceInterval { lower: 0.05, upper: 0.19 },
                calculated_weight: 0.3,
                is_statistically_significant: true,
            }],
            created_at: Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap(),
        };
        store.insert_regression_analysis(&analysis).await.unwrap();

        let loaded = store.latest_regression_analysis(2024).await.unwrap().unwrap();
        assert_eq!(loaded, analysis);
        assert!(store.latest_regression_analysis(2023).await.unwrap().is_none());
    }
}
