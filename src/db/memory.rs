use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::db::{SeedData, Store};
use crate::models::*;

#[derive(Default)]
struct Tables {
    teams: HashMap<String, Team>,
    games: Vec<GameRecord>,
    stats: Vec<TeamGameStats>,
    profiles: HashMap<(String, i32), TeamEfficiencyProfile>,
    weight_history: Vec<WeightChangeLog>,
    regression_analyses: Vec<RegressionAnalysisResult>,
}

/// In-process `Store` for tests and dry runs. Reads and writes can be made to
/// fail on demand to exercise the fail-soft and fail-loud paths.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: SeedData) -> Self {
        let store = Self::new();
        store.load(data);
        store
    }

    pub fn load(&self, data: SeedData) {
        let mut tables = self.write_tables();
        for team in data.teams {
            tables.teams.insert(team.id.clone(), team);
        }
        tables.games.extend(data.games);
        tables.stats.extend(data.stats);
    }

    pub fn insert_team(&self, team: Team) {
        self.write_tables().teams.insert(team.id.clone(), team);
    }

    pub fn insert_game(&self, game: GameRecord) {
        self.write_tables().games.push(game);
    }

    pub fn insert_team_game_stats(&self, stats: TeamGameStats) {
        self.write_tables().stats.push(stats);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read_tables(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("memory store: reads disabled"));
        }
        Ok(self.tables.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn checked_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("memory store: writes disabled"));
        }
        Ok(self.write_tables())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn team_exists(&self, team_id: &str) -> Result<bool> {
        Ok(self.read_tables()?.teams.contains_key(team_id))
    }

    async fn season_games(&self, season: i32) -> Result<Vec<GameRecord>> {
        let tables = self.read_tables()?;
        let mut games: Vec<GameRecord> = tables
            .games
            .iter()
            .filter(|g| g.season == season)
            .cloned()
            .collect();
        games.sort_by_key(|g| g.order_key());
        Ok(games)
    }

    async fn season_team_stats(&self, season: i32) -> Result<Vec<TeamGameStats>> {
        let tables = self.read_tables()?;
        let game_ids: std::collections::HashSet<&str> = tables
            .games
            .iter()
            .filter(|g| g.season == season)
            .map(|g| g.id.as_str())
            .collect();
        Ok(tables
            .stats
            .iter()
            .filter(|s| game_ids.contains(s.game_id.as_str()))
            .cloned()
            .collect())
    }

    async fn load_profile(&self, team_id: &str, season: i32) -> Result<Option<TeamEfficiencyProfile>> {
        Ok(self
            .read_tables()?
            .profiles
            .get(&(team_id.to_string(), season))
            .cloned())
    }

    async fn save_profile(&self, profile: &TeamEfficiencyProfile) -> Result<()> {
        self.checked_write()?
            .profiles
            .insert((profile.team_id.clone(), profile.season), profile.clone());
        Ok(())
    }

    async fn season_profiles(&self, season: i32) -> Result<Vec<TeamEfficiencyProfile>> {
        let mut profiles: Vec<TeamEfficiencyProfile> = self
            .read_tables()?
            .profiles
            .values()
            .filter(|p| p.season == season)
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        Ok(profiles)
    }

    async fn latest_weight_change(&self, season: i32) -> Result<Option<WeightChangeLog>> {
        Ok(self.weight_history(season).await?.into_iter().next())
    }

    async fn append_weight_change(&self, entry: &WeightChangeLog) -> Result<()> {
        self.checked_write()?.weight_history.push(entry.clone());
        Ok(())
    }

    async fn weight_history(&self, season: i32) -> Result<Vec<WeightChangeLog>> {
        let tables = self.read_tables()?;
        // Insertion order breaks timestamp ties, newest first.
        let mut history: Vec<(usize, WeightChangeLog)> = tables
            .weight_history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.season == season)
            .map(|(i, e)| (i, e.clone()))
            .collect();
        history.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then(b.0.cmp(&a.0)));
        Ok(history.into_iter().map(|(_, e)| e).collect())
    }

    async fn latest_regression_analysis(&self, season: i32) -> Result<Option<RegressionAnalysisResult>> {
        let tables = self.read_tables()?;
        Ok(tables
            .regression_analyses
            .iter()
            .enumerate()
            .filter(|(_, a)| a.season == season)
            .max_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)))
            .map(|(_, a)| a.clone()))
    }

    async fn insert_regression_analysis(&self, analysis: &RegressionAnalysisResult) -> Result<()> {
        self.checked_write()?.regression_analyses.push(analysis.clone());
        Ok(())
    }
}
