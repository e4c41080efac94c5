use anyhow::Result;
use std::sync::Arc;

use gridcast::audit::AuditSuite;
use gridcast::db::{create_pool, init_database_with_pool, seed_data, SqliteStore, Store};
use gridcast::models::{StatCategory, WeightKey};
use gridcast::services::{GamePrediction, PredictionEngine, RegressionAnalyzer};
use gridcast::utils::{Clock, SystemClock};
use gridcast::EngineConfig;

struct Context {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Context {
    async fn open() -> Result<Self> {
        let pool = create_pool().await?;
        init_database_with_pool(&pool).await?;
        Ok(Self {
            store: Arc::new(SqliteStore::new(pool)),
            clock: Arc::new(SystemClock),
            config: EngineConfig::from_env(),
        })
    }

    fn engine(&self) -> PredictionEngine {
        PredictionEngine::new(self.store.clone(), self.clock.clone(), self.config.clone())
    }
}

pub async fn seed(season: i32) -> Result<()> {
    let pool = create_pool().await?;
    init_database_with_pool(&pool).await?;
    let store = SqliteStore::new(pool);

    println!("🌱 Seeding demo season {}...", season);
    seed_data(&store, season).await?;
    println!("✅ Seed complete. Next: gridcast recalculate --season {}", season);
    Ok(())
}

pub async fn recalculate(season: i32, team: Option<&str>) -> Result<()> {
    let ctx = Context::open().await?;
    let engine = ctx.engine();

    if let Some(team) = team {
        println!("🔄 Recalculating {} for {}...", team, season);
        let profile = engine.recalculate_profile(team, season).await?;
        println!("✅ {} profile saved:", team);
        println!(
            "   Games: {} | Confidence: {} | Convergence: {:.2}{}",
            profile.games_played,
            profile.confidence_level,
            profile.convergence_score,
            if profile.blended_with_prior { " | blended with prior season" } else { "" }
        );
        for category in StatCategory::ALL {
            println!(
                "   {:<16} off {:+7.2}  def {:+7.2}",
                category.as_str(),
                profile.offensive.get(category),
                profile.defensive.get(category)
            );
        }
        return Ok(());
    }

    println!("🔄 Recalculating every {} profile...", season);
    let summary = engine.recalculate_season(season).await?;
    println!("✅ Updated {} profiles", summary.updated.len());
    if !summary.failed.is_empty() {
        println!("⚠️  {} teams failed:", summary.failed.len());
        for (team, error) in &summary.failed {
            println!("   • {}: {}", team, error);
        }
    }
    Ok(())
}

pub async fn regress(season: i32, apply: bool) -> Result<()> {
    let ctx = Context::open().await?;
    let analyzer = RegressionAnalyzer::new(ctx.store.clone(), ctx.clock.clone(), ctx.config.weights.clone());

    println!("📈 Running regression analysis for {}...", season);
    let analysis = analyzer.run(season).await?;
    println!(
        "   R² {:.3} | games {} | sign accuracy {:.1}%",
        analysis.overall_model_r_squared,
        analysis.sample_size,
        analysis.predictive_accuracy * 100.0
    );
    for metric in &analysis.regression_results {
        println!(
            "   {} {:<20} coef {:+.3}  R² {:.3}  p {:.4}  weight {:.3}",
            if metric.is_statistically_significant { "✓" } else { " " },
            metric.metric_name,
            metric.coefficient,
            metric.r_squared,
            metric.p_value,
            metric.calculated_weight
        );
    }

    if apply {
        let engine = ctx.engine();
        let entry = engine
            .weights()
            .update_weights_from_regression(season, &analysis, Some("cli"))
            .await?;
        println!("✅ Weights updated (entry {})", entry.id);
        if let Some(notes) = &entry.notes {
            println!("   ⚠️  {}", notes);
        }
    } else {
        println!("💡 Rerun with --apply to update the season weights");
    }
    Ok(())
}

pub async fn show_weights(season: i32) -> Result<()> {
    let ctx = Context::open().await?;
    let engine = ctx.engine();
    let weights = engine.weights().current_weights(season).await;

    println!("⚖️  Current {} weights:", season);
    for key in WeightKey::ALL {
        println!("   {:<20} {:.3}", key.as_str(), weights.get(key));
    }
    println!("   {:<20} {:.3}", "total", weights.total());

    let history = engine.weights().weight_history(season).await;
    if history.is_empty() {
        println!("\n📭 No weight changes recorded; fallback weights are in effect");
        return Ok(());
    }
    println!("\n📜 History (newest first):");
    for entry in history.iter().take(10) {
        println!(
            "   {} {} by {}{}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.reason,
            entry.actor,
            entry.notes.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
        );
    }
    Ok(())
}

pub async fn reset_weights(season: i32, reason: &str) -> Result<()> {
    let ctx = Context::open().await?;
    let entry = ctx
        .engine()
        .weights()
        .reset_to_fallback_weights(season, reason, Some("cli"))
        .await?;
    println!("✅ {} weights reset to fallback (entry {})", season, entry.id);
    Ok(())
}

fn print_prediction(label: &str, result: &GamePrediction) {
    let p = &result.prediction;
    println!("🏈 {}", label);
    println!(
        "   {} {:.1} - {:.1} {} | confidence {:.0}% | {}",
        p.home_team_id,
        p.home_score,
        p.away_score,
        p.away_team_id,
        p.confidence * 100.0,
        p.method
    );
    if let Some(matchup) = &result.matchup {
        println!(
            "   Home win probability {:.1}% ({} confidence)",
            matchup.home_win_probability * 100.0,
            matchup.confidence_level
        );
    }
    if let Some(reason) = &result.check.correction_reason {
        println!("   ⚠️  Corrected: {}", reason);
    }
    for warning in &result.check.warnings {
        println!("   ⚠️  {}", warning);
    }
}

pub async fn predict_matchup(season: i32, home: &str, away: &str, neutral: bool) -> Result<()> {
    let ctx = Context::open().await?;
    let game_id = format!("{}-{}-{}", season, away, home);
    let result = ctx
        .engine()
        .predict_matchup(season, home, away, &game_id, neutral)
        .await?;
    let separator = if neutral { "vs" } else { "@" };
    print_prediction(&format!("{} {} {}", away, separator, home), &result);
    Ok(())
}

pub async fn predict_upcoming(season: i32) -> Result<()> {
    let ctx = Context::open().await?;
    let engine = ctx.engine();

    println!("🔮 Predicting scheduled {} games...", season);
    let mut games: Vec<_> = ctx
        .store
        .season_games(season)
        .await?
        .into_iter()
        .filter(|g| !g.is_finished())
        .collect();
    if games.is_empty() {
        println!("📭 No scheduled games found. Try: gridcast seed --season {}", season);
        return Ok(());
    }
    games.sort_by_key(|g| g.order_key());

    for game in &games {
        match engine.predict_game(game).await {
            Ok(result) => print_prediction(
                &format!("Week {}: {} @ {}", game.week, game.away_team_id, game.home_team_id),
                &result,
            ),
            Err(e) => println!("❌ {}: {}", game.id, e),
        }
    }
    println!("✅ Predicted {} games", games.len());
    Ok(())
}

pub async fn audit(season: i32, json: bool) -> Result<()> {
    let ctx = Context::open().await?;
    let suite = AuditSuite::new(ctx.store.clone(), ctx.clock.clone(), ctx.config.clone());

    println!("🔍 Auditing {}...", season);
    let report = suite.run(season).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for entry in &report.reports {
        let base = entry.base();
        println!(
            "{} {:<20} score {:5.1}",
            if base.is_valid { "✅" } else { "❌" },
            entry.name(),
            base.score
        );
        for error in &base.errors {
            println!("   ❌ [{}] {}", error.code, error.message);
        }
        for warning in base.warnings.iter().take(5) {
            println!("   ⚠️  {}", warning);
        }
    }

    println!("\n📊 Overall score {:.1}", report.overall.score);
    if !report.overall.recommendations.is_empty() {
        println!("💡 Recommendations:");
        for recommendation in &report.overall.recommendations {
            println!("   • {}", recommendation);
        }
    }
    Ok(())
}
