mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridcast")]
#[command(about = "Opponent-adjusted college football efficiency and prediction engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    InitDb,
    /// Load the bundled demo season
    Seed {
        #[arg(short, long, default_value = "2024")]
        season: i32,
    },
    /// Rebuild efficiency profiles (one team, or the whole season)
    Recalculate {
        #[arg(short, long)]
        season: i32,
        #[arg(short, long)]
        team: Option<String>,
    },
    /// Run the season regression and optionally apply it to the weights
    Regress {
        #[arg(short, long)]
        season: i32,
        #[arg(long)]
        apply: bool,
    },
    /// Show current weights and the change history
    Weights {
        #[arg(short, long)]
        season: i32,
    },
    /// Reset weights to the fallback vector
    ResetWeights {
        #[arg(short, long)]
        season: i32,
        #[arg(short, long, default_value = "manual reset")]
        reason: String,
    },
    /// Predict scheduled games, or a single matchup
    Predict {
        #[arg(short, long)]
        season: i32,
        #[arg(long)]
        home: Option<String>,
        #[arg(long)]
        away: Option<String>,
        #[arg(long)]
        neutral: bool,
    },
    /// Run every validator against the season
    Audit {
        #[arg(short, long)]
        season: i32,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            tracing::info!("Initializing database...");
            gridcast::db::init_database().await?;
        }
        Commands::Seed { season } => cli::seed(season).await?,
        Commands::Recalculate { season, team } => cli::recalculate(season, team.as_deref()).await?,
        Commands::Regress { season, apply } => cli::regress(season, apply).await?,
        Commands::Weights { season } => cli::show_weights(season).await?,
        Commands::ResetWeights { season, reason } => cli::reset_weights(season, &reason).await?,
        Commands::Predict {
            season,
            home,
            away,
            neutral,
        } => match (home, away) {
            (Some(home), Some(away)) => cli::predict_matchup(season, &home, &away, neutral).await?,
            (None, None) => cli::predict_upcoming(season).await?,
            _ => println!("❌ Pass both --home and --away, or neither"),
        },
        Commands::Audit { season, json } => cli::audit(season, json).await?,
    }

    Ok(())
}
