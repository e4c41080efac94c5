use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

use gridcast::audit::{AuditReport, AuditSuite};
use gridcast::db::{demo_season, MemoryStore, Store};
use gridcast::models::{WeightChangeReason, METHOD_EFFICIENCY_MATCHUP};
use gridcast::services::{PredictionEngine, RegressionAnalyzer};
use gridcast::utils::FixedClock;
use gridcast::EngineConfig;

#[tokio::test]
async fn test_full_feedback_loop() {
    let store = Arc::new(MemoryStore::with_data(demo_season(2024)));
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 11, 18, 9, 0, 0).unwrap()));
    let config = EngineConfig::default();
    let engine = PredictionEngine::new(store.clone(), clock.clone(), config.clone());

    // Profiles
    let summary = engine.recalculate_season(2024).await.unwrap();
    assert_eq!(summary.updated.len(), 12);
    assert!(summary.failed.is_empty());

    // Regression and weights
    clock.advance(Duration::minutes(5));
    let analyzer = RegressionAnalyzer::new(store.clone(), clock.clone(), config.weights.clone());
    let analysis = analyzer.run(2024).await.unwrap();
    assert_eq!(analysis.sample_size, 66);
    assert!((0.0..=1.0).contains(&analysis.overall_model_r_squared));

    clock.advance(Duration::minutes(5));
    let entry = engine
        .weights()
        .update_weights_from_regression(2024, &analysis, Some("integration"))
        .await
        .unwrap();
    assert_eq!(entry.reason, WeightChangeReason::RegressionAnalysis);
    assert_eq!(engine.weights().current_weights(2024).await, entry.new_weights);

    // Next week's slate
    let upcoming: Vec<_> = store
        .season_games(2024)
        .await
        .unwrap()
        .into_iter()
        .filter(|g| !g.is_finished())
        .collect();
    assert_eq!(upcoming.len(), 6);
    for game in &upcoming {
        let result = engine.predict_game(game).await.unwrap();
        assert!(result.prediction.method.starts_with(METHOD_EFFICIENCY_MATCHUP));
        assert!(result.prediction.home_score.is_finite());
        assert!(result.prediction.home_score >= 0.0 && result.prediction.away_score >= 0.0);
        assert!(result.check.is_valid || result.check.corrected_prediction.is_some());
    }

    // Audit
    let suite = AuditSuite::new(store.clone(), clock.clone(), config);
    let report = suite.run(2024).await;
    assert_eq!(report.reports.len(), 5);
    assert!((0.0..=100.0).contains(&report.overall.score));

    for entry in &report.reports {
        match entry {
            AuditReport::DataPipeline(r) => assert!(r.base.is_valid, "{:?}", r.base.errors),
            AuditReport::WeightVerification(r) => {
                assert!(r.base.is_valid, "{:?}", r.base.errors);
                assert!(r.expected_weights.is_some());
                assert!(r.drifted.is_empty());
            }
            AuditReport::RegressionAudit(r) => {
                assert_eq!(r.analysis_id.as_deref(), Some(analysis.id.as_str()));
            }
            AuditReport::PredictionAccuracy(r) => {
                assert!(!r.predictions.is_empty());
                assert!(r.win_metrics.is_some());
            }
            AuditReport::SampleGames(r) => {
                assert!(!r.games.is_empty());
                assert_eq!(r.guide.bands.len(), 4);
            }
        }
    }
}

#[tokio::test]
async fn test_audit_after_manual_reset_expects_fallback() {
    let store = Arc::new(MemoryStore::with_data(demo_season(2024)));
    let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 11, 18, 9, 0, 0).unwrap()));
    let engine = PredictionEngine::new(store.clone(), clock.clone(), EngineConfig::default());

    engine
        .weights()
        .reset_to_fallback_weights(2024, "preseason", None)
        .await
        .unwrap();

    let report = AuditSuite::new(store, clock, EngineConfig::default()).run(2024).await;
    let verification = report
        .reports
        .iter()
        .find_map(|r| match r {
            AuditReport::WeightVerification(v) => Some(v),
            _ => None,
        })
        .unwrap();
    assert!(verification.base.is_valid);
    assert_eq!(verification.max_drift, 0.0);

    let regression = report
        .reports
        .iter()
        .find(|r| r.name() == "regression-audit")
        .unwrap();
    assert!(regression.base().has_code("NO_REGRESSION_ANALYSIS"));
    assert!(!report.overall.is_valid);
}
