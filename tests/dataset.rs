use std::path::PathBuf;

use vlr_forecast::config::ForecastConfig;
use vlr_forecast::dataset::{self, DatasetFilter};
use vlr_forecast::error::ForecastError;
use vlr_forecast::match_record::Tier;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn fixture_loads_with_missing_metrics_as_unknown() {
    let records = dataset::load_csv_path(&fixture("map_matches.csv")).unwrap();
    assert_eq!(records.len(), 440);
    assert!(records.iter().all(|r| r.winner == r.team_a || r.winner == r.team_b));
    assert!(records.iter().any(|r| r.team_a_perf.acs.is_none()));
    assert!(records.iter().any(|r| r.team_b_perf.kd.is_none()));
}

#[test]
fn missing_columns_are_reported_together() {
    let err = dataset::load_csv_path(&fixture("missing_columns.csv")).unwrap_err();
    match err.downcast_ref::<ForecastError>() {
        Some(ForecastError::Schema { missing }) => {
            assert_eq!(missing, &vec!["tier", "teamA_KD", "teamB_KD"]);
        }
        other => panic!("expected schema error, got {other:?}"),
    }
}

#[test]
fn config_filters_narrow_the_dataset() {
    let records = dataset::load_csv_path(&fixture("map_matches.csv")).unwrap();
    let cfg = ForecastConfig::from_lookup(|key| match key {
        "ONLY_TIER1" => Some("true".to_string()),
        "MAP_POOL" => Some("Ascent,Bind".to_string()),
        "FILTER_TOP_TEAMS" => Some("1".to_string()),
        "TOP_TEAMS_PER_REGION" => Some("3".to_string()),
        _ => None,
    });
    let kept = DatasetFilter::from_config(&cfg).apply(records.clone());
    assert!(!kept.is_empty());
    assert!(kept.len() < records.len());
    assert!(kept.iter().all(|r| r.tier == Tier::One));
    assert!(kept.iter().all(|r| r.map == "Ascent" || r.map == "Bind"));

    let allowed = dataset::top_teams_by_region(&records, 3);
    assert!(allowed.values().all(|teams| teams.len() == 3));
}
