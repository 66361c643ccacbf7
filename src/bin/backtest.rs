use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use vlr_forecast::artifacts::ArtifactStore;
use vlr_forecast::calibration::{self, ECE_BINS};
use vlr_forecast::config::ForecastConfig;
use vlr_forecast::dataset;
use vlr_forecast::elo::{EloConfig, EloRatingEngine};
use vlr_forecast::features::FeatureVectorBuilder;
use vlr_forecast::logging::init_logging;
use vlr_forecast::store::HistoricalMatchStore;
use vlr_forecast::trainer::{TemporalTrainer, TrainerConfig, temporal_split};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging("warn");

    let mut cfg = ForecastConfig::from_env();
    if let Some(csv) = parse_path_arg("--csv") {
        cfg.data_csv = csv;
    }
    if has_flag("--tournament") {
        cfg.tournament_mode = true;
    }
    let c = parse_f64_arg("--c").unwrap_or(1.0);
    let bins = parse_usize_arg("--bins").unwrap_or(ECE_BINS).max(1);

    let store = dataset::load_filtered(&cfg, &cfg.data_csv)?;
    let trainer_cfg = TrainerConfig {
        c,
        recency: cfg.recency(),
        ..TrainerConfig::default()
    };
    let rows = FeatureVectorBuilder::new(&store, trainer_cfg.recency, trainer_cfg.elo)
        .build_feature_table()?;
    // fit() never touches the artifact directory.
    let report = TemporalTrainer::new(trainer_cfg, ArtifactStore::new("artifacts")).fit(&rows)?;
    let split = temporal_split(&rows).ok_or_else(|| anyhow!("no feature rows"))?;
    let model = &report.artifact;

    let labels: Vec<u8> = split.valid.iter().map(|r| r.label()).collect();
    let raw: Vec<f64> = split
        .valid
        .iter()
        .map(|r| {
            let z = model.scaler.transform(&r.features.values());
            model
                .classifier
                .prob_for_label(&z, 1)
                .context("classifier lacks label 1")
        })
        .collect::<Result<_>>()?;
    let calibrated = model.calibrator.apply_all(&raw);
    let coin_flip = vec![0.5; labels.len()];

    println!("Map win backtest");
    println!("Dataset: {}", cfg.data_csv.display());
    println!(
        "Rows: {} (train {}, valid {}), cutoff {}",
        rows.len(),
        split.train.len(),
        split.valid.len(),
        split.cutoff
    );
    println!("Calibrator: {}", model.calibrator.kind());
    if let Some(ece) = report.platt_ece {
        println!("Platt ECE on validation: {ece:.4}");
    }
    println!();
    print_metrics("Coin flip", calibration::evaluate_probs(&coin_flip, &labels));
    print_metrics("Raw train", report.raw_train);
    print_metrics("Raw valid", report.raw_valid);
    print_metrics("Calibrated valid", report.calibrated_valid);

    println!();
    print_bins("Raw validation bins", &raw, &labels, bins);
    println!();
    print_bins("Calibrated validation bins", &calibrated, &labels, bins);
    println!();
    print_top_ratings(&store, trainer_cfg.elo, 10)?;
    Ok(())
}

fn print_metrics(label: &str, metrics: calibration::Metrics) {
    println!("{label}:");
    println!(
        "  samples={} brier={:.4} log_loss={:.4} ece={:.4} accuracy={:.3}",
        metrics.samples, metrics.brier, metrics.log_loss, metrics.ece, metrics.accuracy
    );
}

fn print_bins(label: &str, probs: &[f64], labels: &[u8], bins: usize) {
    println!("{label}:");
    for bin in calibration::calibration_bins(probs, labels, bins) {
        if bin.count == 0 {
            continue;
        }
        println!(
            "  [{:.1}, {:.1}) n={:<4} avg_pred={:.3} actual={:.3}",
            bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
        );
    }
}

fn print_top_ratings(store: &HistoricalMatchStore, cfg: EloConfig, top: usize) -> Result<()> {
    let elo = EloRatingEngine::replay(cfg, store.records())?;
    let mut ratings: Vec<_> = elo.ratings().collect();
    ratings.sort_by(|a, b| b.rating.total_cmp(&a.rating).then_with(|| a.team.cmp(&b.team)));
    println!("Top map ratings:");
    for r in ratings.into_iter().take(top) {
        println!(
            "  {:<24} {:<8} {:>7.1} (last played {})",
            r.team, r.map, r.rating, r.last_updated
        );
    }
    Ok(())
}

fn arg_value(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}=")) {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    arg_value(name)
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn parse_f64_arg(name: &str) -> Option<f64> {
    arg_value(name).and_then(|raw| raw.parse::<f64>().ok())
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    arg_value(name).and_then(|raw| raw.parse::<usize>().ok())
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
