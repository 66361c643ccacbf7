use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vlr_forecast::artifacts::ArtifactStore;
use vlr_forecast::config::{DataSource, ForecastConfig};
use vlr_forecast::dataset::{self, DatasetFilter};
use vlr_forecast::elo::EloConfig;
use vlr_forecast::live_cache::LiveCache;
use vlr_forecast::logging::init_logging;
use vlr_forecast::predict::{Prediction, PredictionService};
use vlr_forecast::store::HistoricalMatchStore;
use vlr_forecast::trainer::{TemporalTrainer, TrainerConfig};

#[derive(Parser)]
#[command(name = "vlr_forecast")]
#[command(about = "Calibrated map win probabilities for competitive Valorant", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the feature table, fit, calibrate and save the model
    Train {
        /// Bulk dataset (overrides DATA_CSV)
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Artifact directory (overrides ARTIFACT_DIR)
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Win probability for one map between two teams
    Predict {
        #[arg(long = "teamA")]
        team_a: String,
        #[arg(long = "teamB")]
        team_b: String,
        #[arg(long)]
        map: String,
        /// Average both orientations so the pair sums to one
        #[arg(long)]
        symmetric: bool,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Live cache statistics
    CacheStats,
    /// Delete cache rows older than the retention window
    Prune {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(if cli.verbose { "debug" } else { "info" });
    let cfg = ForecastConfig::from_env();

    if let Err(err) = run(cli.command, cfg) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands, mut cfg: ForecastConfig) -> Result<()> {
    match command {
        Commands::Train { csv, artifacts } => {
            if let Some(csv) = csv {
                cfg.data_csv = csv;
                cfg.data_source = DataSource::Bulk;
            }
            if let Some(dir) = artifacts {
                cfg.artifact_dir = dir;
            }
            train(&cfg)
        }
        Commands::Predict {
            team_a,
            team_b,
            map,
            symmetric,
            json,
            artifacts,
        } => {
            if let Some(dir) = artifacts {
                cfg.artifact_dir = dir;
            }
            predict(&cfg, &team_a, &team_b, &map, symmetric, json)
        }
        Commands::CacheStats => {
            let cache = LiveCache::from_config(&cfg)?;
            let stats = cache.stats(Utc::now())?;
            println!("cache:          {}", cache.db_path().display());
            println!("total records:  {}", stats.total_records);
            println!("unique teams:   {}", stats.unique_teams);
            println!("cached (24h):   {}", stats.recent_records_24h);
            println!(
                "oldest write:   {}",
                stats.oldest_cache.as_deref().unwrap_or("-")
            );
            println!("size (bytes):   {}", stats.database_size_bytes);
            Ok(())
        }
        Commands::Prune { days } => {
            let cache = LiveCache::from_config(&cfg)?;
            let deleted = cache.prune(days.max(0), Utc::now())?;
            println!("pruned {deleted} rows older than {days} days");
            Ok(())
        }
    }
}

fn train(cfg: &ForecastConfig) -> Result<()> {
    let store = match cfg.data_source {
        DataSource::Bulk => dataset::load_filtered(cfg, &cfg.data_csv)?,
        DataSource::Live => {
            let cache = LiveCache::from_config(cfg)?;
            let records = cache.all_records()?;
            HistoricalMatchStore::new(DatasetFilter::from_config(cfg).apply(records))
        }
    };
    info!(records = store.len(), "training history loaded");

    let trainer = TemporalTrainer::new(
        TrainerConfig {
            recency: cfg.recency(),
            ..TrainerConfig::default()
        },
        ArtifactStore::new(&cfg.artifact_dir),
    );
    let report = trainer.train_store(&store)?;

    let split = &report.artifact.split;
    println!(
        "train rows {} (through {}), valid rows {}",
        split.train_rows, split.train_max_date, split.valid_rows
    );
    println!(
        "raw train       brier {:.4}  log loss {:.4}  ece {:.4}",
        report.raw_train.brier, report.raw_train.log_loss, report.raw_train.ece
    );
    println!(
        "raw valid       brier {:.4}  log loss {:.4}  ece {:.4}",
        report.raw_valid.brier, report.raw_valid.log_loss, report.raw_valid.ece
    );
    println!(
        "calibrated      brier {:.4}  log loss {:.4}  ece {:.4}  ({})",
        report.calibrated_valid.brier,
        report.calibrated_valid.log_loss,
        report.calibrated_valid.ece,
        report.artifact.calibrator.kind()
    );
    Ok(())
}

fn predict(
    cfg: &ForecastConfig,
    team_a: &str,
    team_b: &str,
    map: &str,
    symmetric: bool,
    json: bool,
) -> Result<()> {
    let store = match cfg.data_source {
        DataSource::Bulk => dataset::load_filtered(cfg, &cfg.data_csv)?,
        // Serving never fails on the cache; an empty history yields the fallback.
        DataSource::Live => LiveCache::from_config(cfg)
            .and_then(|cache| {
                cache.history_for_pair_filtered(
                    team_a,
                    team_b,
                    cfg.lookback_days,
                    &DatasetFilter::from_config(cfg),
                )
            })
            .unwrap_or_else(|err| {
                warn!(error = ?err, "live history unavailable");
                HistoricalMatchStore::default()
            }),
    };
    let service = PredictionService::load(
        &ArtifactStore::new(&cfg.artifact_dir),
        cfg.recency(),
        EloConfig::default(),
    );

    if symmetric {
        let sym = service.predict_symmetric(&store, team_a, team_b, map);
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&sym).context("serialize prediction")?
            );
        } else {
            print_prediction(&sym.forward);
            println!(
                "symmetric: {team_a} {:.1}% / {team_b} {:.1}% (raw asymmetry {:.4}{})",
                sym.prob_team_a * 100.0,
                sym.prob_team_b * 100.0,
                sym.raw_asymmetry,
                if sym.asymmetry_detected { ", detected" } else { "" }
            );
        }
        return Ok(());
    }

    let prediction = service.predict(&store, team_a, team_b, map);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&prediction).context("serialize prediction")?
        );
    } else {
        print_prediction(&prediction);
    }
    Ok(())
}

fn print_prediction(p: &Prediction) {
    println!("{}", p.explanation);
    println!(
        "{} {:.1}% / {} {:.1}%  uncertainty: {:?}",
        p.team_a,
        p.prob_team_a * 100.0,
        p.team_b,
        p.prob_team_b * 100.0,
        p.uncertainty
    );
    if let Some(reason) = &p.fallback_reason {
        println!("fallback: {reason}");
    }
}
