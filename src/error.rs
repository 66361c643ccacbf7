use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("dataset is missing required columns: {}", missing.join(", "))]
    Schema { missing: Vec<String> },

    #[error("invalid row at line {line}: {reason}")]
    InvalidRow { line: u64, reason: String },

    #[error("invalid match record: {0}")]
    InvalidRecord(String),

    #[error("no history available: {0}")]
    DataUnavailable(String),

    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("model artifact not found at {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("unsupported artifact: {0}")]
    ArtifactVersion(String),

    #[error("out-of-order replay for {team} on {map}: {date} is before {last}")]
    OutOfOrderReplay {
        team: String,
        map: String,
        date: NaiveDate,
        last: NaiveDate,
    },

    #[error("training set is degenerate: {0}")]
    DegenerateTrainingSet(String),
}

pub type Result<T> = std::result::Result<T, ForecastError>;
