pub mod artifacts;
pub mod calibration;
pub mod config;
pub mod dataset;
pub mod elo;
pub mod error;
pub mod features;
pub mod http_cache;
pub mod live_cache;
pub mod logging;
pub mod match_record;
pub mod model;
pub mod predict;
pub mod recency;
pub mod store;
pub mod trainer;
pub mod upstream;
