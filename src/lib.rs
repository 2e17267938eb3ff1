pub mod adapters;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod rules;
pub mod statement;
pub mod store;

pub use config::IngestConfig;
pub use errors::{IngestError, Result};
pub use pipeline::{BatchSummary, Pipeline};
