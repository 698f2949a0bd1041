pub mod cache;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod consumer;
pub mod index;
pub mod metrics;
pub mod queue;
pub mod supervisor;
pub mod utils;

pub use cluster::{ClusterId, ImageClusteringPipeline, Outcome};
pub use config::Opts;
