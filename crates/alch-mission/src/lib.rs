//! Mission execution for alchemistral: the dependency-resolving DAG
//! scheduler with bounded agent concurrency and the pipeline that turns one
//! user message into a planned, executed, and merged mission.

pub mod executor;
pub mod pipeline;

pub use executor::{DagExecutor, DagOutcome, DagRequest, MAX_CONCURRENT_AGENTS};
pub use pipeline::MissionPipeline;
