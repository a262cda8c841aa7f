//! Library root for the `govern_pipeline` crate
//! Compliance & risk aggregation: ingest, normalize, prioritize.

// Core error handling
pub mod errors;

// Configuration
pub mod config;

// Normalized store
pub mod records;
pub mod store;
pub mod store_cipher;
pub mod audit;

// Ingestion
pub mod compliance_ingest;
pub mod risk_ingest;

// Guidance join & ranking
pub mod rule_names;
pub mod guidance;
pub mod prioritizer;

// Invocation handling
pub mod delivery;
pub mod pipeline;


pub use errors::{PipelineError, PipelineResult};
pub use pipeline::PipelineContext;
pub use store::NormalizedStore;
