//! Real-time sports feature serving.
//!
//! A fixed registry of named formulas over raw event rows, served through a
//! dispatcher that layers a fingerprint cache, per-feature circuit breakers,
//! a bounded worker pool and metrics on top.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod features;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod stream;

pub use error::{ComputeError, ErrorKind, FeatureError};
pub use models::{FeatureRequest, FeatureResponse, Record, Value};
pub use pipeline::{FeaturePipeline, PipelinePolicy};
