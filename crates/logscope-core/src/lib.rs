//! Shared data model for logscope.
//!
//! Typed event records, join keys, aggregate buckets, errors, timestamp
//! handling and number formatting used by the extraction, correlation and
//! reporting crates.

pub mod data_processors;
pub mod error;
pub mod formatting;
pub mod models;
pub mod settings;
pub mod stats;

pub use error::{AnalysisError, Result};
