//! Extraction and correlation layer for logscope.
//!
//! Discovers and streams log files, turns matching lines into typed records
//! through a pattern registry, joins record streams by key, aggregates the
//! results and runs the analysis presets.

pub mod aggregator;
pub mod analysis;
pub mod correlator;
pub mod extractor;
pub mod reader;
pub mod registry;

pub use logscope_core as core;
