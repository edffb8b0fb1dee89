use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop an analysis run.
///
/// Per-line problems (decode failures, payloads a rule cannot parse) are not
/// errors here; the extractor counts them and the report lists them.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// A requested input path does not exist.
    #[error("Source not found: {0}")]
    SourceNotFound(PathBuf),

    /// A file exists but could not be opened or read.
    #[error("Cannot read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pattern for rule '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// Bad CLI combination or rule file contents.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AnalysisError {
    /// `true` for errors that must stop the run before any report is printed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AnalysisError::SourceNotFound(_)
                | AnalysisError::InvalidPattern { .. }
                | AnalysisError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
