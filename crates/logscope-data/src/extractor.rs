//! Streaming event extraction.
//!
//! [`EventExtractor::extract`] wraps a line iterator and lazily yields the
//! typed records produced by the registry, in original line order. Counters,
//! parse errors and read failures accumulate on the side and are available
//! once the iterator is exhausted.

use std::path::PathBuf;

use logscope_core::data_processors::TimestampProcessor;
use logscope_core::models::{EventRecord, FieldValue};
use logscope_core::{AnalysisError, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::reader::{LineSource, SourceLine};
use crate::registry::{LineMatch, PatternParseError, PatternRegistry};

/// Lines between two progress events.
const PROGRESS_INTERVAL: u64 = 1_000_000;

// ── Filters ───────────────────────────────────────────────────────────────────

/// Which peer's lines to keep, by the `[Peer]` tag in each line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFilter {
    /// Lines tagged `[Server]`.
    Server,
    /// Lines tagged `[Client…` (any client).
    Client,
    /// Lines tagged with exactly `[<tag>]`.
    Exact(String),
}

impl PeerFilter {
    pub fn parse(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "server" => PeerFilter::Server,
            "client" => PeerFilter::Client,
            _ => PeerFilter::Exact(mode.to_string()),
        }
    }

    pub fn accepts(&self, line: &str) -> bool {
        match self {
            PeerFilter::Server => line.contains("[Server]"),
            PeerFilter::Client => line.contains("[Client"),
            PeerFilter::Exact(tag) => line.contains(&format!("[{}]", tag)),
        }
    }
}

/// Keep only records of one entity.
///
/// Records without the field are kept: they are not scoped to any entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFilter {
    pub field: String,
    pub value: FieldValue,
}

impl EntityFilter {
    pub fn new(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn accepts(&self, record: &EventRecord) -> bool {
        match record.get(&self.field) {
            None => true,
            Some(v) => *v == self.value || v.to_string() == self.value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub peer: Option<PeerFilter>,
    pub entity: Option<EntityFilter>,
}

// ── Stats ─────────────────────────────────────────────────────────────────────

/// A source that could not be read to the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadFailure {
    pub path: String,
    pub message: String,
}

impl ReadFailure {
    fn from_error(err: &AnalysisError) -> Self {
        match err {
            AnalysisError::FileRead { path, source } => Self {
                path: path.display().to_string(),
                message: source.to_string(),
            },
            other => Self {
                path: String::new(),
                message: other.to_string(),
            },
        }
    }
}

/// Counters collected during one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct ExtractionStats {
    pub lines_read: u64,
    pub records: u64,
    /// Records dropped by the entity filter.
    pub filtered: u64,
    pub parse_errors: Vec<PatternParseError>,
    pub read_failures: Vec<ReadFailure>,
}

// ── Extraction iterator ───────────────────────────────────────────────────────

/// Lazy, single-pass record iterator returned by [`EventExtractor::extract`].
pub struct Extraction<'a, I> {
    registry: &'a PatternRegistry,
    options: &'a ExtractOptions,
    lines: I,
    stats: ExtractionStats,
}

impl<I> Extraction<'_, I> {
    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    /// Consume the iterator's bookkeeping. Call after draining it.
    pub fn into_stats(self) -> ExtractionStats {
        self.stats
    }

    fn record_line(&mut self, line: SourceLine) -> Option<EventRecord> {
        self.stats.lines_read += 1;
        if self.stats.lines_read % PROGRESS_INTERVAL == 0 {
            debug!(
                "Processed {}M lines ({} records)",
                self.stats.lines_read / PROGRESS_INTERVAL,
                self.stats.records
            );
        }

        if let Some(peer) = &self.options.peer {
            if !peer.accepts(&line.text) {
                return None;
            }
        }

        match self.registry.match_line(&line.text) {
            LineMatch::None => None,
            LineMatch::ParseError { rule, message } => {
                debug!("Parse error at {} [{}]: {}", line.location, rule.name, message);
                self.stats.parse_errors.push(PatternParseError {
                    location: line.location,
                    rule: rule.name.clone(),
                    message,
                });
                None
            }
            LineMatch::Record { rule, fields } => {
                let record = EventRecord {
                    timestamp: TimestampProcessor::find(&line.text),
                    location: line.location,
                    kind: rule.kind.clone(),
                    fields,
                };
                if let Some(entity) = &self.options.entity {
                    if !entity.accepts(&record) {
                        self.stats.filtered += 1;
                        return None;
                    }
                }
                self.stats.records += 1;
                Some(record)
            }
        }
    }
}

impl<I> Iterator for Extraction<'_, I>
where
    I: Iterator<Item = Result<SourceLine>>,
{
    type Item = EventRecord;

    fn next(&mut self) -> Option<EventRecord> {
        loop {
            match self.lines.next()? {
                Ok(line) => {
                    if let Some(record) = self.record_line(line) {
                        return Some(record);
                    }
                }
                Err(e) => {
                    warn!("{}", e);
                    self.stats.read_failures.push(ReadFailure::from_error(&e));
                }
            }
        }
    }
}

// ── EventExtractor ────────────────────────────────────────────────────────────

/// Everything extracted from a set of files.
#[derive(Debug, Clone, Default)]
pub struct ExtractedLog {
    pub records: Vec<EventRecord>,
    pub stats: ExtractionStats,
    pub sources: Vec<PathBuf>,
}

impl ExtractedLog {
    /// Records produced by rules of `kind`, in line order.
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a EventRecord> + 'a {
        self.records.iter().filter(move |r| r.is(kind))
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.records.iter().filter(|r| r.is(kind)).count()
    }
}

/// Applies a [`PatternRegistry`] to line streams.
#[derive(Debug, Clone)]
pub struct EventExtractor {
    registry: PatternRegistry,
    options: ExtractOptions,
}

impl EventExtractor {
    pub fn new(registry: PatternRegistry) -> Self {
        Self {
            registry,
            options: ExtractOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Wrap `lines` in a lazy record iterator.
    pub fn extract<I>(&self, lines: I) -> Extraction<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Result<SourceLine>>,
    {
        Extraction {
            registry: &self.registry,
            options: &self.options,
            lines: lines.into_iter(),
            stats: ExtractionStats::default(),
        }
    }

    /// Stream every file in order and collect the records.
    ///
    /// A file that cannot be opened or fails mid-read is listed in
    /// `read_failures`; the remaining files are still processed.
    pub fn extract_files(&self, paths: &[PathBuf]) -> ExtractedLog {
        let lines = paths.iter().flat_map(|path| -> Box<dyn Iterator<Item = Result<SourceLine>>> {
            debug!("Reading {}", path.display());
            match LineSource::open(path) {
                Ok(source) => Box::new(source),
                Err(e) => Box::new(std::iter::once(Err(e))),
            }
        });

        let mut extraction = self.extract(lines);
        let records: Vec<EventRecord> = extraction.by_ref().collect();
        let stats = extraction.into_stats();

        debug!(
            "Extracted {} records from {} lines in {} files ({} parse errors)",
            records.len(),
            stats.lines_read,
            paths.len(),
            stats.parse_errors.len()
        );

        ExtractedLog {
            records,
            stats,
            sources: paths.to_vec(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
