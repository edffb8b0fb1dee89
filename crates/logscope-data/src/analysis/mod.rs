//! Analysis pipeline.
//!
//! Resolves the input sources, builds the preset's pattern registry, extracts
//! records, hands them to the preset and wraps its findings in a [`Report`]
//! with run metadata and diagnostics sections.

pub mod anchoring;
pub mod custom;
pub mod physics_time;
pub mod ready_timing;
pub mod rpc_results;
pub mod rpc_validation;
pub mod spawn_propagation;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use logscope_core::formatting::format_count;
use logscope_core::models::Verdict;
use logscope_core::{AnalysisError, Result};
use logscope_report::{Report, Section};
use tracing::{debug, info};

use crate::extractor::{EntityFilter, EventExtractor, ExtractOptions, ExtractedLog, PeerFilter};
use crate::reader::resolve_sources;
use crate::registry::PatternRegistry;

/// Parse error samples shown in the report.
pub const PARSE_ERROR_SAMPLES: usize = 10;

// ── Public types ──────────────────────────────────────────────────────────────

/// Which analysis to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    ReadyTiming,
    RpcResults,
    RpcValidation,
    PhysicsTime,
    Anchoring,
    SpawnPropagation,
    Custom,
}

impl AnalysisKind {
    pub fn name(self) -> &'static str {
        match self {
            AnalysisKind::ReadyTiming => "ready-timing",
            AnalysisKind::RpcResults => "rpc-results",
            AnalysisKind::RpcValidation => "rpc-validation",
            AnalysisKind::PhysicsTime => "physics-time",
            AnalysisKind::Anchoring => "anchoring",
            AnalysisKind::SpawnPropagation => "spawn-propagation",
            AnalysisKind::Custom => "custom",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AnalysisKind {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready-timing" => Ok(AnalysisKind::ReadyTiming),
            "rpc-results" => Ok(AnalysisKind::RpcResults),
            "rpc-validation" => Ok(AnalysisKind::RpcValidation),
            "physics-time" => Ok(AnalysisKind::PhysicsTime),
            "anchoring" => Ok(AnalysisKind::Anchoring),
            "spawn-propagation" => Ok(AnalysisKind::SpawnPropagation),
            "custom" => Ok(AnalysisKind::Custom),
            other => Err(AnalysisError::Config(format!("unknown analysis: {}", other))),
        }
    }
}

/// Everything needed to run one analysis.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub kind: AnalysisKind,
    pub paths: Vec<PathBuf>,
    /// Peer mode (`server`, `client` or an exact tag).
    pub peer: Option<String>,
    pub entity_id: Option<i64>,
    /// Rule file for [`AnalysisKind::Custom`].
    pub rules: Option<PathBuf>,
    pub sample_limit: usize,
}

impl AnalysisRequest {
    pub fn new(kind: AnalysisKind, paths: Vec<PathBuf>) -> Self {
        Self {
            kind,
            paths,
            peer: None,
            entity_id: None,
            rules: None,
            sample_limit: 20,
        }
    }
}

/// What a preset concluded from the extracted records.
#[derive(Debug, Clone)]
pub struct Findings {
    pub sections: Vec<Section>,
    pub verdict: Verdict,
    /// One-line explanation of the verdict.
    pub message: String,
}

impl Findings {
    pub fn new(verdict: Verdict, message: impl Into<String>) -> Self {
        Self {
            sections: Vec::new(),
            verdict,
            message: message.into(),
        }
    }

    pub fn push(&mut self, section: Section) {
        self.sections.push(section);
    }
}

/// The complete output of [`run_analysis`].
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub report: Report,
    pub verdict: Verdict,
    /// Parse errors plus read failures.
    pub failures: usize,
}

/// A configured analysis: its rules, entity field and report logic.
pub(crate) struct Preset {
    title: String,
    registry: PatternRegistry,
    entity_field: Option<String>,
    analyze: Box<dyn Fn(&ExtractedLog, &AnalysisRequest) -> Findings>,
}

impl Preset {
    fn builtin(kind: AnalysisKind) -> Result<Self> {
        let preset = match kind {
            AnalysisKind::ReadyTiming => Preset {
                title: "OnGONetReady Timing Analysis".to_string(),
                registry: ready_timing::registry(),
                entity_field: Some(ready_timing::ENTITY_FIELD.to_string()),
                analyze: Box::new(ready_timing::analyze),
            },
            AnalysisKind::RpcResults => Preset {
                title: "RPC Test Results".to_string(),
                registry: rpc_results::registry(),
                entity_field: None,
                analyze: Box::new(rpc_results::analyze),
            },
            AnalysisKind::RpcValidation => Preset {
                title: "Comprehensive RPC Validation".to_string(),
                registry: rpc_validation::registry()?,
                entity_field: None,
                analyze: Box::new(rpc_validation::analyze),
            },
            AnalysisKind::PhysicsTime => Preset {
                title: "Physics Time Analysis".to_string(),
                registry: physics_time::registry()?,
                entity_field: None,
                analyze: Box::new(physics_time::analyze),
            },
            AnalysisKind::Anchoring => Preset {
                title: "Quantization-Aware Anchoring Analysis".to_string(),
                registry: anchoring::registry()?,
                entity_field: Some(anchoring::ENTITY_FIELD.to_string()),
                analyze: Box::new(anchoring::analyze),
            },
            AnalysisKind::SpawnPropagation => Preset {
                title: "Spawn Propagation Analysis".to_string(),
                registry: spawn_propagation::registry(),
                entity_field: Some(spawn_propagation::ENTITY_FIELD.to_string()),
                analyze: Box::new(spawn_propagation::analyze),
            },
            AnalysisKind::Custom => {
                return Err(AnalysisError::Config(
                    "the custom analysis is built from a rule file".to_string(),
                ))
            }
        };
        Ok(preset)
    }
}

// ── Public function ───────────────────────────────────────────────────────────

/// Run the full analysis pipeline.
///
/// 1. Resolve sources; a missing path aborts with `SourceNotFound`.
/// 2. Build the pattern registry (rule file errors abort here too).
/// 3. Extract records from every source.
/// 4. Let the preset analyse them.
/// 5. Add diagnostics; any parse error turns the verdict into `Fail`.
pub fn run_analysis(request: &AnalysisRequest) -> Result<AnalysisOutcome> {
    // ── Step 1: Sources ───────────────────────────────────────────────────────
    let sources = resolve_sources(&request.paths)?;
    info!("Analysing {} source file(s) with {}", sources.len(), request.kind);

    // ── Step 2: Rules ─────────────────────────────────────────────────────────
    let preset = match request.kind {
        AnalysisKind::Custom => {
            let path = request.rules.as_ref().ok_or_else(|| {
                AnalysisError::Config("the custom analysis requires --rules <file>".to_string())
            })?;
            custom::preset(path)?
        }
        kind => Preset::builtin(kind)?,
    };
    debug!("Registry has {} rules", preset.registry.len());

    // ── Step 3: Extract ───────────────────────────────────────────────────────
    let options = extract_options(request, preset.entity_field.as_deref());
    let extractor = EventExtractor::new(preset.registry.clone()).with_options(options);
    let log = extractor.extract_files(&sources);

    // ── Step 4: Analyse ───────────────────────────────────────────────────────
    let findings = (preset.analyze)(&log, request);

    // ── Step 5: Report ────────────────────────────────────────────────────────
    Ok(assemble(&preset.title, request, &log, findings))
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn extract_options(request: &AnalysisRequest, entity_field: Option<&str>) -> ExtractOptions {
    let entity = match (request.entity_id, entity_field) {
        (Some(id), Some(field)) => Some(EntityFilter::new(field, id)),
        (Some(_), None) => {
            info!("--entity-id has no effect on the {} analysis", request.kind);
            None
        }
        _ => None,
    };
    ExtractOptions {
        peer: request.peer.as_deref().map(PeerFilter::parse),
        entity,
    }
}

fn assemble(title: &str, request: &AnalysisRequest, log: &ExtractedLog, findings: Findings) -> AnalysisOutcome {
    let stats = &log.stats;
    let mut report = Report::new(title);

    let sources: Vec<String> = log.sources.iter().map(|p| p.display().to_string()).collect();
    report.header_fact("Analysis", request.kind.name());
    report.header_fact(
        "Sources",
        if sources.is_empty() {
            "(none)".to_string()
        } else {
            sources.join(", ")
        },
    );
    if let Some(peer) = &request.peer {
        report.header_fact("Peer filter", peer.clone());
    }
    if let Some(id) = request.entity_id {
        report.header_fact("Entity filter", id.to_string());
    }
    report.header_fact("Lines read", format_count(stats.lines_read));
    report.header_fact("Records", format_count(stats.records));

    for section in findings.sections {
        report.push(section);
    }

    let mut verdict = findings.verdict;
    let mut message = findings.message;

    if !stats.parse_errors.is_empty() {
        report.push(parse_error_section(log));
        verdict = verdict.worst(Verdict::Fail);
        message = format!("{} ({} parse errors)", message, stats.parse_errors.len());
    }

    if !stats.read_failures.is_empty() {
        let items = stats
            .read_failures
            .iter()
            .map(|f| format!("{}: {}", f.path, f.message));
        report.push(
            Section::new("Read Failures")
                .paragraph(format!(
                    "{} source(s) could not be read to the end.",
                    stats.read_failures.len()
                ))
                .list(items),
        );
        verdict = verdict.worst(Verdict::Warn);
    }

    report.verdict = verdict;
    report.push(Section::new("Verdict").status(verdict, message));

    AnalysisOutcome {
        report,
        verdict,
        failures: stats.parse_errors.len() + stats.read_failures.len(),
    }
}

fn parse_error_section(log: &ExtractedLog) -> Section {
    let errors = &log.stats.parse_errors;
    let mut section = Section::new("Parse Errors")
        .fact("Parse errors", format_count(errors.len() as u64))
        .list(errors.iter().take(PARSE_ERROR_SAMPLES).map(|e| e.to_string()));
    if errors.len() > PARSE_ERROR_SAMPLES {
        section = section.paragraph(format!(
            "... and {} more errors",
            errors.len() - PARSE_ERROR_SAMPLES
        ));
    }
    section
}

/// Run `registry` over in-memory text the way `extract_files` runs it over
/// files.
#[cfg(test)]
pub(crate) fn extract_text(registry: PatternRegistry, text: &str) -> ExtractedLog {
    use crate::reader::LineSource;
    use std::io::Cursor;

    let extractor = EventExtractor::new(registry);
    let mut extraction = extractor.extract(LineSource::from_reader("test.log", Cursor::new(text.to_string())));
    let records = extraction.by_ref().collect();
    ExtractedLog {
        records,
        stats: extraction.into_stats(),
        sources: Vec::new(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
