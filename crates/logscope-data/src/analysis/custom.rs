//! Analyses described by a JSON rule file.
//!
//! ```json
//! {
//!   "title": "Spawn latency",
//!   "rules": [
//!     { "name": "spawn", "match": "regex", "pattern": "Spawned id:(?P<id>\\d+) tick:(?P<tick>\\d+)",
//!       "fields": [{ "name": "id", "type": "int" }, { "name": "tick", "type": "int" }] },
//!     { "name": "seen", "match": "regex", "pattern": "Seen id:(?P<id>\\d+) tick:(?P<tick>\\d+)",
//!       "fields": [{ "name": "id", "type": "int" }, { "name": "tick", "type": "int" }] }
//!   ],
//!   "join": { "left": "spawn", "right": "seen", "key": ["id"], "metric": { "field": { "left": "tick", "right": "tick" } } },
//!   "group_by": []
//! }
//! ```
//!
//! Without a `join` the records are counted per kind, and per `group_by`
//! fields when given.

use std::fs;
use std::path::Path;

use logscope_core::formatting::format_count;
use logscope_core::models::{EventRecord, JoinKey, JoinResult, Verdict};
use logscope_core::stats::{Denominator, Percentage};
use logscope_core::{AnalysisError, Result};
use logscope_report::{bucket_table, distribution_table, join_table, BucketColumns, JoinColumns, Section};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AnalysisRequest, Findings, Preset};
use crate::aggregator::{aggregate_joins, count_by};
use crate::correlator::{correlate, key_fields, MetricSource};
use crate::extractor::ExtractedLog;
use crate::registry::{PatternRegistry, RuleConfig};

const DEFAULT_ENTITY_FIELD: &str = "GONetId";

// ── Rule set ──────────────────────────────────────────────────────────────────

/// Join two record kinds on shared key fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Kind of the left (driving) records.
    pub left: String,
    /// Kind of the right records.
    pub right: String,
    pub key: Vec<String>,
    #[serde(default)]
    pub metric: Option<MetricSource>,
}

/// Parsed rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub title: Option<String>,
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub join: Option<JoinConfig>,
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Field the `--entity-id` filter applies to.
    #[serde(default)]
    pub entity_field: Option<String>,
}

impl RuleSet {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| AnalysisError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let set: RuleSet = serde_json::from_str(&text)
            .map_err(|e| AnalysisError::Config(format!("invalid rule file {}: {}", path.display(), e)))?;
        set.validate()?;
        debug!("Loaded {} rules from {}", set.rules.len(), path.display());
        Ok(set)
    }

    fn validate(&self) -> Result<()> {
        if self.rules.is_empty() {
            return Err(AnalysisError::Config("rule file defines no rules".to_string()));
        }
        let Some(join) = &self.join else {
            return Ok(());
        };
        for side in [&join.left, &join.right] {
            if !self.rules.iter().any(|r| r.kind.as_ref().unwrap_or(&r.name) == side) {
                return Err(AnalysisError::Config(format!(
                    "join refers to kind '{}' that no rule produces",
                    side
                )));
            }
        }
        if join.key.is_empty() {
            return Err(AnalysisError::Config("join key must name at least one field".to_string()));
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<PatternRegistry> {
        PatternRegistry::from_configs(&self.rules)
    }
}

pub(crate) fn preset(path: &Path) -> Result<Preset> {
    let set = RuleSet::load(path)?;
    let registry = set.registry()?;
    Ok(Preset {
        title: set.title.clone().unwrap_or_else(|| "Custom Analysis".to_string()),
        registry,
        entity_field: Some(
            set.entity_field
                .clone()
                .unwrap_or_else(|| DEFAULT_ENTITY_FIELD.to_string()),
        ),
        analyze: Box::new(move |log: &ExtractedLog, request: &AnalysisRequest| analyze(&set, log, request)),
    })
}

// ── Analysis ──────────────────────────────────────────────────────────────────

pub fn analyze(set: &RuleSet, log: &ExtractedLog, request: &AnalysisRequest) -> Findings {
    if log.records.is_empty() {
        let mut findings = Findings::new(Verdict::Skip, "No records matched the rule set");
        findings.push(Section::new("Records").paragraph("No log line matched any rule."));
        return findings;
    }

    let by_kind = count_by(log.records.iter(), |r| JoinKey::single(r.kind.as_str()));
    let mut findings = Findings::new(
        Verdict::Pass,
        format!("{} records matched", format_count(log.records.len() as u64)),
    );
    findings.push(Section::new("Records by Kind").table(bucket_table(&by_kind, &BucketColumns::new(["Kind"]))));

    match &set.join {
        Some(join) => analyze_join(set, join, log, request, findings),
        None => {
            if !set.group_by.is_empty() {
                findings.push(grouped_counts(&set.group_by, log.records.iter()));
            }
            findings
        }
    }
}

fn grouped_counts<'a>(group_by: &[String], records: impl Iterator<Item = &'a EventRecord>) -> Section {
    let names: Vec<&str> = group_by.iter().map(String::as_str).collect();
    let (keyed, unkeyed): (Vec<_>, Vec<_>) = records
        .map(|r| JoinKey::from_fields(r, &names))
        .partition(Option::is_some);
    let counts = count_by(keyed.into_iter().flatten(), |k| k.clone());

    let mut section = Section::new(format!("Records by {}", group_by.join(", ")));
    if !unkeyed.is_empty() {
        section = section.fact("Records without these fields", format_count(unkeyed.len() as u64));
    }
    section.table(bucket_table(&counts, &BucketColumns::new(names)))
}

fn analyze_join(
    set: &RuleSet,
    join: &JoinConfig,
    log: &ExtractedLog,
    request: &AnalysisRequest,
    mut findings: Findings,
) -> Findings {
    let left_count = log.count_kind(&join.left);
    if left_count == 0 {
        return Findings {
            verdict: Verdict::Skip,
            message: format!("No '{}' records to join", join.left),
            ..findings
        };
    }

    let names: Vec<&str> = join.key.iter().map(String::as_str).collect();
    let results = correlate(
        log.of_kind(&join.left),
        log.of_kind(&join.right),
        key_fields(&names),
        join.metric.as_ref(),
    );
    let matched = results.iter().filter(|r| r.is_matched()).count() as u64;
    let total = results.len() as u64;
    let unmatched = total - matched;

    findings.verdict = if unmatched == 0 { Verdict::Pass } else { Verdict::Warn };
    findings.message = format!(
        "{} of {} '{}' records matched a '{}' record",
        format_count(matched),
        format_count(total),
        join.left,
        join.right
    );

    let group_names: Vec<&str> = set.group_by.iter().map(String::as_str).collect();
    let group = |r: &JoinResult| {
        r.left
            .as_ref()
            .and_then(|l| JoinKey::from_fields(l, &group_names))
            .unwrap_or_default()
    };
    let buckets = aggregate_joins(&results, group);

    let mut columns = BucketColumns::new(group_names.iter().copied());
    if join.metric.is_some() {
        columns = columns.metric("delta");
    }
    let mut summary = Section::new("Join Summary")
        .fact(format!("'{}' records", join.left), format_count(total))
        .fact(
            "Matched",
            format!("{} ({})", format_count(matched), Percentage::new(matched, total, Denominator::Total)),
        )
        .fact("Unmatched", format_count(unmatched))
        .table(bucket_table(&buckets, &columns));
    if join.metric.is_some() {
        for bucket in buckets.iter().filter(|b| b.sample_count() > 0) {
            summary = summary
                .paragraph(format!("Distribution: {}", bucket.key))
                .table(distribution_table(bucket, "Delta"));
        }
    }
    findings.push(summary);

    let mut columns = JoinColumns::new(names.iter().copied()).limit(request.sample_limit);
    if join.metric.is_some() {
        columns = columns.metric("Delta");
    }
    findings.push(
        Section::new("Joined Records Sample")
            .paragraph(format!("First {} entries:", request.sample_limit.min(results.len())))
            .table(join_table(&results, &columns)),
    );

    findings
}

// ── Tests ──────────────────────────────────────────────────────────────────────
