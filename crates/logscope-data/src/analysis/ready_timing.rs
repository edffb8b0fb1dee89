//! OnGONetReady timing: how many frames pass between a participant's
//! `Start()` and its `OnGONetReady` callback, per peer and per object type.

use std::sync::OnceLock;

use logscope_core::formatting::{format_count, format_number};
use logscope_core::models::{EventRecord, FieldValue, Fields, JoinKey, JoinResult, Verdict};
use logscope_core::stats::{Denominator, Percentage};
use logscope_report::{bucket_table, distribution_table, join_table, BucketColumns, JoinColumns, Section};
use regex::Regex;

use super::{AnalysisRequest, Findings};
use crate::aggregator::aggregate_joins;
use crate::correlator::{correlate, key_fields, MetricSource};
use crate::extractor::ExtractedLog;
use crate::registry::{PatternRegistry, PatternRule};

pub const ENTITY_FIELD: &str = "GONetId";

const START: &str = "start";
const READY: &str = "ready";

// ── Rules ─────────────────────────────────────────────────────────────────────

struct Matchers {
    peer: Regex,
    frame: Regex,
    id: Regex,
    object: Regex,
}

fn matchers() -> &'static Matchers {
    static MATCHERS: OnceLock<Matchers> = OnceLock::new();
    MATCHERS.get_or_init(|| Matchers {
        peer: Regex::new(r"\[(Client:\d+|Server)\]").expect("regex is valid"),
        frame: Regex::new(r"frame:(\d+)/").expect("regex is valid"),
        id: Regex::new(r"GONetId: (\d+)").expect("regex is valid"),
        object: Regex::new(r"GameObject: ([^,]+)").expect("regex is valid"),
    })
}

fn capture<'l>(re: &Regex, line: &'l str) -> Option<&'l str> {
    re.captures(line)?.get(1).map(|m| m.as_str())
}

/// Fields of a lifecycle line; the values may appear in any order.
fn lifecycle_fields(line: &str, with_object: bool) -> Option<Fields> {
    let p = matchers();
    let mut fields = Fields::new();
    fields.insert("peer".to_string(), FieldValue::from(capture(&p.peer, line)?));
    fields.insert("frame".to_string(), FieldValue::Int(capture(&p.frame, line)?.parse().ok()?));
    fields.insert(ENTITY_FIELD.to_string(), FieldValue::Int(capture(&p.id, line)?.parse().ok()?));
    if with_object {
        let object = capture(&p.object, line)?.trim();
        fields.insert("GameObject".to_string(), FieldValue::from(object));
    }
    Some(fields)
}

pub fn registry() -> PatternRegistry {
    PatternRegistry::new()
        .with(PatternRule::custom(START, |line: &str| {
            if !line.contains("Start() called") {
                return None;
            }
            lifecycle_fields(line, true)
        }))
        .with(PatternRule::custom(READY, |line: &str| {
            if !line.contains("OnGONetReady FIRED") {
                return None;
            }
            lifecycle_fields(line, false)
        }))
}

// ── Analysis ──────────────────────────────────────────────────────────────────

fn object_type(result: &JoinResult) -> String {
    result
        .left
        .as_ref()
        .and_then(|r| r.text("GameObject"))
        .map(|name| name.replace("(Clone)", "").trim().to_string())
        .unwrap_or_else(|| "(unknown)".to_string())
}

fn peer_key(result: &JoinResult) -> JoinKey {
    match result.key.parts().first() {
        Some(peer) => JoinKey::new(vec![peer.clone()]),
        None => JoinKey::single("(unknown)"),
    }
}

fn never_fired_line(record: &EventRecord) -> String {
    format!(
        "[{}] GONetId: {}, GameObject: {}, StartFrame: {}",
        record.text("peer").unwrap_or("?"),
        record.int(ENTITY_FIELD).map(|v| v.to_string()).unwrap_or_default(),
        record.text("GameObject").unwrap_or("?"),
        record.int("frame").map(|v| v.to_string()).unwrap_or_default(),
    )
}

pub fn analyze(log: &ExtractedLog, request: &AnalysisRequest) -> Findings {
    let starts = log.count_kind(START);
    let readies = log.count_kind(READY);
    if starts == 0 {
        let mut findings = Findings::new(Verdict::Skip, "No Start() events found");
        findings.push(
            Section::new("Summary")
                .fact("Start() events", "0")
                .fact("OnGONetReady FIRED events", format_count(readies as u64)),
        );
        return findings;
    }

    let results = correlate(
        log.of_kind(START),
        log.of_kind(READY),
        key_fields(&["peer", ENTITY_FIELD]),
        Some(&MetricSource::field("frame")),
    );
    let fired = results.iter().filter(|r| r.is_matched()).count() as u64;
    let never = results.len() as u64 - fired;
    let total = results.len() as u64;

    let by_peer = aggregate_joins(&results, peer_key);
    let by_object = aggregate_joins(&results, |r| JoinKey::single(object_type(r)));

    let mut summary = Section::new("Summary")
        .fact("Start() events", format_count(starts as u64))
        .fact("OnGONetReady FIRED events", format_count(readies as u64))
        .fact(
            "Fired",
            format!("{} ({})", format_count(fired), Percentage::new(fired, total, Denominator::Total)),
        )
        .fact("Never fired", format_count(never));
    summary = summary.table(bucket_table(
        &by_peer,
        &BucketColumns::new(["Peer"]).metric("delay (frames)"),
    ));

    let mut findings = if never > 0 {
        Findings::new(
            Verdict::Fail,
            format!("{} participant(s) never fired OnGONetReady", format_count(never)),
        )
    } else {
        Findings::new(
            Verdict::Pass,
            format!("All {} participants fired OnGONetReady", format_count(total)),
        )
    };
    findings.push(summary);

    for bucket in by_peer.iter().filter(|b| b.sample_count() > 0) {
        let mut section = Section::new(format!("Frame Delay Distribution: {}", bucket.key));
        if let Some(mean) = bucket.mean() {
            section = section.fact("Average delay", format!("{} frames", format_number(mean, 2)));
        }
        findings.push(section.table(distribution_table(bucket, "Delay (frames)")));
    }

    let never_fired = results
        .iter()
        .filter(|r| !r.is_matched())
        .filter_map(|r| r.left.as_ref())
        .map(never_fired_line);
    let mut section = Section::new("Never Fired");
    section = if never > 0 {
        section
            .paragraph(format!(
                "Found {} participants that NEVER fired OnGONetReady:",
                format_count(never)
            ))
            .list(never_fired)
    } else {
        section.paragraph("All participants successfully fired OnGONetReady.")
    };
    findings.push(section);

    findings.push(
        Section::new("Breakdown by GameObject Type").table(bucket_table(
            &by_object,
            &BucketColumns::new(["GameObject"]).metric("delay (frames)"),
        )),
    );

    let columns = JoinColumns::new(["Peer", ENTITY_FIELD])
        .left("GameObject", "GameObject")
        .left("Start frame", "frame")
        .right("Ready frame", "frame")
        .metric("Delay")
        .limit(request.sample_limit);
    findings.push(
        Section::new("Detailed Results Sample")
            .paragraph(format!("First {} entries:", request.sample_limit.min(results.len())))
            .table(join_table(&results, &columns)),
    );

    findings
}

// ── Tests ──────────────────────────────────────────────────────────────────────
