//! Quantization-aware anchoring: how often VALUE anchors are needed, whether
//! they are quantization-aware or time-based fallbacks, and how large the
//! per-component quantization errors are.

use logscope_core::formatting::{format_count, format_number};
use logscope_core::models::{EventRecord, FieldValue, JoinKey, Verdict};
use logscope_core::stats::{Denominator, Percentage};
use logscope_core::Result;
use logscope_report::{bucket_table, BucketColumns, Section, Table};

use super::{AnalysisRequest, Findings};
use crate::aggregator::{aggregate, count_by};
use crate::extractor::ExtractedLog;
use crate::registry::{FieldSpec, PatternRegistry, PatternRule, PayloadFormat};

pub const ENTITY_FIELD: &str = "GONetId";

const QUANT_CHECK: &str = "quant-check";
const ANCHOR_QUANTIZATION: &str = "anchor-quantization";
const ANCHOR_FALLBACK: &str = "anchor-fallback";
const VELOCITY_BUNDLE: &str = "velocity-bundle";

/// Velocity share of all bundles above which slow motion is handled well.
const VELOCITY_TARGET: f64 = 0.9;

/// Vector components in log order, with the error field each one reports.
const COMPONENTS: [(&str, &str); 4] = [("x", "errorX"), ("y", "errorY"), ("z", "errorZ"), ("w", "errorW")];

pub fn registry() -> Result<PatternRegistry> {
    Ok(PatternRegistry::new()
        .with(
            PatternRule::payload(QUANT_CHECK, "[QUANT-CHECK]", PayloadFormat::KeyValue)
                .fields([FieldSpec::int(ENTITY_FIELD), FieldSpec::int("idx"), FieldSpec::string("type")]),
        )
        .with(
            PatternRule::regex(
                ANCHOR_QUANTIZATION,
                r"\[ANCHOR-QUANTIZATION\] GONetId:(?P<GONetId>\d+) idx:(?P<idx>\d+) type:(?P<type>\w+)",
            )?
            .fields([FieldSpec::int(ENTITY_FIELD), FieldSpec::int("idx")]),
        )
        .with(
            PatternRule::regex(
                ANCHOR_FALLBACK,
                r"\[ANCHOR-FALLBACK\] GONetId:(?P<GONetId>\d+) idx:(?P<idx>\d+) type:(?P<type>\w+) timeSinceAnchor:(?P<timeSinceAnchor>[\d.]+)s",
            )?
            .fields([
                FieldSpec::int(ENTITY_FIELD),
                FieldSpec::int("idx"),
                FieldSpec::float("timeSinceAnchor"),
            ]),
        )
        .with(
            PatternRule::regex(VELOCITY_BUNDLE, r"\[SERVER-SEND-VEL\] GONetId:(?P<GONetId>\d+)")?
                .fields([FieldSpec::int(ENTITY_FIELD)]),
        ))
}

// ── Field helpers ─────────────────────────────────────────────────────────────

/// A duration field such as `timeSinceAnchor:0.5s`, in seconds.
fn seconds_field(record: &EventRecord, name: &str) -> Option<f64> {
    match record.get(name)? {
        FieldValue::Str(s) => s.strip_suffix('s').unwrap_or(s).parse().ok(),
        other => other.as_f64(),
    }
}

fn value_type(record: &EventRecord) -> String {
    record
        .get("type")
        .map(ToString::to_string)
        .unwrap_or_else(|| "(unknown)".to_string())
}

/// Whether every component of a check is clear of the quantization
/// boundary. Float checks report this as `nearBoundary`.
fn passes_all_components(check: &EventRecord) -> bool {
    let flag = if value_type(check) == "float" { "nearBoundary" } else { "allPass" };
    check.flag(flag) == Some(true)
}

/// Whether a check passes when only moving components are compared against
/// the threshold. `None` when the check reports no motion data.
fn moving_components_pass(check: &EventRecord) -> Option<bool> {
    let threshold = check.float("threshold")?;
    let mut any_moving = false;
    let mut seen = false;
    for (axis, error_field) in COMPONENTS {
        let Some(moving) = check.flag(&format!("moving.{}", axis)) else {
            continue;
        };
        seen = true;
        if !moving {
            continue;
        }
        any_moving = true;
        if check.float(error_field).map_or(true, |e| e >= threshold) {
            return Some(false);
        }
    }
    seen.then_some(any_moving)
}

struct Range {
    min: f64,
    max: f64,
    mean: f64,
}

fn range(values: &[f64]) -> Option<Range> {
    if values.is_empty() {
        return None;
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(Range { min, max, mean })
}

fn share(part: usize, base: usize) -> String {
    format!(
        "{} ({})",
        format_count(part as u64),
        Percentage::new(part as u64, base as u64, Denominator::Total)
    )
}

// ── Analysis ──────────────────────────────────────────────────────────────────

pub fn analyze(log: &ExtractedLog, request: &AnalysisRequest) -> Findings {
    let checks: Vec<&EventRecord> = log.of_kind(QUANT_CHECK).collect();
    let quant_anchors = log.count_kind(ANCHOR_QUANTIZATION);
    let fallbacks: Vec<&EventRecord> = log.of_kind(ANCHOR_FALLBACK).collect();
    let velocity = log.count_kind(VELOCITY_BUNDLE);
    let anchors = quant_anchors + fallbacks.len();

    if checks.is_empty() && anchors == 0 && velocity == 0 {
        let mut findings = Findings::new(Verdict::Skip, "No anchoring events found");
        findings.push(Section::new("Overall Statistics").paragraph(
            "No [QUANT-CHECK], anchor or [SERVER-SEND-VEL] entries found in the logs.",
        ));
        return findings;
    }

    let bundles = velocity + anchors;
    let velocity_ratio = velocity as f64 / bundles.max(1) as f64;

    let mut problems = Vec::new();
    if velocity_ratio <= VELOCITY_TARGET {
        problems.push(format!(
            "VELOCITY bundle ratio {}% is not above {}%",
            format_number(velocity_ratio * 100.0, 1),
            format_number(VELOCITY_TARGET * 100.0, 0)
        ));
    }
    if quant_anchors == 0 {
        problems.push("no quantization-aware anchors".to_string());
    }
    let mut findings = if problems.is_empty() {
        Findings::new(
            Verdict::Pass,
            format!(
                "VELOCITY ratio {}% with {} quantization-aware anchors",
                format_number(velocity_ratio * 100.0, 1),
                format_count(quant_anchors as u64)
            ),
        )
    } else {
        Findings::new(Verdict::Warn, problems.join("; "))
    };

    let mut overall = Section::new("Overall Statistics");
    if let Some(id) = request.entity_id {
        overall = overall.fact("GONetId", id.to_string());
    }
    findings.push(
        overall
            .fact("Quantization checks", format_count(checks.len() as u64))
            .fact("Quantization-aware anchors", share(quant_anchors, anchors))
            .fact("Time-based fallback anchors", share(fallbacks.len(), anchors))
            .fact("Total VALUE anchors", format_count(anchors as u64)),
    );

    let mut section = Section::new("VELOCITY vs VALUE Bundles");
    section = if bundles > 0 {
        section
            .fact("VELOCITY bundles", share(velocity, bundles))
            .fact("VALUE bundles", share(anchors, bundles))
            .fact("Total bundles", format_count(bundles as u64))
    } else {
        section.paragraph("No bundle data found.")
    };
    findings.push(section);

    if !checks.is_empty() {
        findings.push(error_section(&checks));
    }

    // ── Timing ────────────────────────────────────────────────────────────────
    let mut section = Section::new("Anchor Timing");
    let since: Vec<f64> = checks.iter().filter_map(|c| seconds_field(c, "timeSinceAnchor")).collect();
    if let Some(r) = range(&since) {
        section = section
            .fact("Min time since last anchor", format!("{:.3}s", r.min))
            .fact("Max time since last anchor", format!("{:.3}s", r.max))
            .fact("Mean time since anchor", format!("{:.3}s", r.mean));
    }
    let triggers: Vec<f64> = fallbacks.iter().filter_map(|a| a.float("timeSinceAnchor")).collect();
    if let Some(r) = range(&triggers) {
        section = section.paragraph("Fallback anchor trigger times:").list([
            format!("Min: {:.3}s", r.min),
            format!("Max: {:.3}s", r.max),
            format!("Mean: {:.3}s", r.mean),
        ]);
    }
    if !section.blocks.is_empty() {
        findings.push(section);
    }

    if !checks.is_empty() {
        let by_type = count_by(checks.iter(), |c| JoinKey::single(value_type(c)));
        findings.push(
            Section::new("Value Type Breakdown").table(bucket_table(&by_type, &BucketColumns::new(["Type"]))),
        );
    }

    findings
}

fn error_section(checks: &[&EventRecord]) -> Section {
    let mut section = Section::new("Quantization Error Distribution");

    let thresholds: Vec<f64> = checks.iter().filter_map(|c| c.float("threshold")).collect();
    if let Some(r) = range(&thresholds) {
        section = section.fact("Mean threshold", format!("{:.6}", r.mean));
    }
    let all_pass = checks.iter().filter(|c| passes_all_components(c)).count();
    section = section.fact("Checks with allPass=True", share(all_pass, checks.len()));

    // One sample per (type, component) error reported by a check.
    let mut samples: Vec<(String, &str, f64)> = Vec::new();
    for check in checks {
        let ty = value_type(check);
        for (axis, field) in COMPONENTS.iter().copied().chain([("value", "error")]) {
            if let Some(e) = check.float(field) {
                samples.push((ty.clone(), axis, e));
            }
        }
    }
    let errors = aggregate(
        samples.iter(),
        |(ty, axis, _)| JoinKey::new(vec![FieldValue::from(ty.as_str()), FieldValue::from(*axis)]),
        |(_, _, e)| Some(*e),
    );
    if !errors.is_empty() {
        section = section.table(bucket_table(
            &errors,
            &BucketColumns::new(["Type", "Component"]).metric("error").decimals(6),
        ));
    }

    let mut motion = Table::new(["Type", "Component", "Moving", "% of checks"]).align_right(&[2, 3]);
    let mut types: Vec<String> = checks.iter().map(|c| value_type(c)).collect();
    types.sort();
    types.dedup();
    for ty in &types {
        let of_type: Vec<&&EventRecord> = checks.iter().filter(|c| value_type(c) == *ty).collect();
        for (axis, _) in COMPONENTS {
            let name = format!("moving.{}", axis);
            if of_type.iter().all(|c| c.flag(&name).is_none()) {
                continue;
            }
            let moving = of_type.iter().filter(|c| c.flag(&name) == Some(true)).count();
            let pct = Percentage::new(moving as u64, of_type.len() as u64, Denominator::Total);
            motion.push_row([
                ty.clone(),
                axis.to_string(),
                format_count(moving as u64),
                format!("{}%", format_number(pct.value(), 1)),
            ]);
        }
    }
    if !motion.is_empty() {
        section = section.paragraph("Motion detection:").table(motion);
    }

    let simulated: Vec<bool> = checks.iter().filter_map(|c| moving_components_pass(c)).collect();
    if !simulated.is_empty() {
        let would_pass = simulated.iter().filter(|p| **p).count();
        let gain = would_pass as i64 - all_pass as i64;
        section = section
            .fact(
                "Would anchor with moving-component logic",
                share(would_pass, simulated.len()),
            )
            .fact(
                "Improvement over all-component logic",
                format!(
                    "{:+} checks ({}% of {} simulated)",
                    gain,
                    format_number(gain as f64 * 100.0 / simulated.len() as f64, 1),
                    format_count(simulated.len() as u64)
                ),
            );
    }
    section
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{extract_text, AnalysisKind};
    use logscope_report::Block;

    const CHECK_A: &str = "[VelocitySync][QUANT-CHECK] GONetId:5 idx:0 type:Vector3 errorX:0.001 errorY:0.004 errorZ:0.003 threshold:0.002 delta:(0.1, 0.0, 0.2) motionEps:0.0001 moving:(x:True y:False z:False) checks:(x:True y:False z:False) allPass:False timeSinceAnchor:0.5s maxTime:1.0s";
    const CHECK_B: &str = "[VelocitySync][QUANT-CHECK] GONetId:5 idx:0 type:Vector3 errorX:0.003 errorY:0.001 errorZ:0.001 threshold:0.002 delta:(0.1, 0.0, 0.2) motionEps:0.0001 moving:(x:True y:True z:False) checks:(x:False y:True z:True) allPass:True timeSinceAnchor:1.5s maxTime:1.0s";
    const CHECK_F: &str = "[VelocitySync][QUANT-CHECK] GONetId:9 idx:1 type:float error:0.0005 threshold:0.001 nearBoundary:True timeSinceAnchor:1.0s maxTime:2.0s";

    fn run_with(text: &str, request: &AnalysisRequest) -> Findings {
        analyze(&extract_text(registry().unwrap(), text), request)
    }

    fn run(text: &str) -> Findings {
        run_with(text, &AnalysisRequest::new(AnalysisKind::Anchoring, Vec::new()))
    }

    fn fact(findings: &Findings, heading: &str, label: &str) -> Option<String> {
        findings
            .sections
            .iter()
            .find(|s| s.heading == heading)?
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::Facts { items } => Some(items),
                _ => None,
            })
            .flatten()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.clone())
    }

    fn velocity(n: usize, id: i64) -> String {
        (0..n).map(|_| format!("[SERVER-SEND-VEL] GONetId:{} bundle\n", id)).collect()
    }

    #[test]
    fn test_rules_decode_each_line_kind() {
        let text = format!(
            "{}\n{}\n[VelocitySync][ANCHOR-QUANTIZATION] GONetId:5 idx:0 type:Vector3 moving:(x:True)\n\
             [VelocitySync][ANCHOR-FALLBACK] GONetId:5 idx:0 type:Vector3 timeSinceAnchor:1.02s\n{}",
            CHECK_A,
            CHECK_F,
            velocity(1, 5)
        );
        let log = extract_text(registry().unwrap(), &text);
        let kinds: Vec<&str> = log.records.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![QUANT_CHECK, QUANT_CHECK, ANCHOR_QUANTIZATION, ANCHOR_FALLBACK, VELOCITY_BUNDLE]
        );
        let check = &log.records[0];
        assert_eq!(check.int(ENTITY_FIELD), Some(5));
        assert_eq!(check.flag("moving.x"), Some(true));
        assert_eq!(check.flag("allPass"), Some(false));
        assert_eq!(seconds_field(check, "timeSinceAnchor"), Some(0.5));
        assert_eq!(log.records[3].float("timeSinceAnchor"), Some(1.02));
    }

    #[test]
    fn test_high_velocity_ratio_with_quant_anchors_passes() {
        let text = format!(
            "{}\n{}[ANCHOR-QUANTIZATION] GONetId:5 idx:0 type:Vector3\n",
            CHECK_A,
            velocity(19, 5)
        );
        let findings = run(&text);
        assert_eq!(findings.verdict, Verdict::Pass);
        assert_eq!(
            fact(&findings, "VELOCITY vs VALUE Bundles", "VELOCITY bundles").unwrap(),
            "19 (95.0% of 20 total)"
        );
    }

    #[test]
    fn test_low_velocity_ratio_warns() {
        let text = format!(
            "{}[ANCHOR-QUANTIZATION] GONetId:5 idx:0 type:Vector3\n\
             [ANCHOR-FALLBACK] GONetId:5 idx:0 type:Vector3 timeSinceAnchor:1.0s\n",
            velocity(2, 5)
        );
        let findings = run(&text);
        assert_eq!(findings.verdict, Verdict::Warn);
        assert!(findings.message.contains("VELOCITY bundle ratio 50.0%"));
        assert_eq!(
            fact(&findings, "Overall Statistics", "Time-based fallback anchors").unwrap(),
            "1 (50.0% of 2 total)"
        );
    }

    #[test]
    fn test_no_quantization_anchors_warns() {
        let findings = run(&velocity(10, 5));
        assert_eq!(findings.verdict, Verdict::Warn);
        assert_eq!(findings.message, "no quantization-aware anchors");
    }

    #[test]
    fn test_error_statistics_and_all_pass_rate() {
        let text = format!("{}\n{}\n{}\n", CHECK_A, CHECK_B, CHECK_F);
        let findings = run(&text);
        assert_eq!(
            fact(&findings, "Quantization Error Distribution", "Checks with allPass=True").unwrap(),
            "2 (66.7% of 3 total)"
        );
        // A: x moving, 0.001 < 0.002 passes. B: y moving fine, x 0.003 fails.
        assert_eq!(
            fact(
                &findings,
                "Quantization Error Distribution",
                "Would anchor with moving-component logic"
            )
            .unwrap(),
            "1 (50.0% of 2 total)"
        );
        assert_eq!(
            fact(
                &findings,
                "Quantization Error Distribution",
                "Improvement over all-component logic"
            )
            .unwrap(),
            "-1 checks (-50.0% of 2 simulated)"
        );

        let section = findings
            .sections
            .iter()
            .find(|s| s.heading == "Quantization Error Distribution")
            .unwrap();
        let Some(Block::Table { table }) = section.blocks.iter().find(|b| matches!(b, Block::Table { .. })) else {
            panic!("expected an error table");
        };
        let vector_x = table
            .rows
            .iter()
            .find(|r| r[0] == "Vector3" && r[1] == "x")
            .unwrap();
        // Type, Component, Total, Samples, Missing, Present, Mean, Min, Max, P90
        assert_eq!(vector_x[2], "2");
        assert_eq!(vector_x[6], "0.002000");
        assert_eq!(vector_x[7], "0.001");
        assert_eq!(vector_x[8], "0.003");
        assert!(table.rows.iter().any(|r| r[0] == "float" && r[1] == "value"));
    }

    #[test]
    fn test_float_checks_pass_on_near_boundary() {
        let clear = CHECK_F;
        let near = CHECK_F.replace("nearBoundary:True", "nearBoundary:False");
        let findings = run(&format!("{}\n{}\n", clear, near));
        assert_eq!(
            fact(&findings, "Quantization Error Distribution", "Checks with allPass=True").unwrap(),
            "1 (50.0% of 2 total)"
        );

        let log = extract_text(registry().unwrap(), clear);
        assert!(passes_all_components(&log.records[0]));
        let log = extract_text(registry().unwrap(), CHECK_B);
        assert!(passes_all_components(&log.records[0]));
    }

    #[test]
    fn test_anchor_timing_parses_second_suffix() {
        let text = format!("{}\n{}\n", CHECK_A, CHECK_B);
        let findings = run(&text);
        assert_eq!(
            fact(&findings, "Anchor Timing", "Mean time since anchor").unwrap(),
            "1.000s"
        );
    }

    #[test]
    fn test_entity_filter_scopes_counts() {
        use crate::extractor::{EntityFilter, EventExtractor, ExtractOptions};
        use crate::reader::LineSource;
        use std::io::Cursor;

        let text = format!("{}\n{}\n{}", CHECK_A, CHECK_F, velocity(3, 9));
        let extractor = EventExtractor::new(registry().unwrap()).with_options(ExtractOptions {
            peer: None,
            entity: Some(EntityFilter::new(ENTITY_FIELD, 9_i64)),
        });
        let mut extraction = extractor.extract(LineSource::from_reader("a.log", Cursor::new(text)));
        let records: Vec<EventRecord> = extraction.by_ref().collect();
        let log = ExtractedLog {
            records,
            stats: extraction.into_stats(),
            sources: Vec::new(),
        };
        let mut request = AnalysisRequest::new(AnalysisKind::Anchoring, Vec::new());
        request.entity_id = Some(9);
        let findings = analyze(&log, &request);
        assert_eq!(fact(&findings, "Overall Statistics", "Quantization checks").unwrap(), "1");
        assert_eq!(fact(&findings, "Overall Statistics", "GONetId").unwrap(), "9");
    }

    #[test]
    fn test_no_events_skips() {
        assert_eq!(run("unrelated\n").verdict, Verdict::Skip);
    }
}
