//! Physics clock health: `gonet.fixed` / `gonet.std` must never run
//! backwards, and fixed time must not lag behind standard time.

use std::sync::OnceLock;

use logscope_core::formatting::{format_count, format_number};
use logscope_core::models::{EventRecord, Fields, SourceLocation, Verdict};
use logscope_core::Result;
use logscope_report::{Section, Table};
use regex::Regex;

use super::{AnalysisRequest, Findings};
use crate::extractor::ExtractedLog;
use crate::registry::{FieldSpec, FieldType, PatternRegistry, PatternRule};

const CATCHUP: &str = "catchup";
const FIXED_UPDATE: &str = "fixed-update";
const UPDATE: &str = "update";

/// A backward jump larger than this (seconds) is a session reset.
const RESET_THRESHOLD: f64 = 1.0;
/// `std - fixed` beyond this (seconds) counts as ping-pong.
const PING_PONG_THRESHOLD: f64 = 0.005;
const SAMPLE_ROWS: usize = 10;
const CATCHUP_SAMPLES: usize = 5;

const TAG: &str = "[PhysicsTime]";

struct Clocks {
    fixed: Regex,
    std: Regex,
}

fn clocks() -> &'static Clocks {
    static CLOCKS: OnceLock<Clocks> = OnceLock::new();
    CLOCKS.get_or_init(|| Clocks {
        fixed: Regex::new(r"gonet\.fixed:([-\d.]+)").expect("regex is valid"),
        std: Regex::new(r"gonet\.std:([-\d.]+)").expect("regex is valid"),
    })
}

/// `FixedUpdate,` / `FixedUpdate[hash],` and the same for `Update`.
fn names_callback(line: &str, callback: &str) -> bool {
    [",", "["]
        .iter()
        .any(|sep| line.contains(&format!("{}{}", callback, sep)))
}

/// Clock values of a `[PhysicsTime]` line, each looked up on its own so the
/// order they are printed in does not matter. Unparsable values are dropped.
fn clock_fields(line: &str) -> Fields {
    let c = clocks();
    let mut fields = Fields::new();
    for (name, re) in [("fixed", &c.fixed), ("std", &c.std)] {
        let value = re
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| FieldType::Float.convert(m.as_str()));
        if let Some(value) = value {
            fields.insert(name.to_string(), value);
        }
    }
    fields
}

pub fn registry() -> Result<PatternRegistry> {
    Ok(PatternRegistry::new()
        .with(
            PatternRule::regex(
                CATCHUP,
                r"Caught up (?P<iterations>\d+) physics steps \(from (?P<from>[\d.]+)s to (?P<to>[\d.]+)s, target: (?P<target>[\d.]+)s\)",
            )?
            .fields([
                FieldSpec::int("iterations"),
                FieldSpec::float("from"),
                FieldSpec::float("to"),
                FieldSpec::float("target"),
            ]),
        )
        .with(PatternRule::custom(FIXED_UPDATE, |line: &str| {
            if !line.contains(TAG) || !names_callback(line, "FixedUpdate") {
                return None;
            }
            Some(clock_fields(line))
        }))
        .with(PatternRule::custom(UPDATE, |line: &str| {
            if !line.contains(TAG) || line.contains("FixedUpdate") || !names_callback(line, "Update") {
                return None;
            }
            Some(clock_fields(line))
        })))
}

// ── Clock walk ────────────────────────────────────────────────────────────────

/// A value that went backwards: where, from what, to what.
#[derive(Debug, Clone, PartialEq)]
struct Violation {
    location: SourceLocation,
    prev: f64,
    curr: f64,
}

/// One clock's running baseline and observations.
#[derive(Debug, Default)]
struct ClockTrack {
    prev: Option<f64>,
    violations: Vec<Violation>,
    deltas: Vec<f64>,
}

impl ClockTrack {
    fn is_reset(&self, value: f64) -> bool {
        value > 0.0 && self.prev.is_some_and(|p| value < p - RESET_THRESHOLD)
    }

    fn observe(&mut self, location: &SourceLocation, value: f64) {
        if value <= 0.0 {
            return;
        }
        match self.prev {
            Some(prev) if value < prev => self.violations.push(Violation {
                location: location.clone(),
                prev,
                curr: value,
            }),
            Some(prev) => self.deltas.push(value - prev),
            None => {}
        }
        self.prev = Some(value);
    }

    fn mean_delta(&self) -> f64 {
        if self.deltas.is_empty() {
            return 0.0;
        }
        self.deltas.iter().sum::<f64>() / self.deltas.len() as f64
    }

    fn max_delta(&self) -> f64 {
        self.deltas.iter().copied().fold(0.0, f64::max)
    }
}

#[derive(Debug, Default)]
struct ClockReport {
    fixed: ClockTrack,
    std: ClockTrack,
    ping_pong: Vec<(SourceLocation, f64, f64)>,
}

fn clock_values(record: &EventRecord) -> (f64, f64) {
    (
        record.float("fixed").unwrap_or(0.0),
        record.float("std").unwrap_or(0.0),
    )
}

fn walk(entries: &[&EventRecord]) -> ClockReport {
    let mut report = ClockReport::default();
    for entry in entries {
        let (fixed, std) = clock_values(entry);

        if report.fixed.is_reset(fixed) {
            report.fixed.prev = None;
            report.std.prev = None;
        }
        if report.std.is_reset(std) {
            report.std.prev = None;
        }

        report.fixed.observe(&entry.location, fixed);
        report.std.observe(&entry.location, std);

        if fixed > 0.0 && std > 0.0 && std - fixed > PING_PONG_THRESHOLD {
            report.ping_pong.push((entry.location.clone(), fixed, std));
        }
    }
    report
}

fn seconds(value: f64) -> String {
    format!("{:.7}s", value)
}

fn millis(value: f64) -> String {
    format!("{}ms", format_number(value * 1000.0, 2))
}

// ── Analysis ──────────────────────────────────────────────────────────────────

pub fn analyze(log: &ExtractedLog, _request: &AnalysisRequest) -> Findings {
    let entries: Vec<&EventRecord> = log
        .records
        .iter()
        .filter(|r| r.is(FIXED_UPDATE) || r.is(UPDATE))
        .collect();
    if entries.is_empty() {
        let mut findings = Findings::new(Verdict::Skip, "No [PhysicsTime] entries found");
        findings.push(
            Section::new("Entry Statistics")
                .paragraph("Make sure the log contains debug output with [PhysicsTime] tags."),
        );
        return findings;
    }

    let clocks = walk(&entries);
    let monotonic = clocks.fixed.violations.is_empty() && clocks.std.violations.is_empty();
    let has_ping_pong = !clocks.ping_pong.is_empty();

    let mut findings = match (monotonic, has_ping_pong) {
        (true, false) => Findings::new(Verdict::Pass, "GOOD: clocks are monotonic with no ping-pong"),
        (true, true) => Findings::new(
            Verdict::Warn,
            format!(
                "WARNING: fixed time lagged behind standard time {} time(s)",
                clocks.ping_pong.len()
            ),
        ),
        (false, _) => Findings::new(Verdict::Fail, "FAILED: time values jumped backward"),
    };

    let fixed_count = log.count_kind(FIXED_UPDATE) as u64;
    let update_count = log.count_kind(UPDATE) as u64;
    findings.push(
        Section::new("Entry Statistics")
            .fact("Total entries", format_count(entries.len() as u64))
            .fact("Update() calls", format_count(update_count))
            .fact("FixedUpdate() calls", format_count(fixed_count)),
    );

    // ── Monotonicity ──────────────────────────────────────────────────────────
    let mut section = Section::new("Monotonicity Check");
    if monotonic {
        section = section.paragraph("All time values progress monotonically (no backward jumps).");
    } else {
        for (label, track) in [("gonet.fixed", &clocks.fixed), ("gonet.std", &clocks.std)] {
            if track.violations.is_empty() {
                continue;
            }
            section = section
                .paragraph(format!("{} violations ({}):", label, track.violations.len()))
                .list(track.violations.iter().take(SAMPLE_ROWS).map(|v| {
                    format!("{}: {} -> {} (BACKWARD)", v.location, seconds(v.prev), seconds(v.curr))
                }));
        }
    }
    findings.push(section);

    // ── Ping-pong ─────────────────────────────────────────────────────────────
    let mut section = Section::new("Ping-Pong Detection");
    if has_ping_pong {
        section = section
            .paragraph(format!(
                "Found {} instances where fixed < std. First {}:",
                clocks.ping_pong.len(),
                SAMPLE_ROWS.min(clocks.ping_pong.len())
            ))
            .list(clocks.ping_pong.iter().take(SAMPLE_ROWS).map(|(loc, fixed, std)| {
                format!(
                    "{}: fixed={}, std={} (gap: {})",
                    loc,
                    seconds(*fixed),
                    seconds(*std),
                    millis(std - fixed)
                )
            }));
    } else {
        section = section.paragraph("No ping-pong detected (fixed time never lags behind standard time).");
    }
    findings.push(section);

    findings.push(
        Section::new("Time Progression")
            .fact("gonet.fixed average delta", millis(clocks.fixed.mean_delta()))
            .fact("gonet.fixed max delta", millis(clocks.fixed.max_delta()))
            .fact("gonet.std average delta", millis(clocks.std.mean_delta()))
            .fact("gonet.std max delta", millis(clocks.std.max_delta())),
    );

    // ── Catchups ──────────────────────────────────────────────────────────────
    let catchups: Vec<&EventRecord> = log.of_kind(CATCHUP).collect();
    if !catchups.is_empty() {
        let iterations: Vec<i64> = catchups.iter().filter_map(|r| r.int("iterations")).collect();
        let total: i64 = iterations.iter().sum();
        let max = iterations.iter().copied().max().unwrap_or(0);
        let events = catchups.iter().take(CATCHUP_SAMPLES).map(|r| {
            format!(
                "{}: {} steps ({:.6}s -> {:.6}s, target: {:.6}s)",
                r.location,
                r.int("iterations").unwrap_or(0),
                r.float("from").unwrap_or(0.0),
                r.float("to").unwrap_or(0.0),
                r.float("target").unwrap_or(0.0),
            )
        });
        findings.push(
            Section::new("Catchup Statistics")
                .fact("Total catchups", format_count(catchups.len() as u64))
                .fact("Total iterations", total.to_string())
                .fact("Max iterations (single)", max.to_string())
                .fact(
                    "Average iterations",
                    format_number(total as f64 / catchups.len() as f64, 1),
                )
                .list(events),
        );
    }

    // ── Sample ────────────────────────────────────────────────────────────────
    let mut table = Table::new(["Line", "Type", "gonet.fixed", "gonet.std", "Gap (ms)"]).align_right(&[2, 3, 4]);
    for entry in entries.iter().take(SAMPLE_ROWS) {
        let (fixed, std) = clock_values(entry);
        let shown = |v: f64| if v > 0.0 { format!("{:.7}", v) } else { "N/A".to_string() };
        let gap = if fixed > 0.0 { (std - fixed) * 1000.0 } else { 0.0 };
        let label = if entry.is(FIXED_UPDATE) { "FixedUpdate" } else { "Update" };
        table.push_row([
            entry.location.to_string(),
            label.to_string(),
            shown(fixed),
            shown(std),
            format_number(gap, 2),
        ]);
    }
    findings.push(Section::new("Sample Time Progression").table(table));

    findings
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{extract_text, AnalysisKind};
    use logscope_report::Block;

    fn run(text: &str) -> Findings {
        let log = extract_text(registry().unwrap(), text);
        analyze(&log, &AnalysisRequest::new(AnalysisKind::PhysicsTime, Vec::new()))
    }

    fn fixed(v: f64, s: f64) -> String {
        format!(
            "[DEBUG][Server] [PhysicsTime] FixedUpdate, gonet.fixed:{:.7}  gonet.std:{:.7}  unity.fixed:0.0200000\n",
            v, s
        )
    }

    fn update(s: f64) -> String {
        format!("[DEBUG][Server] [PhysicsTime] Update, gonet.std:{:.7}  unity.std:0.0010014\n", s)
    }

    fn list_items(section: &Section) -> Vec<String> {
        section
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::List { items } => Some(items.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    // ── Rules ──

    #[test]
    fn test_rules_classify_lines() {
        let text = format!(
            "{}{}[PhysicsTime] Caught up 17 physics steps (from 0.200000s to 0.500300s, target: 0.500000s)\n\
             [PhysicsTime] Update[12345], gonet.std:0.3.\n",
            fixed(0.1, 0.1),
            update(0.2)
        );
        let log = extract_text(registry().unwrap(), &text);
        let kinds: Vec<&str> = log.records.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec![FIXED_UPDATE, UPDATE, CATCHUP, UPDATE]);
        assert_eq!(log.records[2].int("iterations"), Some(17));
        assert_eq!(log.records[3].float("std"), Some(0.3));
    }

    #[test]
    fn test_clock_values_in_any_order() {
        let text = "[DEBUG][Server] [PhysicsTime] FixedUpdate[-42], unity.fixed:0.02  gonet.std:0.5100000  gonet.fixed:0.5000000\n";
        let log = extract_text(registry().unwrap(), text);
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.records[0].kind, FIXED_UPDATE);
        assert_eq!(log.records[0].float("fixed"), Some(0.5));
        assert_eq!(log.records[0].float("std"), Some(0.51));
    }

    #[test]
    fn test_update_without_space_before_tag() {
        let text = "12:00:01 [INFO][Client:2][PhysicsTime]  Update, frame:88 gonet.std:1.25\n\
                    [PhysicsTime] Update called\n";
        let log = extract_text(registry().unwrap(), text);
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.records[0].kind, UPDATE);
        assert_eq!(log.records[0].float("std"), Some(1.25));
        assert_eq!(log.records[0].float("fixed"), None);
    }

    #[test]
    fn test_std_before_fixed_still_detects_ping_pong() {
        let text = "[PhysicsTime] FixedUpdate, gonet.std:0.1000000  gonet.fixed:0.1000000\n\
                    [PhysicsTime] FixedUpdate, gonet.std:0.1300000  gonet.fixed:0.1200000\n";
        assert_eq!(run(text).verdict, Verdict::Warn);
    }

    // ── Health ──

    #[test]
    fn test_monotonic_clocks_are_good() {
        let text = [fixed(0.10, 0.10), update(0.11), fixed(0.12, 0.12), update(0.13)].concat();
        let findings = run(&text);
        assert_eq!(findings.verdict, Verdict::Pass);
    }

    #[test]
    fn test_backward_jump_fails() {
        let text = [fixed(0.50, 0.50), fixed(0.40, 0.40)].concat();
        let findings = run(&text);
        assert_eq!(findings.verdict, Verdict::Fail);
        let mono = findings
            .sections
            .iter()
            .find(|s| s.heading == "Monotonicity Check")
            .unwrap();
        let items = list_items(mono);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], "test.log:2: 0.5000000s -> 0.4000000s (BACKWARD)");
    }

    #[test]
    fn test_large_backward_jump_is_session_reset() {
        let text = [fixed(5.0, 5.0), fixed(0.5, 0.5), fixed(0.6, 0.6)].concat();
        assert_eq!(run(&text).verdict, Verdict::Pass);
    }

    #[test]
    fn test_std_reset_keeps_fixed_baseline() {
        let text = [fixed(2.0, 2.0), update(0.5), fixed(1.9, 0.6)].concat();
        let findings = run(&text);
        // std reset at 0.5, fixed still compares 1.9 against 2.0.
        assert_eq!(findings.verdict, Verdict::Fail);
        let mono = findings
            .sections
            .iter()
            .find(|s| s.heading == "Monotonicity Check")
            .unwrap();
        assert_eq!(list_items(mono).len(), 1);
    }

    #[test]
    fn test_ping_pong_warns() {
        let text = [fixed(0.10, 0.10), fixed(0.12, 0.13)].concat();
        let findings = run(&text);
        assert_eq!(findings.verdict, Verdict::Warn);
        let pp = findings
            .sections
            .iter()
            .find(|s| s.heading == "Ping-Pong Detection")
            .unwrap();
        assert_eq!(
            list_items(pp),
            vec!["test.log:2: fixed=0.1200000s, std=0.1300000s (gap: 10.00ms)"]
        );
    }

    #[test]
    fn test_small_gap_is_tolerated() {
        let text = [fixed(0.10, 0.10), fixed(0.12, 0.124)].concat();
        assert_eq!(run(&text).verdict, Verdict::Pass);
    }

    #[test]
    fn test_catchup_statistics() {
        let text = format!(
            "{}[PhysicsTime] Caught up 4 physics steps (from 0.1s to 0.2s, target: 0.2s)\n\
             [PhysicsTime] Caught up 2 physics steps (from 0.2s to 0.3s, target: 0.3s)\n",
            fixed(0.1, 0.1)
        );
        let findings = run(&text);
        let section = findings
            .sections
            .iter()
            .find(|s| s.heading == "Catchup Statistics")
            .unwrap();
        let Block::Facts { items } = &section.blocks[0] else {
            panic!("expected facts");
        };
        let get = |k: &str| items.iter().find(|(l, _)| l == k).map(|(_, v)| v.as_str());
        assert_eq!(get("Total catchups"), Some("2"));
        assert_eq!(get("Total iterations"), Some("6"));
        assert_eq!(get("Max iterations (single)"), Some("4"));
        assert_eq!(get("Average iterations"), Some("3.0"));
    }

    #[test]
    fn test_no_entries_skips() {
        assert_eq!(run("nothing here\n").verdict, Verdict::Skip);
    }
}
