//! RPC validation sweep over a multi-peer test session.
//!
//! Every `[LEVEL][Machine] ... (frame:N/Ts) message` line is extracted, then
//! seven independent checks run over the messages: RunLocally ServerRpc,
//! ClientRpc broadcast, TargetRpc targeting, persistence for late joiners,
//! async completions, critical errors and the Shift+K execution summaries.

use std::collections::BTreeMap;

use logscope_core::formatting::{format_count, truncate};
use logscope_core::models::{EventRecord, Verdict};
use logscope_core::Result;
use logscope_report::{Section, Table};

use super::{AnalysisRequest, Findings};
use crate::extractor::ExtractedLog;
use crate::registry::{PatternRegistry, PatternRule};

const LINE: &str = "rpc-line";

/// ClientRpc test methods (zero to eight parameters) each client receives.
const EXPECTED_CLIENT_RPCS: usize = 9;
/// The peer that joins after the persistent RPCs were sent.
const LATE_JOINER: &str = "Client:3";
/// Passed share of checks at or above which the run only warns.
const MOSTLY_PASSING: f64 = 0.8;

const SAMPLE_CHARS: usize = 120;
const LISTED: usize = 10;
const PERSISTENCE_SAMPLES: usize = 5;
const SUMMARY_LINES: usize = 20;

pub fn registry() -> Result<PatternRegistry> {
    Ok(PatternRegistry::new().with(PatternRule::regex(
        LINE,
        r"^\[(?P<level>\w+)\]\[(?P<machine>[^\]]+)\].*?\(frame:\d+/[\d.]+s\)\s+(?P<message>.+)",
    )?))
}

// ── Lines ─────────────────────────────────────────────────────────────────────

struct Line<'a> {
    level: &'a str,
    machine: &'a str,
    message: &'a str,
}

impl<'a> Line<'a> {
    fn from_record(record: &'a EventRecord) -> Option<Self> {
        Some(Self {
            level: record.text("level")?,
            machine: record.text("machine")?,
            message: record.text("message")?,
        })
    }

    fn mentions(&self, literal: &str) -> bool {
        self.message.contains(literal)
    }

    /// Case-insensitive match; `literal` must be lowercase.
    fn mentions_any_case(&self, literal: &str) -> bool {
        self.message.to_lowercase().contains(literal)
    }

    fn sample(&self) -> String {
        truncate(self.message, SAMPLE_CHARS)
    }

    fn tagged(&self) -> String {
        format!("[{}] {}", self.machine, self.sample())
    }
}

/// Outcome of one check: its report section and whether it passed.
struct Check {
    name: &'static str,
    verdict: Verdict,
    section: Section,
}

fn count(n: usize) -> String {
    format_count(n as u64)
}

fn per_machine<'a, 'l: 'a>(lines: impl Iterator<Item = &'a Line<'l>>) -> BTreeMap<&'l str, usize> {
    let mut counts = BTreeMap::new();
    for line in lines {
        *counts.entry(line.machine).or_insert(0) += 1;
    }
    counts
}

fn machine_table(counts: &BTreeMap<&str, usize>, column: &str) -> Table {
    let mut table = Table::new(["Machine", column]).align_right(&[1]);
    for (machine, n) in counts {
        table.push_row([machine.to_string(), count(*n)]);
    }
    table
}

// ── Checks ────────────────────────────────────────────────────────────────────

fn run_locally(lines: &[Line]) -> Check {
    let mut local = Vec::new();
    let mut remote = Vec::new();
    let mut client = 0;
    for line in lines
        .iter()
        .filter(|l| l.mentions("ServerRpc") && l.mentions_any_case("executed"))
    {
        if line.machine == "Server" {
            if line.mentions("Remote: False") {
                local.push(line);
            } else if line.mentions("Remote: True") {
                remote.push(line);
            }
        } else if line.machine.contains("Client:") {
            client += 1;
        }
    }

    let mut section = Section::new("ServerRpc RunLocally")
        .fact("Server ServerRpc (RunLocally, Remote: False)", count(local.len()))
        .fact("Server ServerRpc (from clients, Remote: True)", count(remote.len()))
        .fact("Client ServerRpc initiated", count(client));
    let samples: Vec<String> = local.first().into_iter().chain(remote.first()).map(|l| l.sample()).collect();
    if !samples.is_empty() {
        section = section.list(samples);
    }

    let mut problems = Vec::new();
    if local.is_empty() {
        problems.push("No server-side ServerRpc with Remote: False (server calling its own ServerRpc)");
    }
    if remote.is_empty() {
        problems.push("No server-side ServerRpc with Remote: True (clients calling ServerRpc)");
    }
    let verdict = if problems.is_empty() { Verdict::Pass } else { Verdict::Fail };
    let section = if problems.is_empty() {
        section.status(verdict, "RunLocally behaviour validated")
    } else {
        section.list(problems).status(verdict, "RunLocally behaviour validation failed")
    };
    Check {
        name: "RunLocally (ServerRpc)",
        verdict,
        section,
    }
}

fn client_rpc_broadcast(lines: &[Line]) -> Check {
    let counts = per_machine(
        lines
            .iter()
            .filter(|l| l.mentions("ClientRpc") && l.mentions_any_case("executed")),
    );
    let clients: Vec<(&str, usize)> = counts
        .iter()
        .filter(|(m, _)| m.starts_with("Client:"))
        .map(|(m, n)| (*m, *n))
        .collect();
    let short: Vec<String> = clients
        .iter()
        .filter(|(_, n)| *n < EXPECTED_CLIENT_RPCS)
        .map(|(m, n)| format!("{} received {} ClientRpcs, expected {}", m, n, EXPECTED_CLIENT_RPCS))
        .collect();

    let mut section = Section::new("ClientRpc Broadcast").table(machine_table(&counts, "ClientRpc executed"));
    let server = counts.get("Server").copied().unwrap_or(0);
    if server > 0 {
        section = section.paragraph(format!(
            "Server executed {} ClientRpcs locally (host mode, not dedicated).",
            server
        ));
    }

    let (verdict, message) = if clients.is_empty() {
        (Verdict::Skip, "No ClientRpc broadcasts detected")
    } else if short.is_empty() {
        (Verdict::Pass, "ClientRpc broadcast validated")
    } else {
        section = section.list(short);
        (Verdict::Fail, "ClientRpc broadcast validation failed")
    };
    Check {
        name: "ClientRpc Broadcast",
        verdict,
        section: section.status(verdict, message),
    }
}

fn target_rpc(lines: &[Line]) -> Check {
    let counts = per_machine(
        lines
            .iter()
            .filter(|l| l.mentions("TargetRpc") || l.mentions("LogOnAllMachines")),
    );
    let total: usize = counts.values().sum();
    let section = Section::new("TargetRpc Targeting").table(machine_table(&counts, "TargetRpc executed"));
    let (verdict, message) = if total > 0 {
        (
            Verdict::Pass,
            format!("TargetRpc targeting validated ({} total executions)", total),
        )
    } else {
        (Verdict::Skip, "No TargetRpc executions detected".to_string())
    };
    Check {
        name: "TargetRpc Targeting",
        verdict,
        section: section.status(verdict, message),
    }
}

fn persistence(lines: &[Line]) -> Check {
    let entries: Vec<&Line> = lines
        .iter()
        .filter(|l| l.mentions("RPC executions recorded") || l.mentions_any_case("persistent"))
        .collect();
    let claims = per_machine(
        lines
            .iter()
            .filter(|l| l.mentions_any_case("claimed") || l.mentions("Claim successful")),
    );
    let late: Vec<&Line> = lines
        .iter()
        .filter(|l| l.mentions_any_case("late") && l.mentions_any_case("join"))
        .collect();

    let mut section = Section::new("RPC Persistence & Late-Joiner")
        .fact("Persistence log entries", count(entries.len()))
        .fact("Late-joiner deliveries", count(late.len()));
    if !entries.is_empty() {
        section = section.list(entries.iter().take(PERSISTENCE_SAMPLES).map(|l| l.tagged()));
    }
    if !claims.is_empty() {
        section = section.table(machine_table(&claims, "Claims"));
    }
    if !late.is_empty() {
        section = section.list(late.iter().map(|l| l.tagged()));
    }

    let late_claims = claims.get(LATE_JOINER).copied().unwrap_or(0);
    let (verdict, message) = if late_claims > 0 {
        (
            Verdict::Pass,
            format!(
                "Late-joiner ({}) received {} persistent RPCs",
                LATE_JOINER, late_claims
            ),
        )
    } else {
        (Verdict::Skip, format!("No late-joiner ({}) claims detected", LATE_JOINER))
    };
    Check {
        name: "Persistence & Late-Joiner",
        verdict,
        section: section.status(verdict, message),
    }
}

fn async_completions(lines: &[Line]) -> Check {
    let done: Vec<&Line> = lines.iter().filter(|l| l.mentions("ASYNC DONE")).collect();
    let returned: Vec<&Line> = lines.iter().filter(|l| l.mentions("Claim successful")).collect();

    let mut section = Section::new("Async RPC & Return Values")
        .fact("Async completions ('ASYNC DONE')", count(done.len()))
        .fact("Async return values ('Claim successful')", count(returned.len()));
    let samples: Vec<String> = done.first().into_iter().chain(returned.first()).map(|l| l.sample()).collect();
    if !samples.is_empty() {
        section = section.list(samples);
    }

    let (verdict, message) = if done.is_empty() && returned.is_empty() {
        (Verdict::Skip, "No async RPC completions detected")
    } else {
        (Verdict::Pass, "Async RPC completions validated")
    };
    Check {
        name: "Async RPC Completions",
        verdict,
        section: section.status(verdict, message),
    }
}

fn errors_and_warnings(lines: &[Line]) -> Check {
    let errors: Vec<&Line> = lines
        .iter()
        .filter(|l| l.level == "ERROR" || l.level == "FATAL")
        .collect();
    let warnings: Vec<&Line> = lines.iter().filter(|l| l.level == "WARNING").collect();
    let critical: Vec<&Line> = warnings
        .iter()
        .filter(|l| l.mentions("No dispatcher found"))
        .chain(errors.iter().filter(|l| l.mentions("NullReference")))
        .copied()
        .collect();
    let dispatcher = warnings.iter().filter(|l| l.mentions("No dispatcher found")).count();

    let mut section = Section::new("Errors & Warnings")
        .fact("Errors", count(errors.len()))
        .fact("Warnings", count(warnings.len()))
        .fact("'No dispatcher found' warnings", count(dispatcher))
        .fact("NullReferenceException errors", count(critical.len() - dispatcher));
    if !errors.is_empty() {
        section = section
            .paragraph(format!("First {} errors:", LISTED.min(errors.len())))
            .list(errors.iter().take(LISTED).map(|l| l.tagged()));
    }
    if !warnings.is_empty() {
        section = section
            .paragraph(format!("First {} warnings:", LISTED.min(warnings.len())))
            .list(warnings.iter().take(LISTED).map(|l| l.tagged()));
    }

    let (verdict, message) = if critical.is_empty() {
        (Verdict::Pass, "No critical errors (dispatcher/nullref)".to_string())
    } else {
        section = section
            .paragraph("Critical:")
            .list(critical.iter().map(|l| l.tagged()));
        (Verdict::Fail, format!("{} critical errors found", critical.len()))
    };
    Check {
        name: "Error-Free Execution",
        verdict,
        section: section.status(verdict, message),
    }
}

/// Shift+K summaries: the header line plus the plain lines printed right
/// after it on the same machine's log. A line whose message opens with `[`
/// ends the block.
fn summaries<'l>(lines: &[Line<'l>]) -> BTreeMap<&'l str, Vec<&'l str>> {
    let mut out: BTreeMap<&'l str, Vec<&'l str>> = BTreeMap::new();
    let mut current: Option<&'l str> = None;
    for line in lines {
        if line.mentions("RPC execution summary") {
            current = Some(line.machine);
            out.entry(line.machine).or_default().push(line.message);
        } else if let Some(machine) = current {
            if !line.message.trim().is_empty() && !line.message.starts_with('[') {
                out.entry(machine).or_default().push(line.message);
            } else {
                current = None;
            }
        }
    }
    out
}

fn rpc_summaries(lines: &[Line]) -> Check {
    let found = summaries(lines);
    let mut section = Section::new("RPC Execution Summaries");
    for (machine, body) in &found {
        section = section
            .paragraph(format!("[{}] Summary:", machine))
            .list(body.iter().take(SUMMARY_LINES).map(|s| s.to_string()));
    }
    let (verdict, message) = if found.is_empty() {
        (Verdict::Skip, "No RPC summaries found")
    } else {
        (Verdict::Pass, "RPC summaries found")
    };
    Check {
        name: "RPC Summaries",
        verdict,
        section: section.status(verdict, message),
    }
}

// ── Analysis ──────────────────────────────────────────────────────────────────

pub fn analyze(log: &ExtractedLog, _request: &AnalysisRequest) -> Findings {
    let lines: Vec<Line> = log.of_kind(LINE).filter_map(Line::from_record).collect();
    if lines.is_empty() {
        let mut findings = Findings::new(Verdict::Skip, "No GONet log lines found");
        findings.push(
            Section::new("Final Validation Report")
                .paragraph("Expected lines shaped like [LEVEL][Machine] ... (frame:N/Ts) message."),
        );
        return findings;
    }

    let checks = [
        run_locally(&lines),
        client_rpc_broadcast(&lines),
        target_rpc(&lines),
        persistence(&lines),
        async_completions(&lines),
        errors_and_warnings(&lines),
        rpc_summaries(&lines),
    ];
    let total = checks.len();
    let passed = checks.iter().filter(|c| c.verdict == Verdict::Pass).count();

    let mut findings = if passed == total {
        Findings::new(Verdict::Pass, "All validations passed")
    } else if passed as f64 >= total as f64 * MOSTLY_PASSING {
        Findings::new(
            Verdict::Warn,
            format!("Mostly passing: {}/{} checks passed", passed, total),
        )
    } else {
        Findings::new(
            Verdict::Fail,
            format!("Validation failed: {}/{} checks passed", passed, total),
        )
    };

    let mut table = Table::new(["Check", "Result"]);
    for check in &checks {
        table.push_row([check.name, check.verdict.label()]);
    }
    let report = Section::new("Final Validation Report")
        .fact("Log lines", count(lines.len()))
        .fact("Tests passed", format!("{}/{}", passed, total))
        .table(table);

    for check in checks {
        findings.push(check.section);
    }
    findings.push(report);
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
        analyze(&log, &AnalysisRequest::new(AnalysisKind::RpcValidation, Vec::new()))
    }

    fn line(level: &str, machine: &str, message: &str) -> String {
        format!(
            "[{}][{}] (Thread:1) 2025-11-10 14:02:11,512 (frame:1200/24.0s) {}\n",
            level, machine, message
        )
    }

    fn section<'f>(findings: &'f Findings, heading: &str) -> &'f Section {
        findings.sections.iter().find(|s| s.heading == heading).unwrap()
    }

    fn fact(section: &Section, label: &str) -> String {
        section
            .blocks
            .iter()
            .find_map(|b| match b {
                Block::Facts { items } => items.iter().find(|(l, _)| l == label).map(|(_, v)| v.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn status(section: &Section) -> Verdict {
        match section.blocks.last() {
            Some(Block::Status { verdict, .. }) => *verdict,
            other => panic!("expected a status block, got {:?}", other),
        }
    }

    fn broadcasts(machine: &str, n: usize) -> String {
        (0..n)
            .map(|i| line("INFO", machine, &format!("ClientRpc_{}Params executed", i)))
            .collect()
    }

    fn healthy_session() -> String {
        [
            line("INFO", "Server", "ServerRpc_NoParams executed. Remote: False"),
            line("INFO", "Server", "ServerRpc_NoParams executed. Remote: True"),
            line("INFO", "Client:1", "ServerRpc_NoParams executed on request"),
            broadcasts("Client:1", 9),
            broadcasts("Client:2", 9),
            line("INFO", "Client:2", "TargetRpc LogOnAllMachines received"),
            line("INFO", "Server", "3 RPC executions recorded for late joiners"),
            line("INFO", "Client:3", "Claim successful: item 4"),
            line("INFO", "Client:1", "ASYNC DONE: GetServerTime returned 24.1"),
            line("INFO", "Server", "RPC execution summary (Shift+K):"),
            line("INFO", "Server", "  ServerRpc_NoParams: 2"),
            line("INFO", "Server", "  ClientRpc_0Params: 1"),
        ]
        .concat()
    }

    #[test]
    fn test_rule_reads_level_machine_and_message() {
        let log = extract_text(
            registry().unwrap(),
            &format!("{}no frame marker here\n", line("WARNING", "Client:2", "No dispatcher found")),
        );
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.records[0].text("level"), Some("WARNING"));
        assert_eq!(log.records[0].text("machine"), Some("Client:2"));
        assert_eq!(log.records[0].text("message"), Some("No dispatcher found"));
    }

    #[test]
    fn test_healthy_session_passes_every_check() {
        let findings = run(&healthy_session());
        assert_eq!(findings.verdict, Verdict::Pass);
        let report = section(&findings, "Final Validation Report");
        assert_eq!(fact(report, "Tests passed"), "7/7");
        let runs = section(&findings, "ServerRpc RunLocally");
        assert_eq!(fact(runs, "Server ServerRpc (RunLocally, Remote: False)"), "1");
        assert_eq!(fact(runs, "Client ServerRpc initiated"), "1");
        let persistence = section(&findings, "RPC Persistence & Late-Joiner");
        assert_eq!(fact(persistence, "Persistence log entries"), "1");
        // "late joiners" mentions both words.
        assert_eq!(fact(persistence, "Late-joiner deliveries"), "1");
    }

    #[test]
    fn test_one_failed_check_only_warns() {
        let text = healthy_session().replace("Remote: True", "Remote: unknown");
        let findings = run(&text);
        assert_eq!(status(section(&findings, "ServerRpc RunLocally")), Verdict::Fail);
        assert_eq!(findings.verdict, Verdict::Warn);
        assert_eq!(findings.message, "Mostly passing: 6/7 checks passed");
    }

    #[test]
    fn test_short_client_broadcast_fails() {
        let text = [
            broadcasts("Client:1", 9),
            broadcasts("Client:2", 4),
            broadcasts("Server", 2),
        ]
        .concat();
        let findings = run(&text);
        let broadcast = section(&findings, "ClientRpc Broadcast");
        assert_eq!(status(broadcast), Verdict::Fail);
        assert!(broadcast.blocks.iter().any(|b| matches!(
            b,
            Block::List { items } if items == &vec!["Client:2 received 4 ClientRpcs, expected 9".to_string()]
        )));
        assert!(broadcast.blocks.iter().any(|b| matches!(
            b,
            Block::Paragraph { text } if text.contains("host mode")
        )));
        // Only the error check passes, so the run fails overall.
        assert_eq!(findings.verdict, Verdict::Fail);
    }

    #[test]
    fn test_critical_errors_fail_their_check() {
        let text = [
            line("ERROR", "Client:1", "NullReferenceException in RpcDispatcher"),
            line("ERROR", "Client:1", "Socket closed"),
            line("WARNING", "Server", "No dispatcher found for RPC 0x1F"),
            line("WARNING", "Server", "Slow frame"),
        ]
        .concat();
        let findings = run(&text);
        let errors = section(&findings, "Errors & Warnings");
        assert_eq!(fact(errors, "Errors"), "2");
        assert_eq!(fact(errors, "Warnings"), "2");
        assert_eq!(fact(errors, "'No dispatcher found' warnings"), "1");
        assert_eq!(fact(errors, "NullReferenceException errors"), "1");
        assert_eq!(status(errors), Verdict::Fail);
    }

    #[test]
    fn test_summary_block_ends_at_bracketed_message() {
        let text = [
            line("INFO", "Client:1", "RPC execution summary:"),
            line("INFO", "Client:1", "  ClientRpc_0Params: 3"),
            line("INFO", "Client:1", "[Shift+K] done"),
            line("INFO", "Client:1", "  stray line"),
        ]
        .concat();
        let lines_log = extract_text(registry().unwrap(), &text);
        let lines: Vec<Line> = lines_log.of_kind(LINE).filter_map(Line::from_record).collect();
        let found = summaries(&lines);
        assert_eq!(
            found.get("Client:1"),
            Some(&vec!["RPC execution summary:", "ClientRpc_0Params: 3"])
        );
    }

    #[test]
    fn test_no_lines_skips() {
        assert_eq!(run("plain text\n").verdict, Verdict::Skip);
    }
}
