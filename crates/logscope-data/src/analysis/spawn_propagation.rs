//! Spawn propagation across peers.
//!
//! Each peer writes its own event log: a header naming its role and
//! authority, then `[Event N] Type=...` blocks. Every GONetId spawned by an
//! `InstantiateGONetParticipantEvent` on one peer should show up on all
//! others; the ones that do not are listed per peer and per origin, next to
//! any message queue backups the clients reported.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use logscope_core::formatting::{format_count, truncate};
use logscope_core::models::{EventRecord, FieldValue, Fields, Verdict};
use logscope_report::{Section, Table};
use regex::Regex;

use super::{AnalysisRequest, Findings};
use crate::extractor::ExtractedLog;
use crate::registry::{PatternRegistry, PatternRule};

pub const ENTITY_FIELD: &str = "GONetId";

const QUEUE_BACKUP: &str = "queue-backup";
const HEADER: &str = "peer-header";
const EVENT: &str = "event";
const DETAIL: &str = "event-detail";

const SPAWN_EVENT: &str = "InstantiateGONetParticipantEvent";

/// Missing GONetIds listed in full up to this many; longer runs show both ends.
const ID_PREVIEW: usize = 20;
const QUEUE_SAMPLES: usize = 5;
const QUEUE_MESSAGE_CHARS: usize = 100;

// ── Rules ─────────────────────────────────────────────────────────────────────

struct Matchers {
    role: Regex,
    authority: Regex,
    event: Regex,
    id: Regex,
    owner: Regex,
    location: Regex,
    queue: Regex,
}

fn matchers() -> &'static Matchers {
    static MATCHERS: OnceLock<Matchers> = OnceLock::new();
    MATCHERS.get_or_init(|| Matchers {
        role: Regex::new(r"Role: (\w+)").expect("regex is valid"),
        authority: Regex::new(r"Authority ID: (\d+)").expect("regex is valid"),
        event: Regex::new(r"\[Event (\d+)\] Type=(\w+)").expect("regex is valid"),
        id: Regex::new(r"GONetId: (\d+)").expect("regex is valid"),
        owner: Regex::new(r"Owner: Authority(\d+)").expect("regex is valid"),
        location: Regex::new(r"Details: .*?DesignTimeLocation=([\w:/.]+)").expect("regex is valid"),
        queue: Regex::new(r"\[(Client:\d+)\].*?(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})").expect("regex is valid"),
    })
}

fn capture<'l>(re: &Regex, line: &'l str) -> Option<&'l str> {
    re.captures(line)?.get(1).map(|m| m.as_str())
}

fn insert_int(fields: &mut Fields, name: &str, raw: Option<&str>) {
    if let Some(value) = raw.and_then(|r| r.parse::<i64>().ok()) {
        fields.insert(name.to_string(), FieldValue::Int(value));
    }
}

fn insert_text(fields: &mut Fields, name: &str, raw: Option<&str>) {
    if let Some(value) = raw {
        fields.insert(name.to_string(), FieldValue::from(value));
    }
}

/// Spawn details carried by a line; an event block may spread them over
/// several lines or print them all on the event line itself.
fn detail_fields(line: &str, fields: &mut Fields) {
    let p = matchers();
    insert_int(fields, ENTITY_FIELD, capture(&p.id, line));
    insert_int(fields, "owner", capture(&p.owner, line));
    insert_text(fields, "location", capture(&p.location, line));
}

pub fn registry() -> PatternRegistry {
    PatternRegistry::new()
        .with(PatternRule::custom(QUEUE_BACKUP, |line: &str| {
            if !line.contains("QUEUE-BACKUP") && !line.contains("messageQueue depth") {
                return None;
            }
            let caps = matchers().queue.captures(line)?;
            let mut fields = Fields::new();
            fields.insert("client".to_string(), FieldValue::from(caps.get(1)?.as_str()));
            fields.insert("at".to_string(), FieldValue::from(caps.get(2)?.as_str()));
            fields.insert("message".to_string(), FieldValue::from(line.trim()));
            Some(fields)
        }))
        .with(PatternRule::custom(HEADER, |line: &str| {
            let p = matchers();
            let mut fields = Fields::new();
            insert_text(&mut fields, "role", capture(&p.role, line));
            insert_int(&mut fields, "authority", capture(&p.authority, line));
            (!fields.is_empty()).then_some(fields)
        }))
        .with(PatternRule::custom(EVENT, |line: &str| {
            let caps = matchers().event.captures(line)?;
            let mut fields = Fields::new();
            insert_int(&mut fields, "event", caps.get(1).map(|m| m.as_str()));
            insert_text(&mut fields, "type", caps.get(2).map(|m| m.as_str()));
            detail_fields(line, &mut fields);
            Some(fields)
        }))
        .with(PatternRule::custom(DETAIL, |line: &str| {
            let mut fields = Fields::new();
            detail_fields(line, &mut fields);
            (!fields.is_empty()).then_some(fields)
        }))
}

// ── Peer logs ─────────────────────────────────────────────────────────────────

/// One spawn event as it is being read.
#[derive(Debug, Clone, Default)]
struct Spawn {
    gonet_id: Option<i64>,
    owner: Option<i64>,
    location: Option<String>,
}

impl Spawn {
    /// First value wins, as a block's details follow its event line.
    fn absorb(&mut self, record: &EventRecord) {
        if self.gonet_id.is_none() {
            self.gonet_id = record.int(ENTITY_FIELD);
        }
        if self.owner.is_none() {
            self.owner = record.int("owner");
        }
        if self.location.is_none() {
            self.location = record.text("location").map(str::to_string);
        }
    }
}

/// Everything one source file says about its peer.
#[derive(Debug)]
struct PeerLog {
    file: Arc<str>,
    role: Option<String>,
    authority: Option<i64>,
    spawns: BTreeSet<i64>,
}

impl PeerLog {
    fn new(file: Arc<str>) -> Self {
        Self {
            file,
            role: None,
            authority: None,
            spawns: BTreeSet::new(),
        }
    }

    /// Keep a finished spawn block if it named its GONetId, owner and
    /// design-time location.
    fn finish(&mut self, spawn: Spawn) {
        if let (Some(id), Some(_), Some(_)) = (spawn.gonet_id, spawn.owner, spawn.location) {
            self.spawns.insert(id);
        }
    }

    fn is_peer(&self) -> bool {
        self.role.is_some() || !self.spawns.is_empty()
    }

    /// `Server`, or the role with its authority (`Client3`); the file name
    /// when the header is missing.
    fn name(&self) -> String {
        match (&self.role, self.authority) {
            (Some(role), Some(id)) if role != "Server" => format!("{}{}", role, id),
            (Some(role), _) => role.clone(),
            (None, _) => Path::new(&*self.file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.file.to_string()),
        }
    }
}

/// Walk the records file by file, opening a block at each spawn event and
/// closing it at the next event line or at the end of the file.
fn read_peer_logs(log: &ExtractedLog) -> Vec<PeerLog> {
    let mut logs: Vec<PeerLog> = Vec::new();
    let mut open: Option<Spawn> = None;

    for record in &log.records {
        if logs.last().map_or(true, |l| l.file != record.location.file) {
            if let (Some(last), Some(spawn)) = (logs.last_mut(), open.take()) {
                last.finish(spawn);
            }
            logs.push(PeerLog::new(Arc::clone(&record.location.file)));
        }
        let Some(current) = logs.last_mut() else {
            continue;
        };

        match record.kind.as_str() {
            HEADER => {
                if current.role.is_none() {
                    current.role = record.text("role").map(str::to_string);
                }
                if current.authority.is_none() {
                    current.authority = record.int("authority");
                }
            }
            EVENT => {
                if let Some(spawn) = open.take() {
                    current.finish(spawn);
                }
                if record.text("type") == Some(SPAWN_EVENT) {
                    let mut spawn = Spawn::default();
                    spawn.absorb(record);
                    open = Some(spawn);
                }
            }
            DETAIL => {
                if let Some(spawn) = open.as_mut() {
                    spawn.absorb(record);
                }
            }
            _ => {}
        }
    }
    if let (Some(last), Some(spawn)) = (logs.last_mut(), open.take()) {
        last.finish(spawn);
    }
    logs
}

#[derive(Debug, Default)]
struct Peer {
    authority: Option<i64>,
    files: Vec<String>,
    spawns: BTreeSet<i64>,
}

/// Peers by name; files naming the same peer are merged.
fn peers(log: &ExtractedLog) -> BTreeMap<String, Peer> {
    let mut out: BTreeMap<String, Peer> = BTreeMap::new();
    for file in read_peer_logs(log).into_iter().filter(PeerLog::is_peer) {
        let peer = out.entry(file.name()).or_default();
        peer.authority = peer.authority.or(file.authority);
        peer.files.push(file.file.to_string());
        peer.spawns.extend(file.spawns);
    }
    out
}

/// Missing GONetIds per peer, grouped by the first peer (by name) that has
/// them.
fn missing_spawns(peers: &BTreeMap<String, Peer>) -> BTreeMap<&str, BTreeMap<&str, Vec<i64>>> {
    let all: BTreeSet<i64> = peers.values().flat_map(|p| p.spawns.iter().copied()).collect();
    let mut missing: BTreeMap<&str, BTreeMap<&str, Vec<i64>>> = BTreeMap::new();
    for id in all {
        let origin = peers
            .iter()
            .find(|(_, p)| p.spawns.contains(&id))
            .map(|(name, _)| name.as_str())
            .unwrap_or("Unknown");
        for (name, peer) in peers {
            if !peer.spawns.contains(&id) {
                missing
                    .entry(name.as_str())
                    .or_default()
                    .entry(origin)
                    .or_default()
                    .push(id);
            }
        }
    }
    missing
}

fn id_preview(ids: &[i64]) -> String {
    let join = |ids: &[i64]| ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    if ids.len() <= ID_PREVIEW {
        join(ids)
    } else {
        let half = ID_PREVIEW / 2;
        format!("{} ... {}", join(&ids[..half]), join(&ids[ids.len() - half..]))
    }
}

// ── Analysis ──────────────────────────────────────────────────────────────────

fn queue_section(log: &ExtractedLog) -> Section {
    let mut by_client: BTreeMap<&str, Vec<&EventRecord>> = BTreeMap::new();
    for record in log.of_kind(QUEUE_BACKUP) {
        if let Some(client) = record.text("client") {
            by_client.entry(client).or_default().push(record);
        }
    }

    let mut section = Section::new("Queue Backup Warnings");
    if by_client.is_empty() {
        return section.paragraph("No queue backup warnings found.");
    }
    for (client, warnings) in &by_client {
        let mut items: Vec<String> = warnings
            .iter()
            .take(QUEUE_SAMPLES)
            .map(|w| {
                format!(
                    "{}: {}",
                    w.text("at").unwrap_or("?"),
                    truncate(w.text("message").unwrap_or(""), QUEUE_MESSAGE_CHARS)
                )
            })
            .collect();
        if warnings.len() > QUEUE_SAMPLES {
            items.push(format!("... and {} more warnings", warnings.len() - QUEUE_SAMPLES));
        }
        section = section
            .paragraph(format!("{}: {} warnings", client, warnings.len()))
            .list(items);
    }
    section
}

pub fn analyze(log: &ExtractedLog, _request: &AnalysisRequest) -> Findings {
    let peers = peers(log);
    if peers.is_empty() {
        let mut findings = Findings::new(Verdict::Skip, "No spawn event logs found");
        findings.push(
            Section::new("Spawn Count by Peer")
                .paragraph("Expected per-peer event logs with a Role header and [Event N] blocks."),
        );
        return findings;
    }

    let missing = missing_spawns(&peers);
    let missing_total: usize = missing.values().flat_map(|o| o.values()).map(Vec::len).sum();
    let unique: BTreeSet<i64> = peers.values().flat_map(|p| p.spawns.iter().copied()).collect();

    let mut findings = if missing.is_empty() {
        Findings::new(Verdict::Pass, "All spawns propagated to all peers")
    } else {
        Findings::new(
            Verdict::Fail,
            format!(
                "{} spawn(s) missing across {} peer(s)",
                missing_total,
                missing.len()
            ),
        )
    };

    let mut table = Table::new(["Peer", "Authority", "Spawns", "Files"]).align_right(&[1, 2]);
    for (name, peer) in &peers {
        table.push_row([
            name.clone(),
            peer.authority.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            format_count(peer.spawns.len() as u64),
            peer.files.join(", "),
        ]);
    }
    findings.push(
        Section::new("Spawn Count by Peer")
            .table(table)
            .fact("Unique GONetIds across all peers", format_count(unique.len() as u64)),
    );

    let mut section = Section::new("Propagation Failures");
    if missing.is_empty() {
        section = section.paragraph("All spawns propagated to all peers.");
    }
    for (peer, by_origin) in &missing {
        let count: usize = by_origin.values().map(Vec::len).sum();
        let mut table = Table::new(["From", "Missing", "GONetIds"]).align_right(&[1]);
        for (origin, ids) in by_origin {
            table.push_row([origin.to_string(), format_count(ids.len() as u64), id_preview(ids)]);
        }
        section = section
            .paragraph(format!("{} is MISSING {} spawns:", peer, count))
            .table(table);
    }
    findings.push(section);

    findings.push(queue_section(log));
    findings
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{run_analysis, AnalysisKind};
    use crate::extractor::EventExtractor;
    use crate::reader::LineSource;
    use logscope_report::Block;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn event_log(role: &str, authority: u32, ids: &[i64]) -> String {
        let mut out = format!(
            "=== GONet Event Log ===\nRole: {}\nAuthority ID: {}\n",
            role, authority
        );
        for (n, id) in ids.iter().enumerate() {
            out.push_str(&format!(
                "[Event {:06}] Type={}\n  Timestamp: Ticks=638960000000000000\n  GONetId: {}\n  Owner: Authority{}\n  Details: Prefab=Projectile DesignTimeLocation=project://Assets/Projectile.prefab Position=(0,0,0)\n",
                n + 1,
                SPAWN_EVENT,
                id,
                authority
            ));
        }
        out
    }

    fn extract(files: &[(&str, String)]) -> ExtractedLog {
        let extractor = EventExtractor::new(registry());
        let sources = files
            .iter()
            .map(|(name, text)| LineSource::from_reader(*name, Cursor::new(text.clone().into_bytes())));
        let mut extraction = extractor.extract(sources.flatten());
        let records = extraction.by_ref().collect();
        ExtractedLog {
            records,
            stats: extraction.into_stats(),
            sources: Vec::new(),
        }
    }

    fn run(files: &[(&str, String)]) -> Findings {
        let log = extract(files);
        analyze(&log, &AnalysisRequest::new(AnalysisKind::SpawnPropagation, Vec::new()))
    }

    fn section<'f>(findings: &'f Findings, heading: &str) -> &'f Section {
        findings.sections.iter().find(|s| s.heading == heading).unwrap()
    }

    fn tables(section: &Section) -> Vec<&Table> {
        section
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::Table { table } => Some(table),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_peer_names_from_headers() {
        let log = extract(&[
            ("gonet-events-a.txt", event_log("Server", 1024, &[1])),
            ("gonet-events-b.txt", event_log("Client", 3, &[1])),
            ("gonet-events-c.txt", "[Event 000001] Type=InstantiateGONetParticipantEvent GONetId: 7 Owner: Authority2 Details: DesignTimeLocation=project://A.prefab\n".to_string()),
        ]);
        let peers = peers(&log);
        let names: Vec<&str> = peers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["Client3", "Server", "gonet-events-c.txt"]);
        assert_eq!(peers["Client3"].authority, Some(3));
        assert!(peers["gonet-events-c.txt"].spawns.contains(&7));
    }

    #[test]
    fn test_only_complete_spawn_blocks_count() {
        let text = "Role: Server\n\
                    [Event 000001] Type=SyncValueChangeEvent\n  GONetId: 9999\n\
                    [Event 000002] Type=InstantiateGONetParticipantEvent\n  GONetId: 12\n  Owner: Authority1024\n\
                    [Event 000003] Type=InstantiateGONetParticipantEvent\n  GONetId: 13\n  Owner: Authority1024\n  Details: DesignTimeLocation=project://Assets/Cube.prefab\n";
        let log = extract(&[("server.txt", text.to_string())]);
        let peers = peers(&log);
        let spawns: Vec<i64> = peers["Server"].spawns.iter().copied().collect();
        assert_eq!(spawns, vec![13]);
    }

    #[test]
    fn test_all_propagated_passes() {
        let findings = run(&[
            ("s.txt", event_log("Server", 1024, &[5119, 5120])),
            ("c1.txt", event_log("Client", 1, &[5119, 5120])),
        ]);
        assert_eq!(findings.verdict, Verdict::Pass);
        let counts = section(&findings, "Spawn Count by Peer");
        let table = tables(counts)[0];
        assert_eq!(table.rows[0][0], "Client1");
        assert_eq!(table.rows[0][2], "2");
    }

    #[test]
    fn test_missing_spawns_grouped_by_origin() {
        let findings = run(&[
            ("s.txt", event_log("Server", 1024, &[1, 2, 3])),
            ("c1.txt", event_log("Client", 1, &[1, 2, 3, 4])),
            ("c2.txt", event_log("Client", 2, &[1, 3])),
        ]);
        assert_eq!(findings.verdict, Verdict::Fail);
        assert_eq!(findings.message, "3 spawn(s) missing across 2 peer(s)");

        let failures = section(&findings, "Propagation Failures");
        assert!(failures.blocks.iter().any(|b| matches!(
            b,
            Block::Paragraph { text } if text == "Client2 is MISSING 2 spawns:"
        )));
        let tables = tables(failures);
        // Client2 first, then Server.
        assert_eq!(tables[0].rows, vec![vec!["Client1".to_string(), "2".to_string(), "2, 4".to_string()]]);
        assert_eq!(tables[1].rows, vec![vec!["Client1".to_string(), "1".to_string(), "4".to_string()]]);
    }

    #[test]
    fn test_long_id_runs_show_both_ends() {
        let ids: Vec<i64> = (1..=25).collect();
        assert_eq!(
            id_preview(&ids),
            "1, 2, 3, 4, 5, 6, 7, 8, 9, 10 ... 16, 17, 18, 19, 20, 21, 22, 23, 24, 25"
        );
        assert_eq!(id_preview(&[4, 8]), "4, 8");
    }

    #[test]
    fn test_queue_backups_per_client() {
        let main: String = (0..7)
            .map(|i| {
                format!(
                    "[WARNING][Client:2] (Thread:1) 2025-10-13 10:00:0{},000 (frame:5/0.1s) [QUEUE-BACKUP] messageQueue depth {}\n",
                    i,
                    100 + i
                )
            })
            .collect();
        let findings = run(&[
            ("s.txt", event_log("Server", 1024, &[1])),
            ("gonet-2025-10-13.log", main),
        ]);
        let queue = section(&findings, "Queue Backup Warnings");
        assert_eq!(queue.blocks[0], Block::Paragraph { text: "Client:2: 7 warnings".to_string() });
        let Block::List { items } = &queue.blocks[1] else {
            panic!("expected a list");
        };
        assert_eq!(items.len(), 6);
        assert!(items[0].starts_with("2025-10-13 10:00:00: [WARNING][Client:2]"));
        assert_eq!(items[5], "... and 2 more warnings");
        // The main log is not a peer.
        assert_eq!(tables(section(&findings, "Spawn Count by Peer"))[0].rows.len(), 1);
    }

    #[test]
    fn test_no_event_logs_skips() {
        let findings = run(&[("main.log", "[INFO][Server] boot\n".to_string())]);
        assert_eq!(findings.verdict, Verdict::Skip);
    }

    #[test]
    fn test_run_over_log_directory() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("gonet-events-server-1.txt"), event_log("Server", 1024, &[10, 11])).unwrap();
        fs::write(tmp.path().join("gonet-events-client-2.txt"), event_log("Client", 2, &[10])).unwrap();
        let request = AnalysisRequest::new(AnalysisKind::SpawnPropagation, vec![tmp.path().to_path_buf()]);
        let outcome = run_analysis(&request).unwrap();
        assert_eq!(outcome.verdict, Verdict::Fail);
        assert!(outcome.report.section("Propagation Failures").is_some());
    }

    #[test]
    fn test_entity_filter_narrows_to_one_spawn() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("server.txt"), event_log("Server", 1024, &[10, 11])).unwrap();
        fs::write(tmp.path().join("client.txt"), event_log("Client", 2, &[10])).unwrap();
        let mut request = AnalysisRequest::new(AnalysisKind::SpawnPropagation, vec![tmp.path().to_path_buf()]);
        request.entity_id = Some(10);
        let outcome = run_analysis(&request).unwrap();
        assert_eq!(outcome.verdict, Verdict::Pass);
    }
}
