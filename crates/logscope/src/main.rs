mod bootstrap;

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use logscope_core::models::Verdict;
use logscope_core::settings::Settings;
use logscope_data::analysis::{run_analysis, AnalysisKind, AnalysisRequest};
use logscope_report::{render, Format};

fn main() -> ExitCode {
    let settings = Settings::load();

    if let Err(e) = bootstrap::setup_logging(&settings.log_level, settings.log_file.as_deref()) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }
    tracing::info!("logscope v{} starting", env!("CARGO_PKG_VERSION"));

    let stdout = io::stdout();
    match run(&settings, &mut stdout.lock()) {
        Ok(verdict) => {
            tracing::info!("Finished with verdict {}", verdict);
            ExitCode::from(u8::try_from(verdict.exit_code()).unwrap_or(1))
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the requested analysis and write the report to `out` (and to
/// `--output` when given). Fatal errors return before anything is written.
fn run(settings: &Settings, out: &mut impl Write) -> Result<Verdict> {
    let kind: AnalysisKind = settings.analysis.parse()?;
    let format: Format = settings.format.parse().map_err(anyhow::Error::msg)?;

    let mut request = AnalysisRequest::new(kind, settings.paths.clone());
    request.peer = settings.effective_peer();
    request.entity_id = settings.entity_id;
    request.rules = settings.rules.clone();
    request.sample_limit = settings.sample_limit;

    let outcome = run_analysis(&request)?;
    tracing::debug!(
        "{} analysis produced {} sections ({} failures)",
        kind,
        outcome.report.sections.len(),
        outcome.failures
    );

    out.write_all(render(&outcome.report, format).as_bytes())?;
    out.flush()?;

    if let (Some(path), Some(export)) = (&settings.output, settings.export_format()) {
        let export: Format = export.parse().map_err(anyhow::Error::msg)?;
        std::fs::write(path, render(&outcome.report, export))
            .with_context(|| format!("cannot write report to {}", path.display()))?;
        tracing::info!("Report written to {}", path.display());
    }

    Ok(outcome.verdict)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use logscope_core::AnalysisError;
    use std::fs;
    use tempfile::TempDir;

    fn settings(args: &[&str]) -> Settings {
        let mut full = vec!["logscope"];
        full.extend_from_slice(args);
        Settings::try_load_from(full).expect("valid arguments")
    }

    // ── Fatal errors ──

    #[test]
    fn test_missing_source_prints_nothing() {
        let tmp = TempDir::new().expect("tempdir");
        let missing = tmp.path().join("gonet.log");
        let report = tmp.path().join("report.md");
        let s = settings(&[
            "ready-timing",
            missing.to_str().unwrap(),
            "--output",
            report.to_str().unwrap(),
        ]);

        let mut out = Vec::new();
        let err = run(&s, &mut out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::SourceNotFound(_))
        ));
        assert!(out.is_empty());
        assert!(!report.exists());
    }

    // ── Reports and verdicts ──

    #[test]
    fn test_report_goes_to_stdout_and_export_file() {
        let tmp = TempDir::new().expect("tempdir");
        let log = tmp.path().join("gonet.log");
        fs::write(
            &log,
            "[Server] frame:10/0.1 Start() called GONetId: 1, GameObject: Player\n\
             [Server] frame:13/0.2 OnGONetReady FIRED GONetId: 1\n",
        )
        .unwrap();
        let report = tmp.path().join("report.json");
        let s = settings(&[
            "ready-timing",
            log.to_str().unwrap(),
            "--output",
            report.to_str().unwrap(),
        ]);

        let mut out = Vec::new();
        let verdict = run(&s, &mut out).unwrap();
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(verdict.exit_code(), 0);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("OnGONetReady Timing Analysis"));

        let exported: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(exported["title"], "OnGONetReady Timing Analysis");
    }

    #[test]
    fn test_never_fired_exits_non_zero() {
        let tmp = TempDir::new().expect("tempdir");
        let log = tmp.path().join("gonet.log");
        fs::write(&log, "[Client:1] frame:10/0.1 Start() called GONetId: 4, GameObject: Door\n").unwrap();
        let s = settings(&["ready-timing", log.to_str().unwrap(), "--format", "markdown"]);

        let mut out = Vec::new();
        let verdict = run(&s, &mut out).unwrap();
        assert_eq!(verdict, Verdict::Fail);
        assert_ne!(verdict.exit_code(), 0);
    }

    #[test]
    fn test_custom_without_rules_is_fatal() {
        let tmp = TempDir::new().expect("tempdir");
        let log = tmp.path().join("a.log");
        fs::write(&log, "x\n").unwrap();
        let s = settings(&["custom", log.to_str().unwrap()]);
        let mut out = Vec::new();
        assert!(run(&s, &mut out).is_err());
        assert!(out.is_empty());
    }
}
