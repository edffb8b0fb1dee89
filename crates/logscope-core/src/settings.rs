use clap::Parser;
use std::path::{Path, PathBuf};

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Offline log analysis for networked simulation logs
#[derive(Parser, Debug, Clone)]
#[command(
    name = "logscope",
    about = "Extract, correlate and summarise events from middleware log files",
    version
)]
pub struct Settings {
    /// Analysis to run
    #[arg(value_parser = [
        "ready-timing",
        "rpc-results",
        "rpc-validation",
        "physics-time",
        "anchoring",
        "spawn-propagation",
        "custom",
    ])]
    pub analysis: String,

    /// Log files or directories to scan (directories are searched for *.log / *.txt)
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<PathBuf>,

    /// Only keep records for this entity id
    #[arg(long, alias = "gonetid")]
    pub entity_id: Option<i64>,

    /// Only consider lines from this peer: "server", "client" or an exact tag such as "Client:2"
    #[arg(long)]
    pub peer: Option<String>,

    /// Shorthand for --peer server
    #[arg(long, conflicts_with = "peer")]
    pub server_only: bool,

    /// Also write the report to this file
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Report format written to stdout
    #[arg(long, default_value = "text", value_parser = ["text", "markdown", "json"])]
    pub format: String,

    /// Format of the --output file (inferred from its extension when omitted)
    #[arg(long, value_parser = ["text", "markdown", "json"])]
    pub export_format: Option<String>,

    /// JSON rule set (required for the custom analysis)
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Number of sample rows shown in detail sections
    #[arg(long, default_value = "20")]
    pub sample_limit: usize,

    /// Logging level
    #[arg(long, default_value = "WARNING", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    pub log_level: String,

    /// Log file path (logs go to stderr when omitted)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Parse the process arguments.
    pub fn load() -> Self {
        Settings::parse()
    }

    /// Parse an explicit argument list.
    pub fn try_load_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Settings::try_parse_from(args)
    }

    /// The peer filter in effect, folding `--server-only` into `--peer`.
    pub fn effective_peer(&self) -> Option<String> {
        if self.server_only {
            return Some("server".to_string());
        }
        self.peer.clone()
    }

    /// Export format for `--output`: the explicit flag, else the file
    /// extension (`.md` → markdown, `.json` → json), else text.
    pub fn export_format(&self) -> Option<String> {
        let output = self.output.as_ref()?;
        if let Some(explicit) = &self.export_format {
            return Some(explicit.clone());
        }
        Some(format_for_extension(output).to_string())
    }
}

fn format_for_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("md") | Some("markdown") => "markdown",
        Some("json") => "json",
        _ => "text",
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
