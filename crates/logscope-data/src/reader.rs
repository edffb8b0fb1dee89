//! Log source discovery and line streaming.
//!
//! Input paths are resolved up front (so a missing file aborts the run before
//! anything is analysed); each file is then streamed line by line through a
//! buffered reader that owns the file handle.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use logscope_core::models::SourceLocation;
use logscope_core::{AnalysisError, Result};
use tracing::{debug, warn};

/// Extensions picked up when a directory is scanned.
const LOG_EXTENSIONS: &[&str] = &["log", "txt"];

// ── Source discovery ──────────────────────────────────────────────────────────

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Find all `*.log` / `*.txt` files recursively under `dir`, sorted by path.
pub fn find_log_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| LOG_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

/// Turn the user's input paths into the list of files to read.
///
/// Files are taken as-is, directories are scanned with [`find_log_files`].
/// Any path that does not exist yields [`AnalysisError::SourceNotFound`].
pub fn resolve_sources(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();

    for original in paths {
        let path = expand_home(original);
        if !path.exists() {
            return Err(AnalysisError::SourceNotFound(original.clone()));
        }
        if path.is_dir() {
            let found = find_log_files(&path);
            if found.is_empty() {
                warn!("No log files found in {}", path.display());
            }
            debug!("Found {} log files in {}", found.len(), path.display());
            sources.extend(found);
        } else {
            sources.push(path);
        }
    }

    Ok(sources)
}

// ── Line streaming ────────────────────────────────────────────────────────────

/// One line of input with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    pub location: SourceLocation,
    pub text: String,
}

/// Forward-only iterator over the lines of one source.
///
/// Lines are decoded lossily (invalid UTF-8 becomes U+FFFD) with the line
/// terminator stripped. A read error is yielded once and ends the iteration.
pub struct LineSource<R> {
    name: Arc<str>,
    reader: R,
    buf: Vec<u8>,
    line: u64,
    done: bool,
}

impl LineSource<BufReader<File>> {
    /// Open `path` for streaming.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| AnalysisError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_reader(
            path.display().to_string(),
            BufReader::new(file),
        ))
    }
}

impl<R: BufRead> LineSource<R> {
    /// Stream lines from any buffered reader, reporting them under `name`.
    pub fn from_reader(name: impl Into<Arc<str>>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            buf: Vec::new(),
            line: 0,
            done: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of lines yielded so far.
    pub fn lines_read(&self) -> u64 {
        self.line
    }
}

impl<R: BufRead> Iterator for LineSource<R> {
    type Item = Result<SourceLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                }
                self.line += 1;
                Some(Ok(SourceLine {
                    location: SourceLocation::new(Arc::clone(&self.name), self.line),
                    text: String::from_utf8_lossy(&self.buf).into_owned(),
                }))
            }
            Err(source) => {
                self.done = true;
                Some(Err(AnalysisError::FileRead {
                    path: PathBuf::from(&*self.name),
                    source,
                }))
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
