//! Text, markdown and JSON rendering of [`Report`] documents.
//!
//! Rendering is a pure function of the document: nothing here touches the
//! filesystem or the terminal.

use std::fmt::{self, Write};
use std::str::FromStr;

use logscope_core::models::Verdict;
use unicode_width::UnicodeWidthStr;

use crate::document::{Align, Block, Report, Section, Table};

const RULE_WIDTH: usize = 70;

/// Output format for [`render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Markdown,
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Format::Text),
            "markdown" | "md" => Ok(Format::Markdown),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown report format: {}", other)),
        }
    }
}

/// Render `report` in the requested format.
pub fn render(report: &Report, format: Format) -> String {
    let mut out = String::new();
    render_to(&mut out, report, format).map(|_| out).unwrap_or_default()
}

/// Render `report` into any [`fmt::Write`] sink.
pub fn render_to<W: Write>(out: &mut W, report: &Report, format: Format) -> fmt::Result {
    match format {
        Format::Text => render_text(out, report),
        Format::Markdown => render_markdown(out, report),
        Format::Json => write_json(out, report),
    }
}

/// Render a single table on its own.
pub fn render_table(table: &Table, format: Format) -> String {
    let mut out = String::new();
    let written = match format {
        Format::Text => text_table(&mut out, table),
        Format::Markdown => markdown_table(&mut out, table),
        Format::Json => write_json(&mut out, table),
    };
    written.map(|_| out).unwrap_or_default()
}

// ── Text ──────────────────────────────────────────────────────────────────────

fn render_text<W: Write>(out: &mut W, report: &Report) -> fmt::Result {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);

    writeln!(out, "{}", heavy)?;
    writeln!(out, "{}", report.title)?;
    writeln!(out, "{}", heavy)?;
    text_facts(out, &report.header)?;
    writeln!(out, "Verdict: [{}]", report.verdict.label())?;

    for section in &report.sections {
        writeln!(out)?;
        writeln!(out, "{}", light)?;
        writeln!(out, "{}", section.heading.to_uppercase())?;
        writeln!(out, "{}", light)?;
        text_section(out, section)?;
    }
    Ok(())
}

fn text_section<W: Write>(out: &mut W, section: &Section) -> fmt::Result {
    for (i, block) in section.blocks.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        match block {
            Block::Paragraph { text } => writeln!(out, "{}", text)?,
            Block::Facts { items } => text_facts(out, items)?,
            Block::Table { table } => text_table(out, table)?,
            Block::List { items } => {
                for item in items {
                    writeln!(out, "  - {}", item)?;
                }
            }
            Block::Status { verdict, message } => {
                writeln!(out, "[{}] {}", verdict.label(), message)?;
            }
        }
    }
    Ok(())
}

fn text_facts<W: Write>(out: &mut W, items: &[(String, String)]) -> fmt::Result {
    let width = items
        .iter()
        .map(|(label, _)| label.width() + 1)
        .max()
        .unwrap_or(0);
    for (label, value) in items {
        let key = format!("{}:", label);
        writeln!(out, "{} {}", pad(&key, width, Align::Left), value)?;
    }
    Ok(())
}

/// Fixed-width columns separated by two spaces with a dashed rule under the
/// header. Empty cells render as `-` so every row keeps its column count.
///
/// Runs of whitespace inside a cell collapse to one space; two spaces are
/// reserved as the column separator so the table splits back into the same
/// cells.
fn text_table<W: Write>(out: &mut W, table: &Table) -> fmt::Result {
    let cells = |row: &[String]| -> Vec<String> {
        row.iter()
            .map(|c| {
                let cell = c.split_whitespace().collect::<Vec<_>>().join(" ");
                if cell.is_empty() {
                    "-".to_string()
                } else {
                    cell
                }
            })
            .collect()
    };
    let headers = cells(table.headers.as_slice());
    let rows: Vec<Vec<String>> = table.rows.iter().map(|r| cells(r.as_slice())).collect();

    let widths: Vec<usize> = (0..headers.len())
        .map(|c| {
            rows.iter()
                .map(|r| r[c].width())
                .chain(std::iter::once(headers[c].width()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| -> String {
        values
            .iter()
            .enumerate()
            .map(|(c, v)| pad(v, widths[c], table.align[c]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    writeln!(out, "{}", line(headers.as_slice()))?;
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    writeln!(out, "{}", rule.join("  "))?;
    for row in &rows {
        writeln!(out, "{}", line(row.as_slice()))?;
    }
    Ok(())
}

fn pad(value: &str, width: usize, align: Align) -> String {
    let fill = " ".repeat(width.saturating_sub(value.width()));
    match align {
        Align::Left => format!("{}{}", value, fill),
        Align::Right => format!("{}{}", fill, value),
    }
}

// ── Markdown ──────────────────────────────────────────────────────────────────

fn status_marker(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Pass => "✅",
        Verdict::Warn => "⚠️",
        Verdict::Skip => "⏭️",
        Verdict::Fail => "❌",
    }
}

fn render_markdown<W: Write>(out: &mut W, report: &Report) -> fmt::Result {
    writeln!(out, "# {}\n", report.title)?;
    for (label, value) in &report.header {
        writeln!(out, "**{}:** {}\n", label, value)?;
    }
    writeln!(
        out,
        "**Verdict:** {} {}\n",
        status_marker(report.verdict),
        report.verdict.label()
    )?;

    for section in &report.sections {
        writeln!(out, "## {}\n", section.heading)?;
        for block in &section.blocks {
            match block {
                Block::Paragraph { text } => writeln!(out, "{}\n", text)?,
                Block::Facts { items } => {
                    for (label, value) in items {
                        writeln!(out, "- **{}:** {}", label, value)?;
                    }
                    writeln!(out)?;
                }
                Block::Table { table } => {
                    markdown_table(out, table)?;
                    writeln!(out)?;
                }
                Block::List { items } => {
                    for item in items {
                        writeln!(out, "- {}", item)?;
                    }
                    writeln!(out)?;
                }
                Block::Status { verdict, message } => {
                    writeln!(
                        out,
                        "{} **{}**: {}\n",
                        status_marker(*verdict),
                        verdict.label(),
                        message
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn markdown_table<W: Write>(out: &mut W, table: &Table) -> fmt::Result {
    let escape = |s: &str| s.replace('|', "\\|");
    let header: Vec<String> = table.headers.iter().map(|h| escape(h.as_str())).collect();
    writeln!(out, "| {} |", header.join(" | "))?;
    let rule: Vec<&str> = table
        .align
        .iter()
        .map(|a| match a {
            Align::Left => "---",
            Align::Right => "---:",
        })
        .collect();
    writeln!(out, "|{}|", rule.join("|"))?;
    for row in &table.rows {
        let cells: Vec<String> = row.iter().map(|c| escape(c.as_str())).collect();
        writeln!(out, "| {} |", cells.join(" | "))?;
    }
    Ok(())
}

// ── JSON ──────────────────────────────────────────────────────────────────────

fn write_json<W: Write, T: serde::Serialize>(out: &mut W, value: &T) -> fmt::Result {
    let json = serde_json::to_string_pretty(value).map_err(|_| fmt::Error)?;
    writeln!(out, "{}", json)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
