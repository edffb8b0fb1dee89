//! Report document model.
//!
//! Analyses build a [`Report`] out of sections and blocks; the renderer turns
//! it into text, markdown or JSON without making any decisions of its own.

use logscope_core::models::Verdict;
use serde::Serialize;

/// Column alignment in a [`Table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Right,
}

/// A rectangular table of pre-formatted cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub align: Vec<Align>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// New table; every column is left aligned until [`Table::align_right`].
    pub fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>) -> Self {
        let headers: Vec<String> = headers.into_iter().map(Into::into).collect();
        let align = vec![Align::Left; headers.len()];
        Self {
            headers,
            align,
            rows: Vec::new(),
        }
    }

    /// Right-align the given column indices (numeric columns).
    pub fn align_right(mut self, columns: &[usize]) -> Self {
        for &c in columns {
            if let Some(a) = self.align.get_mut(c) {
                *a = Align::Right;
            }
        }
        self
    }

    /// Append a row, padding or truncating it to the header width.
    pub fn push_row<S: Into<String>>(&mut self, cells: impl IntoIterator<Item = S>) {
        let mut row: Vec<String> = cells.into_iter().map(Into::into).collect();
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One renderable unit inside a [`Section`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Paragraph { text: String },
    /// Label/value pairs rendered as an aligned list.
    Facts { items: Vec<(String, String)> },
    Table { table: Table },
    List { items: Vec<String> },
    Status { verdict: Verdict, message: String },
}

/// A titled group of blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub heading: String,
    pub blocks: Vec<Block>,
}

impl Section {
    pub fn new(heading: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            blocks: Vec::new(),
        }
    }

    pub fn paragraph(mut self, text: impl Into<String>) -> Self {
        self.blocks.push(Block::Paragraph { text: text.into() });
        self
    }

    pub fn fact(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        let pair = (label.into(), value.into());
        match self.blocks.last_mut() {
            Some(Block::Facts { items }) => items.push(pair),
            _ => self.blocks.push(Block::Facts { items: vec![pair] }),
        }
        self
    }

    pub fn table(mut self, table: Table) -> Self {
        self.blocks.push(Block::Table { table });
        self
    }

    pub fn list<S: Into<String>>(mut self, items: impl IntoIterator<Item = S>) -> Self {
        self.blocks.push(Block::List {
            items: items.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn status(mut self, verdict: Verdict, message: impl Into<String>) -> Self {
        self.blocks.push(Block::Status {
            verdict,
            message: message.into(),
        });
        self
    }
}

/// A complete analysis report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub title: String,
    pub verdict: Verdict,
    /// Free-form header facts (sources, filters, counts).
    pub header: Vec<(String, String)>,
    pub sections: Vec<Section>,
}

impl Report {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            verdict: Verdict::Pass,
            header: Vec::new(),
            sections: Vec::new(),
        }
    }

    pub fn header_fact(&mut self, label: impl Into<String>, value: impl Into<String>) {
        self.header.push((label.into(), value.into()));
    }

    pub fn push(&mut self, section: Section) {
        self.sections.push(section);
    }

    pub fn section(&self, heading: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.heading == heading)
    }
}
