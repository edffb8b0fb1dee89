//! Table builders for aggregations and join results.

use logscope_core::formatting::{format_count, format_number, format_sample};
use logscope_core::models::{EventRecord, JoinKey, JoinResult};
use logscope_core::stats::{AggregateBucket, Aggregation, Denominator};

use crate::document::Table;

/// Cell text for a side of a join whose partner never appeared.
pub const NEVER: &str = "NEVER";

// ── Bucket tables ─────────────────────────────────────────────────────────────

/// Column layout for [`bucket_table`].
#[derive(Debug, Clone)]
pub struct BucketColumns {
    /// One header per key component. A single header shows the whole key.
    pub key_headers: Vec<String>,
    /// Label of the metric (`"delay"`); `None` renders counts only.
    pub metric: Option<String>,
    /// Decimal places for mean and percentile cells.
    pub decimals: u32,
}

impl BucketColumns {
    pub fn new<S: Into<String>>(key_headers: impl IntoIterator<Item = S>) -> Self {
        Self {
            key_headers: key_headers.into_iter().map(Into::into).collect(),
            metric: None,
            decimals: 2,
        }
    }

    pub fn metric(mut self, label: impl Into<String>) -> Self {
        self.metric = Some(label.into());
        self
    }

    pub fn decimals(mut self, decimals: u32) -> Self {
        self.decimals = decimals;
        self
    }
}

/// One row per bucket in key order.
///
/// Columns: key component(s), `Total`, then with a metric `Samples`,
/// `Missing`, a present-share column whose header names its denominator,
/// and `Mean`/`Min`/`Max`/`P90` (empty when undefined).
pub fn bucket_table(aggregation: &Aggregation, columns: &BucketColumns) -> Table {
    let key_width = columns.key_headers.len().max(1);
    let mut headers: Vec<String> = if columns.key_headers.is_empty() {
        vec!["Group".to_string()]
    } else {
        columns.key_headers.clone()
    };
    headers.push("Total".to_string());

    if let Some(metric) = &columns.metric {
        headers.push("Samples".to_string());
        headers.push("Missing".to_string());
        headers.push(format!("Present (% of {})", Denominator::Total.label()));
        headers.push(format!("Mean {}", metric));
        headers.push("Min".to_string());
        headers.push("Max".to_string());
        headers.push("P90".to_string());
    }

    let numeric: Vec<usize> = (key_width..headers.len()).collect();
    let mut table = Table::new(headers).align_right(&numeric);

    for bucket in aggregation.iter() {
        let mut row = key_cells(&bucket.key, key_width);
        row.push(format_count(bucket.total()));
        if columns.metric.is_some() {
            row.extend(metric_cells(bucket, columns.decimals));
        }
        table.push_row(row);
    }
    table
}

fn metric_cells(bucket: &AggregateBucket, decimals: u32) -> Vec<String> {
    let stat = |v: Option<f64>| v.map(|x| format_number(x, decimals)).unwrap_or_default();
    let sample = |v: Option<f64>| v.map(|x| format_sample(x, decimals as usize)).unwrap_or_default();
    vec![
        format_count(bucket.sample_count()),
        format_count(bucket.missing()),
        format!("{}%", format_number(bucket.present_share().value(), 1)),
        stat(bucket.mean()),
        sample(bucket.min()),
        sample(bucket.max()),
        stat(bucket.percentile(90.0)),
    ]
}

fn key_cells(key: &JoinKey, width: usize) -> Vec<String> {
    if width == 1 {
        return vec![key.to_string()];
    }
    (0..width)
        .map(|i| key.parts().get(i).map(ToString::to_string).unwrap_or_default())
        .collect()
}

/// Frequency distribution of one bucket's samples, ascending by value.
pub fn distribution_table(bucket: &AggregateBucket, value_header: &str) -> Table {
    let mut table = Table::new([
        value_header.to_string(),
        "Count".to_string(),
        format!("% of {}", Denominator::NonMissing.label()),
    ])
    .align_right(&[0, 1, 2]);

    for entry in bucket.distribution() {
        table.push_row([
            format_sample(entry.value, 3),
            format_count(entry.count),
            format!("{}%", format_number(entry.share.value(), 1)),
        ]);
    }
    table
}

// ── Join tables ───────────────────────────────────────────────────────────────

/// Column layout for [`join_table`].
#[derive(Debug, Clone)]
pub struct JoinColumns {
    pub key_headers: Vec<String>,
    /// `(header, field)` pairs read from the left record.
    pub left_fields: Vec<(String, String)>,
    /// `(header, field)` pairs read from the right record.
    pub right_fields: Vec<(String, String)>,
    pub metric_header: Option<String>,
    /// Maximum number of rows; `None` shows every result.
    pub limit: Option<usize>,
}

impl JoinColumns {
    pub fn new<S: Into<String>>(key_headers: impl IntoIterator<Item = S>) -> Self {
        Self {
            key_headers: key_headers.into_iter().map(Into::into).collect(),
            left_fields: Vec::new(),
            right_fields: Vec::new(),
            metric_header: None,
            limit: None,
        }
    }

    pub fn left(mut self, header: impl Into<String>, field: impl Into<String>) -> Self {
        self.left_fields.push((header.into(), field.into()));
        self
    }

    pub fn right(mut self, header: impl Into<String>, field: impl Into<String>) -> Self {
        self.right_fields.push((header.into(), field.into()));
        self
    }

    pub fn metric(mut self, header: impl Into<String>) -> Self {
        self.metric_header = Some(header.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One row per join result in input order. Right-side cells of an unmatched
/// result read `NEVER`.
pub fn join_table(results: &[JoinResult], columns: &JoinColumns) -> Table {
    let key_width = columns.key_headers.len().max(1);
    let mut headers: Vec<String> = if columns.key_headers.is_empty() {
        vec!["Key".to_string()]
    } else {
        columns.key_headers.clone()
    };
    headers.extend(columns.left_fields.iter().map(|(h, _)| h.clone()));
    headers.extend(columns.right_fields.iter().map(|(h, _)| h.clone()));
    if let Some(metric) = &columns.metric_header {
        headers.push(metric.clone());
    }

    let mut table = Table::new(headers);
    if columns.metric_header.is_some() {
        let last = table.headers.len() - 1;
        table = table.align_right(&[last]);
    }

    let limit = columns.limit.unwrap_or(results.len());
    for result in results.iter().take(limit) {
        let mut row = key_cells(&result.key, key_width);
        row.extend(side_cells(result.left.as_ref(), &columns.left_fields));
        row.extend(side_cells(result.right.as_ref(), &columns.right_fields));
        if columns.metric_header.is_some() {
            let cell = match (&result.right, result.metric) {
                (None, _) => NEVER.to_string(),
                (Some(_), Some(m)) => format_sample(m, 3),
                (Some(_), None) => String::new(),
            };
            row.push(cell);
        }
        table.push_row(row);
    }
    table
}

fn side_cells(record: Option<&EventRecord>, fields: &[(String, String)]) -> Vec<String> {
    fields
        .iter()
        .map(|(_, field)| match record {
            Some(r) => r.get(field).map(ToString::to_string).unwrap_or_default(),
            None => NEVER.to_string(),
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────────
