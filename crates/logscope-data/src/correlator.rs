//! Left outer join of two record streams by key.

use std::collections::HashMap;

use logscope_core::data_processors::TimestampProcessor;
use logscope_core::models::{EventRecord, JoinKey, JoinResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where the `right − left` metric of a matched pair comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// Numeric field delta, `right.<right> − left.<left>`.
    Field { left: String, right: String },
    /// Timestamp delta in milliseconds.
    Timestamp,
}

impl MetricSource {
    /// Same field name on both sides.
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        MetricSource::Field {
            left: name.clone(),
            right: name,
        }
    }

    /// `right − left`; `None` when either side lacks the value.
    pub fn compute(&self, left: &EventRecord, right: &EventRecord) -> Option<f64> {
        match self {
            MetricSource::Field { left: l, right: r } => {
                // Integer fields subtract exactly before widening.
                if let (Some(a), Some(b)) = (left.int(l), right.int(r)) {
                    return Some(b.checked_sub(a)? as f64);
                }
                Some(right.float(r)? - left.float(l)?)
            }
            MetricSource::Timestamp => {
                TimestampProcessor::delta_millis(left.timestamp.as_ref()?, right.timestamp.as_ref()?)
            }
        }
    }
}

/// Key function reading the named fields, in order.
pub fn key_fields<'a>(names: &'a [&'a str]) -> impl Fn(&EventRecord) -> Option<JoinKey> + 'a {
    move |record: &EventRecord| JoinKey::from_fields(record, names)
}

/// Join every `left` record with the first `right` record sharing its key.
///
/// * Exactly one result per left record, in left order.
/// * Later right records with an already seen key are ignored.
/// * Right records without a left partner are never emitted.
/// * A left record whose key cannot be built is unmatched with an empty key.
pub fn correlate<'a, L, R, K>(
    left: L,
    right: R,
    key_fn: K,
    metric: Option<&MetricSource>,
) -> Vec<JoinResult>
where
    L: IntoIterator<Item = &'a EventRecord>,
    R: IntoIterator<Item = &'a EventRecord>,
    K: Fn(&EventRecord) -> Option<JoinKey>,
{
    let mut first_right: HashMap<JoinKey, &EventRecord> = HashMap::new();
    let mut duplicates = 0usize;
    for record in right {
        let Some(key) = key_fn(record) else {
            continue;
        };
        if first_right.contains_key(&key) {
            duplicates += 1;
        } else {
            first_right.insert(key, record);
        }
    }
    if duplicates > 0 {
        debug!("Ignored {} duplicate right-side records", duplicates);
    }

    left.into_iter()
        .map(|l| match key_fn(l) {
            Some(key) => {
                let right = first_right.get(&key).copied();
                let value = match (metric, right) {
                    (Some(m), Some(r)) => m.compute(l, r),
                    _ => None,
                };
                JoinResult {
                    key,
                    left: Some(l.clone()),
                    right: right.cloned(),
                    metric: value,
                }
            }
            None => JoinResult {
                key: JoinKey::default(),
                left: Some(l.clone()),
                right: None,
                metric: None,
            },
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────────
