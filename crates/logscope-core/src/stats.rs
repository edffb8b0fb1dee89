//! Aggregate buckets and the statistics derived from them.
//!
//! Buckets store only the raw encounter-ordered samples plus two counters;
//! every statistic is computed on demand.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::formatting;
use crate::models::JoinKey;

// ── Percentiles ───────────────────────────────────────────────────────────────

/// Compute the `p`-th percentile of a **sorted** slice using linear
/// interpolation between closest ranks.
///
/// Returns `None` for an empty slice.
pub fn percentile(sorted_data: &[f64], p: f64) -> Option<f64> {
    let len = sorted_data.len();
    match len {
        0 => None,
        1 => Some(sorted_data[0]),
        _ => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (len as f64 - 1.0);
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some(sorted_data[lo] + frac * (sorted_data[hi] - sorted_data[lo]))
        }
    }
}

// ── Percentage ────────────────────────────────────────────────────────────────

/// Which population a percentage was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Denominator {
    /// Every record in the bucket, including those with a missing metric.
    Total,
    /// Only records that produced a metric sample.
    NonMissing,
}

impl Denominator {
    pub fn label(self) -> &'static str {
        match self {
            Denominator::Total => "total",
            Denominator::NonMissing => "non-missing",
        }
    }
}

/// A percentage that always knows its denominator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentage {
    pub part: u64,
    pub base: u64,
    pub denominator: Denominator,
}

impl Percentage {
    pub fn new(part: u64, base: u64, denominator: Denominator) -> Self {
        Self {
            part,
            base,
            denominator,
        }
    }

    /// Percentage value in `0..=100`; `0.0` when the base is empty.
    pub fn value(&self) -> f64 {
        formatting::percentage(self.part as f64, self.base as f64, 6)
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}% of {} {}",
            formatting::format_number(self.value(), 1),
            self.base,
            self.denominator.label()
        )
    }
}

// ── Distribution ──────────────────────────────────────────────────────────────

/// One distinct sample value and how often it occurred.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionEntry {
    pub value: f64,
    pub count: u64,
    /// Share of non-missing samples.
    pub share: Percentage,
}

// ── AggregateBucket ───────────────────────────────────────────────────────────

/// Records grouped under one key.
///
/// `total` counts every record routed to the bucket; `missing` counts those
/// whose metric was absent; `samples` holds the present metrics in encounter
/// order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub key: JoinKey,
    total: u64,
    missing: u64,
    samples: Vec<f64>,
}

impl AggregateBucket {
    pub fn new(key: JoinKey) -> Self {
        Self {
            key,
            total: 0,
            missing: 0,
            samples: Vec::new(),
        }
    }

    /// Route one record into the bucket.
    pub fn record(&mut self, metric: Option<f64>) {
        self.total += 1;
        match metric {
            Some(v) => self.samples.push(v),
            None => self.missing += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn missing(&self) -> u64 {
        self.missing
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    /// `sum / sample_count`, or `None` when there are no samples.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum() / self.samples.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.samples.iter().copied().min_by(f64::total_cmp)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().max_by(f64::total_cmp)
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        percentile(&self.sorted_samples(), p)
    }

    /// Share of records that produced a sample, against the bucket total.
    pub fn present_share(&self) -> Percentage {
        Percentage::new(self.sample_count(), self.total, Denominator::Total)
    }

    /// Share of records with a missing metric, against the bucket total.
    pub fn missing_share(&self) -> Percentage {
        Percentage::new(self.missing, self.total, Denominator::Total)
    }

    /// Distinct sample values in ascending order with their counts and share
    /// of the non-missing samples.
    pub fn distribution(&self) -> Vec<DistributionEntry> {
        let sorted = self.sorted_samples();
        let base = sorted.len() as u64;
        let mut out: Vec<DistributionEntry> = Vec::new();

        for value in sorted {
            match out.last_mut() {
                Some(last) if last.value.total_cmp(&value).is_eq() => {
                    last.count += 1;
                    last.share.part += 1;
                }
                _ => out.push(DistributionEntry {
                    value,
                    count: 1,
                    share: Percentage::new(1, base, Denominator::NonMissing),
                }),
            }
        }
        out
    }

    fn sorted_samples(&self) -> Vec<f64> {
        let mut v = self.samples.clone();
        v.sort_by(f64::total_cmp);
        v
    }
}

// ── Aggregation ───────────────────────────────────────────────────────────────

/// A frozen, key-ordered set of buckets ready for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregation {
    buckets: BTreeMap<JoinKey, AggregateBucket>,
}

impl Aggregation {
    pub fn from_buckets(buckets: BTreeMap<JoinKey, AggregateBucket>) -> Self {
        Self { buckets }
    }

    pub fn get(&self, key: &JoinKey) -> Option<&AggregateBucket> {
        self.buckets.get(key)
    }

    /// Buckets in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregateBucket> {
        self.buckets.values()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Sum of every bucket's `total`.
    pub fn total(&self) -> u64 {
        self.buckets.values().map(AggregateBucket::total).sum()
    }

    /// Sum of every bucket's `missing`.
    pub fn missing(&self) -> u64 {
        self.buckets.values().map(AggregateBucket::missing).sum()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_with(samples: &[Option<f64>]) -> AggregateBucket {
        let mut b = AggregateBucket::new(JoinKey::default());
        for s in samples {
            b.record(*s);
        }
        b
    }

    // ── percentile ──

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile(&[], 90.0), None);
    }

    #[test]
    fn test_percentile_lone_sample_is_every_rank() {
        assert_eq!(percentile(&[7.0], 5.0), Some(7.0));
        assert_eq!(percentile(&[7.0], 95.0), Some(7.0));
    }

    #[test]
    fn test_percentile_frame_delay_tail() {
        let delays = [1.0, 2.0, 2.0, 3.0, 8.0];
        assert_eq!(percentile(&delays, 50.0), Some(2.0));
        let p95 = percentile(&delays, 95.0).unwrap();
        assert!((p95 - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_rank_is_clamped() {
        let delays = [1.0, 4.0];
        assert_eq!(percentile(&delays, 150.0), Some(4.0));
        assert_eq!(percentile(&delays, -5.0), Some(1.0));
    }

    // ── AggregateBucket ──────────────────────────────────────────────────────

    #[test]
    fn test_bucket_delay_statistics() {
        let b = bucket_with(&[Some(5.0), Some(6.0), Some(5.0)]);
        assert_eq!(b.total(), 3);
        assert_eq!(b.sample_count(), 3);
        assert_eq!(b.missing(), 0);
        assert!((b.mean().unwrap() - 16.0 / 3.0).abs() < 1e-9);
        assert_eq!(b.min(), Some(5.0));
        assert_eq!(b.max(), Some(6.0));
    }

    #[test]
    fn test_bucket_mean_matches_sum_over_samples() {
        let b = bucket_with(&[Some(1.5), None, Some(-3.0), Some(10.0)]);
        let mean = b.mean().unwrap();
        assert!((mean - b.sum() / b.sample_count() as f64).abs() < 1e-12);
        assert_eq!(b.total(), 4);
        assert_eq!(b.missing(), 1);
    }

    #[test]
    fn test_empty_bucket_statistics_are_undefined() {
        let b = bucket_with(&[None, None]);
        assert_eq!(b.mean(), None);
        assert_eq!(b.min(), None);
        assert_eq!(b.max(), None);
        assert_eq!(b.percentile(50.0), None);
        assert!(b.distribution().is_empty());
        assert_eq!(b.missing(), 2);
    }

    #[test]
    fn test_samples_keep_encounter_order() {
        let b = bucket_with(&[Some(3.0), Some(1.0), Some(2.0)]);
        assert_eq!(b.samples(), &[3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_distribution_counts_and_shares() {
        let b = bucket_with(&[Some(5.0), Some(6.0), None, Some(5.0)]);
        let dist = b.distribution();
        assert_eq!(dist.len(), 2);
        assert_eq!(dist[0].value, 5.0);
        assert_eq!(dist[0].count, 2);
        assert_eq!(dist[0].share.base, 3);
        assert_eq!(dist[0].share.denominator, Denominator::NonMissing);
        assert!((dist[0].share.value() - 66.666_667).abs() < 1e-6);
        assert_eq!(dist[1].value, 6.0);
        assert_eq!(dist[1].count, 1);
    }

    #[test]
    fn test_present_share_uses_total() {
        let b = bucket_with(&[Some(1.0), None, None, Some(2.0)]);
        let share = b.present_share();
        assert_eq!(share.denominator, Denominator::Total);
        assert_eq!(share.base, 4);
        assert_eq!(share.value(), 50.0);
        assert_eq!(b.missing_share().part, 2);
    }

    // ── Percentage display ───────────────────────────────────────────────────

    #[test]
    fn test_percentage_display_states_denominator() {
        let p = Percentage::new(2, 3, Denominator::NonMissing);
        assert_eq!(p.to_string(), "66.7% of 3 non-missing");
        let q = Percentage::new(0, 0, Denominator::Total);
        assert_eq!(q.to_string(), "0.0% of 0 total");
    }

    // ── Aggregation ──────────────────────────────────────────────────────────

    #[test]
    fn test_aggregation_totals() {
        let mut map = BTreeMap::new();
        let mut a = AggregateBucket::new(JoinKey::single("Server"));
        a.record(Some(1.0));
        a.record(None);
        let mut b = AggregateBucket::new(JoinKey::single("Client:1"));
        b.record(Some(2.0));
        map.insert(a.key.clone(), a);
        map.insert(b.key.clone(), b);

        let agg = Aggregation::from_buckets(map);
        assert_eq!(agg.len(), 2);
        assert_eq!(agg.total(), 3);
        assert_eq!(agg.missing(), 1);
        let keys: Vec<String> = agg.iter().map(|b| b.key.to_string()).collect();
        assert_eq!(keys, vec!["Client:1", "Server"]);
    }
}
