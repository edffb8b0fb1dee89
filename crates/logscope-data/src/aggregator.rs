//! Grouped statistics over records and join results.
//!
//! Accumulation happens in an [`Aggregator`]; [`Aggregator::freeze`] moves
//! the buckets into an immutable [`Aggregation`] for rendering.

use std::collections::BTreeMap;

use logscope_core::models::{JoinKey, JoinResult};
use logscope_core::stats::{AggregateBucket, Aggregation};

// ── Aggregator ────────────────────────────────────────────────────────────────

/// Mutable accumulation phase of an aggregation.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    buckets: BTreeMap<JoinKey, AggregateBucket>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one item into the bucket for `key`. A present metric becomes a
    /// sample; an absent one counts as missing.
    pub fn add(&mut self, key: JoinKey, metric: Option<f64>) {
        self.buckets
            .entry(key)
            .or_insert_with_key(|k| AggregateBucket::new(k.clone()))
            .record(metric);
    }

    /// Ensure a bucket exists even if nothing is routed to it.
    pub fn touch(&mut self, key: JoinKey) {
        self.buckets
            .entry(key)
            .or_insert_with_key(|k| AggregateBucket::new(k.clone()));
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// End accumulation.
    pub fn freeze(self) -> Aggregation {
        Aggregation::from_buckets(self.buckets)
    }
}

// ── Convenience entry points ──────────────────────────────────────────────────

/// Group `items` by `group_fn` with per-item metric `metric_fn`.
pub fn aggregate<T, G, M>(items: impl IntoIterator<Item = T>, group_fn: G, metric_fn: M) -> Aggregation
where
    G: Fn(&T) -> JoinKey,
    M: Fn(&T) -> Option<f64>,
{
    let mut agg = Aggregator::new();
    for item in items {
        agg.add(group_fn(&item), metric_fn(&item));
    }
    agg.freeze()
}

/// Count `items` per group without a metric.
pub fn count_by<T, G>(items: impl IntoIterator<Item = T>, group_fn: G) -> Aggregation
where
    G: Fn(&T) -> JoinKey,
{
    aggregate(items, group_fn, |_| None)
}

/// Group join results, using each result's metric as the sample.
pub fn aggregate_joins<G>(results: &[JoinResult], group_fn: G) -> Aggregation
where
    G: Fn(&JoinResult) -> JoinKey,
{
    aggregate(results.iter(), |r| group_fn(r), |r| r.metric)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use logscope_core::stats::Denominator;

    #[test]
    fn test_frame_delays_statistics() {
        let agg = aggregate([5.0, 6.0, 5.0], |_| JoinKey::default(), |d| Some(*d));
        assert_eq!(agg.len(), 1);
        let b = agg.get(&JoinKey::default()).unwrap();
        assert_eq!(b.total(), 3);
        assert_eq!(b.sample_count(), 3);
        assert!((b.mean().unwrap() - 5.333_333).abs() < 1e-6);
        assert_eq!(b.min(), Some(5.0));
        assert_eq!(b.max(), Some(6.0));

        let dist = b.distribution();
        assert_eq!((dist[0].value, dist[0].count), (5.0, 2));
        assert_eq!((dist[1].value, dist[1].count), (6.0, 1));
        assert!((dist[0].share.value() - 66.7).abs() < 0.05);
        assert!((dist[1].share.value() - 33.3).abs() < 0.05);
        assert_eq!(dist[0].share.denominator, Denominator::NonMissing);
    }

    #[test]
    fn test_missing_metrics_counted_separately() {
        let items = [("Server", Some(1.0)), ("Server", None), ("Client:1", None)];
        let agg = aggregate(items, |(p, _)| JoinKey::single(*p), |(_, m)| *m);
        let server = agg.get(&JoinKey::single("Server")).unwrap();
        assert_eq!(server.total(), 2);
        assert_eq!(server.missing(), 1);
        let client = agg.get(&JoinKey::single("Client:1")).unwrap();
        assert_eq!(client.mean(), None);
        assert_eq!(agg.total(), 3);
    }

    #[test]
    fn test_groups_iterate_in_key_order() {
        let agg = count_by(["b", "a", "c", "a"], |s| JoinKey::single(*s));
        let keys: Vec<String> = agg.iter().map(|b| b.key.to_string()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(agg.get(&JoinKey::single("a")).unwrap().total(), 2);
    }

    #[test]
    fn test_touch_creates_empty_bucket() {
        let mut agg = Aggregator::new();
        agg.touch(JoinKey::single("Server"));
        agg.add(JoinKey::single("Client:1"), Some(2.0));
        let frozen = agg.freeze();
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen.get(&JoinKey::single("Server")).unwrap().total(), 0);
    }

    #[test]
    fn test_aggregate_joins_uses_result_metric() {
        let results = vec![
            JoinResult {
                key: JoinKey::single(1_i64),
                left: None,
                right: None,
                metric: Some(4.0),
            },
            JoinResult {
                key: JoinKey::single(2_i64),
                left: None,
                right: None,
                metric: None,
            },
        ];
        let agg = aggregate_joins(&results, |_| JoinKey::default());
        let b = agg.get(&JoinKey::default()).unwrap();
        assert_eq!(b.total(), 2);
        assert_eq!(b.missing(), 1);
        assert_eq!(b.samples(), &[4.0]);
    }
}
