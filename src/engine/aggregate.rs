use std::collections::HashMap;

use crate::store::RouteRow;

/// Identity of one route observation: who announced it and what.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    /// AS number of the BGP peer that sent the announcement.
    pub origin: u32,
    /// Announced prefix in CIDR notation.
    pub prefix: String,
}

impl ObservationKey {
    pub fn new(origin: u32, prefix: impl Into<String>) -> Self {
        Self {
            origin,
            prefix: prefix.into(),
        }
    }
}

/// Observation counts produced by decoding a single snapshot file.
pub type Contributions = HashMap<ObservationKey, u64>;

/// Adds one observation of `key` to a partial map.
#[inline]
pub fn observe(partial: &mut Contributions, key: ObservationKey) {
    let count = partial.entry(key).or_insert(0);
    *count = count.saturating_add(1);
}

/// Run-wide observation counts.
///
/// Counts only ever grow: merging sums per key and never replaces an
/// existing value, so the result does not depend on merge order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Aggregate {
    counts: HashMap<ObservationKey, u64>,
    observations: u64,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a partial map into the aggregate.
    pub fn merge(&mut self, partial: Contributions) {
        if self.counts.is_empty() {
            self.observations = partial.values().fold(0u64, |acc, v| acc.saturating_add(*v));
            self.counts = partial;
            return;
        }

        for (key, count) in partial {
            self.observations = self.observations.saturating_add(count);
            let existing = self.counts.entry(key).or_insert(0);
            *existing = existing.saturating_add(count);
        }
    }

    pub fn get(&self, key: &ObservationKey) -> Option<u64> {
        self.counts.get(key).copied()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counts merged so far.
    pub fn observations(&self) -> u64 {
        self.observations
    }

    /// Flattens into rows ordered by `(peer_as, route)`.
    pub fn into_rows(self) -> Vec<RouteRow> {
        let mut rows: Vec<RouteRow> = self
            .counts
            .into_iter()
            .map(|(key, count)| RouteRow {
                peer_as: key.origin,
                route: key.prefix,
                count,
            })
            .collect();

        rows.sort_unstable_by(|a, b| {
            a.peer_as
                .cmp(&b.peer_as)
                .then_with(|| a.route.cmp(&b.route))
        });
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(entries: &[(u32, &str, u64)]) -> Contributions {
        entries
            .iter()
            .map(|(origin, prefix, count)| (ObservationKey::new(*origin, *prefix), *count))
            .collect()
    }

    #[test]
    fn test_merge_sums_never_overwrites() {
        let mut agg = Aggregate::new();
        agg.merge(partial(&[(65001, "10.0.0.0/8", 3)]));
        agg.merge(partial(&[(65001, "10.0.0.0/8", 5)]));

        assert_eq!(agg.get(&ObservationKey::new(65001, "10.0.0.0/8")), Some(8));
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.observations(), 8);
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let parts = [
            partial(&[(1, "10.0.0.0/8", 3), (2, "192.0.2.0/24", 1)]),
            partial(&[(1, "10.0.0.0/8", 5)]),
            partial(&[(2, "192.0.2.0/24", 7), (3, "2001:db8::/32", 2)]),
        ];

        let mut forward = Aggregate::new();
        for p in parts.iter().cloned() {
            forward.merge(p);
        }

        let mut backward = Aggregate::new();
        for p in parts.iter().rev().cloned() {
            backward.merge(p);
        }

        assert_eq!(forward, backward);
        assert_eq!(forward.get(&ObservationKey::new(1, "10.0.0.0/8")), Some(8));
        assert_eq!(forward.get(&ObservationKey::new(2, "192.0.2.0/24")), Some(8));
    }

    #[test]
    fn test_merge_saturates() {
        let mut agg = Aggregate::new();
        agg.merge(partial(&[(1, "10.0.0.0/8", u64::MAX - 1)]));
        agg.merge(partial(&[(1, "10.0.0.0/8", 5)]));
        assert_eq!(agg.get(&ObservationKey::new(1, "10.0.0.0/8")), Some(u64::MAX));
    }

    #[test]
    fn test_observe_increments() {
        let mut p = Contributions::new();
        observe(&mut p, ObservationKey::new(7, "10.1.0.0/16"));
        observe(&mut p, ObservationKey::new(7, "10.1.0.0/16"));
        observe(&mut p, ObservationKey::new(8, "10.1.0.0/16"));
        assert_eq!(p.get(&ObservationKey::new(7, "10.1.0.0/16")), Some(&2));
        assert_eq!(p.get(&ObservationKey::new(8, "10.1.0.0/16")), Some(&1));
    }

    #[test]
    fn test_into_rows_sorted() {
        let mut agg = Aggregate::new();
        agg.merge(partial(&[
            (65002, "10.0.0.0/8", 1),
            (65001, "192.0.2.0/24", 2),
            (65001, "10.0.0.0/8", 3),
        ]));

        let rows = agg.into_rows();
        let keys: Vec<(u32, &str, u64)> = rows
            .iter()
            .map(|r| (r.peer_as, r.route.as_str(), r.count))
            .collect();
        assert_eq!(
            keys,
            vec![
                (65001, "10.0.0.0/8", 3),
                (65001, "192.0.2.0/24", 2),
                (65002, "10.0.0.0/8", 1),
            ]
        );
    }

    #[test]
    fn test_empty_aggregate_has_no_rows() {
        assert!(Aggregate::new().into_rows().is_empty());
    }
}
