//! C4: CRF tracker (§4.4).
//!
//! Remembers the final CRF of each completed chunk and predicts a starting CRF for a new
//! chunk as the distance-weighted mean of up to four nearest completions. This scalar
//! prediction narrows the TQ search bounds (§4.8).

use std::collections::BTreeMap;

use parking_lot::Mutex;

pub struct CrfTracker {
    records: Mutex<BTreeMap<usize, f64>>,
}

impl Default for CrfTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CrfTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record(&self, idx: usize, crf: f64) {
        self.records.lock().insert(idx, crf);
    }

    /// (iii) A zero-distance neighbor (an exact hit) returns that neighbor's CRF outright,
    /// even if it was recorded long ago in dispatch order. See DESIGN.md for why this
    /// implementation keeps that behavior rather than decaying by recency.
    pub fn predict(&self, idx: usize, default_crf: f64) -> f64 {
        let records = self.records.lock();

        if records.is_empty() {
            return default_crf;
        }
        if let Some(&exact) = records.get(&idx) {
            return exact;
        }

        let mut by_distance: Vec<(usize, f64)> = records
            .iter()
            .map(|(&i, &crf)| (idx.abs_diff(i), crf))
            .collect();
        by_distance.sort_by_key(|(dist, _)| *dist);
        by_distance.truncate(4);

        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for (dist, crf) in by_distance {
            let weight = 1.0 / dist as f64;
            weighted_sum += crf * weight;
            weight_sum += weight;
        }
        weighted_sum / weight_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_records_returns_default() {
        let tracker = CrfTracker::new();
        assert_eq!(tracker.predict(5, 28.0), 28.0);
    }

    #[test]
    fn exact_hit_returns_recorded_value() {
        let tracker = CrfTracker::new();
        tracker.record(5, 22.0);
        assert_eq!(tracker.predict(5, 28.0), 22.0);
    }

    #[test]
    fn scenario_4_distance_weighted_prediction() {
        let tracker = CrfTracker::new();
        tracker.record(4, 20.0);
        tracker.record(10, 30.0);

        let predicted = tracker.predict(5, 28.0);
        assert!((predicted - 21.666_666_666_666_668).abs() < 1e-9);
    }

    #[test]
    fn caps_at_four_nearest_neighbors() {
        let tracker = CrfTracker::new();
        // Five neighbors equidistant from idx=100 at increasing distance; only the nearest
        // four (distance 1..=4) should participate, so a far outlier at distance 100 must
        // not move the result.
        tracker.record(99, 20.0);
        tracker.record(98, 20.0);
        tracker.record(97, 20.0);
        tracker.record(96, 20.0);
        tracker.record(0, 1000.0);

        let predicted = tracker.predict(100, 28.0);
        assert!((predicted - 20.0).abs() < 1e-9);
    }
}
