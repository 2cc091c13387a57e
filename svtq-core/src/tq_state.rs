//! C8: TQ search state machine (§4.8).
//!
//! One `TqState` lives per chunk under target-quality search. `next_crf` picks the CRF to
//! probe this round; `update_bounds` narrows (or expands) the search window from the result;
//! `should_complete` decides whether to stop. The interpolation strategy escalates with the
//! round number and always falls back to the binary-search midpoint when the richer method
//! isn't supported by the probe history yet (§9).

use crate::chunk::Probe;
use crate::interp;

#[derive(Debug, Clone, Copy)]
pub struct TqConfig {
    pub qp_min: f64,
    pub qp_max: f64,
    pub target: f64,
    pub tolerance: f64,
    pub max_rounds: u32,
}

#[derive(Debug, Clone)]
pub struct TqState {
    pub probes: Vec<Probe>,
    pub search_min: f64,
    pub search_max: f64,
    pub qp_min: f64,
    pub qp_max: f64,
    pub round: u32,
    pub target: f64,
    pub tolerance: f64,
    pub max_rounds: u32,
    pub last_crf: f64,
    exhausted: bool,
}

pub enum Completion<'a> {
    Continue,
    Complete { best: &'a Probe },
}

impl TqState {
    /// Initial bounds from the CRF tracker's prediction (§4.8 "Initial bounds").
    /// `predicted_crf <= 0.0` means "no prediction available".
    pub fn new(cfg: TqConfig, predicted_crf: f64) -> Self {
        let (search_min, search_max) = if predicted_crf > 0.0 {
            (
                (predicted_crf - 5.0).max(cfg.qp_min),
                (predicted_crf + 5.0).min(cfg.qp_max),
            )
        } else {
            (cfg.qp_min, cfg.qp_max)
        };

        Self {
            probes: Vec::new(),
            search_min,
            search_max,
            qp_min: cfg.qp_min,
            qp_max: cfg.qp_max,
            round: 0,
            target: cfg.target,
            tolerance: cfg.tolerance,
            max_rounds: cfg.max_rounds,
            last_crf: 0.0,
            exhausted: false,
        }
    }

    /// Sorted `(score, crf)` history, required by every interpolation method.
    fn history_by_score(&self) -> Vec<(f64, f64)> {
        let mut pts: Vec<(f64, f64)> = self.probes.iter().map(|p| (p.score, p.crf)).collect();
        pts.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        pts
    }

    /// `NextCRF(state)` (§4.8). Advances `round`, picks a CRF, clamps and rounds it, and
    /// records it as `last_crf`.
    pub fn next_crf(&mut self) -> f64 {
        self.round += 1;

        let predicted = if self.round <= 2 {
            ((self.search_min + self.search_max) / 2.0).round()
        } else {
            let history = self.history_by_score();
            let interpolated = match self.round {
                3 => interp::lerp(&history, self.target),
                4 => interp::monotone_cubic(&history, self.target),
                5 => interp::pchip(&history, self.target),
                _ => interp::akima(&history, self.target),
            };
            interpolated
                .map(f64::round)
                .unwrap_or_else(|| ((self.search_min + self.search_max) / 2.0).round())
        };

        let clamped = predicted.clamp(self.search_min, self.search_max);
        self.last_crf = clamped;
        clamped
    }

    /// `UpdateBounds(state, score, target, tolerance)` (§4.8).
    pub fn update_bounds(&mut self, score: f64) {
        if score < self.target - self.tolerance {
            // Quality too low: decrease CRF (increase quality next round).
            self.search_max = self.last_crf - 1.0;
        } else if score > self.target + self.tolerance {
            // Quality too high: increase CRF (decrease quality next round).
            self.search_min = self.last_crf + 1.0;
        }

        if self.search_min > self.search_max {
            if self.search_min <= self.qp_min && self.search_max >= self.qp_max {
                // Unreachable in practice (bounds can't simultaneously be beyond both hard
                // limits while crossed), kept for symmetry with the spec's phrasing.
                self.exhausted = true;
            } else if (self.search_min - self.qp_min).abs() < f64::EPSILON
                && (self.search_max - self.qp_max).abs() < f64::EPSILON
            {
                self.exhausted = true;
            } else {
                // Bounded expansion toward the hard limits, up to 5 away from last_crf
                // (Open Question (i), resolved toward the newer/bounded-expansion behavior
                // per spec.md §9; see DESIGN.md).
                self.search_min = (self.last_crf - 5.0).max(self.qp_min);
                self.search_max = (self.last_crf + 5.0).min(self.qp_max);
                if self.search_min > self.search_max {
                    self.exhausted = true;
                }
            }
        }
    }

    fn closest_to_target(&self) -> Option<&Probe> {
        self.probes.iter().min_by(|a, b| {
            let da = (a.score - self.target).abs();
            let db = (b.score - self.target).abs();
            // Tie-break: higher score (better quality) wins.
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        })
    }

    /// `ShouldComplete(state, score, cfg)` (§4.8). Must be called after `update_bounds` with
    /// the same score, and only after the latest probe has been pushed to `self.probes`.
    pub fn should_complete(&self, score: f64) -> Completion<'_> {
        if (score - self.target).abs() <= self.tolerance {
            return Completion::Complete {
                best: self.probes.last().expect("a probe was just recorded"),
            };
        }
        if self.round >= self.max_rounds {
            return Completion::Complete {
                best: self.closest_to_target().expect("non-empty probe history"),
            };
        }
        if self.exhausted {
            return Completion::Complete {
                best: self.closest_to_target().expect("non-empty probe history"),
            };
        }
        Completion::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TqConfig {
        TqConfig {
            qp_min: 8.0,
            qp_max: 48.0,
            target: 72.5,
            tolerance: 2.5,
            max_rounds: 20,
        }
    }

    fn probe(crf: f64, score: f64) -> Probe {
        Probe {
            crf,
            score,
            per_frame_scores: Vec::new(),
            size_bytes: 0,
        }
    }

    #[test]
    fn scenario_5_tq_convergence() {
        let mut state = TqState::new(cfg(), 0.0);

        let crf1 = state.next_crf();
        assert_eq!(crf1, 28.0);
        state.update_bounds(65.0);
        state.probes.push(probe(crf1, 65.0));
        assert!(matches!(state.should_complete(65.0), Completion::Continue));
        assert_eq!(state.search_max, 27.0);

        let crf2 = state.next_crf();
        assert_eq!(crf2, 18.0);
        state.update_bounds(80.0);
        state.probes.push(probe(crf2, 80.0));
        assert!(matches!(state.should_complete(80.0), Completion::Continue));
        assert_eq!(state.search_min, 19.0);

        let crf3 = state.next_crf();
        assert_eq!(crf3, 23.0);
        state.update_bounds(72.0);
        state.probes.push(probe(crf3, 72.0));
        match state.should_complete(72.0) {
            Completion::Complete { best } => {
                assert_eq!(best.crf, 23.0);
                assert_eq!(best.score, 72.0);
            }
            Completion::Continue => panic!("expected convergence"),
        }
        assert_eq!(state.round, 3);
    }

    #[test]
    fn rounds_1_and_2_are_binary_search_midpoints() {
        let mut state = TqState::new(cfg(), 0.0);
        assert_eq!(state.next_crf(), 28.0);
        state.probes.push(probe(28.0, 50.0));
        state.update_bounds(50.0);
        assert_eq!(state.round, 1);
    }

    #[test]
    fn predicted_crf_narrows_initial_bounds() {
        let state = TqState::new(cfg(), 25.0);
        assert_eq!(state.search_min, 20.0);
        assert_eq!(state.search_max, 30.0);
    }

    #[test]
    fn predicted_crf_clamped_to_hard_limits() {
        let state = TqState::new(cfg(), 10.0);
        assert_eq!(state.search_min, 8.0);
        assert_eq!(state.search_max, 15.0);
    }

    #[test]
    fn max_rounds_forces_completion_at_closest_probe() {
        let mut cfg = cfg();
        cfg.max_rounds = 1;
        let mut state = TqState::new(cfg, 0.0);
        let crf = state.next_crf();
        state.probes.push(probe(crf, 60.0));
        state.update_bounds(60.0);
        match state.should_complete(60.0) {
            Completion::Complete { best } => assert_eq!(best.crf, crf),
            Completion::Continue => panic!("round >= max_rounds must complete"),
        }
    }

    #[test]
    fn tie_break_prefers_higher_score() {
        let mut state = TqState::new(cfg(), 0.0);
        state.probes.push(probe(20.0, 70.0)); // |70-72.5|=2.5
        state.probes.push(probe(25.0, 75.0)); // |75-72.5|=2.5, tie -> higher score wins
        let best = state.closest_to_target().unwrap();
        assert_eq!(best.score, 75.0);
    }
}
