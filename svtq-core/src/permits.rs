//! C5: permit controller (§4.5).
//!
//! Computes a memory-bounded `max_in_flight` cap at session start and enforces it at runtime
//! with a counting semaphore plus a ramp-up schedule that grows the effective limit from 2 as
//! early chunks complete, so the CRF tracker has data before the pool runs full.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

/// How often a blocked `wait_for_slot` wakes up to re-check the cancellation flag, since the
/// only other wakeup source is a completion signal that may never arrive if every in-flight
/// chunk is itself stuck (§5 "every stage stops reading its input channel and returns promptly").
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// `encoder_overhead ≈ 1 GiB` per concurrent encoder process (§4.5 step 2).
const ENCODER_OVERHEAD_BYTES: u64 = 1024 * 1024 * 1024;

/// `usable_fraction ≈ 0.5` (§4.5 step 4).
const USABLE_FRACTION: f64 = 0.5;

pub struct PermitInputs {
    pub workers: usize,
    pub chunk_buffer: usize,
    /// `true` for TQ sessions: `base = workers` rather than `workers + chunk_buffer`.
    pub is_tq: bool,
    pub width: u32,
    pub height: u32,
    pub avg_frames_per_chunk: u64,
    /// `None` means "unobtainable" (§4.5 step 3: cap permits to 1).
    pub available_memory_bytes: Option<u64>,
}

/// Computes `max_in_flight` (§4.5). Always returns at least 1.
pub fn compute_max_in_flight(inputs: &PermitInputs) -> usize {
    let base = if inputs.is_tq {
        inputs.workers
    } else {
        inputs.workers + inputs.chunk_buffer
    };

    let Some(available) = inputs.available_memory_bytes else {
        return 1;
    };

    let frame_size = u64::from(inputs.width) * u64::from(inputs.height) * 3;
    let per_chunk_memory = frame_size * inputs.avg_frames_per_chunk + ENCODER_OVERHEAD_BYTES;

    if per_chunk_memory == 0 {
        return base.max(1);
    }

    let memory_cap = ((USABLE_FRACTION * available as f64) / per_chunk_memory as f64).floor();
    let memory_cap = if memory_cap.is_finite() && memory_cap >= 0.0 {
        memory_cap as usize
    } else {
        0
    };

    base.min(memory_cap).max(1)
}

/// The runtime semaphore plus ramp-up schedule described in §4.5.
///
/// Acquisition blocks (via `acquire`) until a permit is free *and* the ramp limit allows
/// another in-flight chunk; release happens exactly once per chunk, on every path
/// (success, error, cancellation), per the exactness guarantee in §5.
pub struct PermitController {
    max_in_flight: usize,
    ramp_limit: AtomicUsize,
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
}

impl PermitController {
    pub fn new(max_in_flight: usize) -> Self {
        let (signal_tx, signal_rx) = bounded(max_in_flight.max(1));
        Self {
            max_in_flight: max_in_flight.max(1),
            ramp_limit: AtomicUsize::new(2.min(max_in_flight.max(1))),
            dispatched: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            signal_tx,
            signal_rx,
        }
    }

    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Blocks until `dispatched - completed < ramp_limit`, or until `cancelled` is set.
    /// Returns `false` if it returned because of cancellation rather than a free slot — the
    /// caller must not dispatch in that case. Called by the decoder loop before dispatching
    /// the next chunk.
    pub fn wait_for_slot(&self, cancelled: &AtomicBool) -> bool {
        loop {
            if cancelled.load(Ordering::SeqCst) {
                return false;
            }
            let in_flight =
                self.dispatched.load(Ordering::SeqCst) - self.completed.load(Ordering::SeqCst);
            if in_flight < self.ramp_limit.load(Ordering::SeqCst) {
                return true;
            }
            // Block on a completion signal rather than busy-spinning, waking periodically to
            // notice cancellation even if no chunk ever completes.
            let _ = self.signal_rx.recv_timeout(CANCEL_POLL_INTERVAL);
        }
    }

    pub fn on_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    /// Bumps the ramp limit by 2 (capped at `max_in_flight`) and wakes any waiter.
    pub fn on_complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        let prev = self
            .ramp_limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |limit| {
                if limit < self.max_in_flight {
                    Some((limit + 2).min(self.max_in_flight))
                } else {
                    None
                }
            });
        if let Ok(new_limit) = prev {
            debug!(ramp_limit = new_limit + 2, "permit ramp-up");
        }
        let _ = self.signal_tx.try_send(());
    }

    /// At a quiescent point after completion, `dispatched == completed` (§8 "Permit
    /// accounting").
    pub fn is_quiescent(&self) -> bool {
        self.dispatched.load(Ordering::SeqCst) == self.completed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_7_permit_cap_by_memory() {
        let inputs = PermitInputs {
            workers: 8,
            chunk_buffer: 4,
            is_tq: false,
            width: 3840,
            height: 2160,
            avg_frames_per_chunk: 720,
            available_memory_bytes: Some(16 * 1024 * 1024 * 1024),
        };
        assert_eq!(compute_max_in_flight(&inputs), 1);
    }

    #[test]
    fn base_cap_wins_when_memory_is_plentiful() {
        let inputs = PermitInputs {
            workers: 4,
            chunk_buffer: 2,
            is_tq: false,
            width: 320,
            height: 240,
            avg_frames_per_chunk: 100,
            available_memory_bytes: Some(u64::MAX / 4),
        };
        assert_eq!(compute_max_in_flight(&inputs), 6);
    }

    #[test]
    fn unobtainable_memory_caps_to_one() {
        let inputs = PermitInputs {
            workers: 8,
            chunk_buffer: 4,
            is_tq: false,
            width: 1920,
            height: 1080,
            avg_frames_per_chunk: 240,
            available_memory_bytes: None,
        };
        assert_eq!(compute_max_in_flight(&inputs), 1);
    }

    #[test]
    fn tq_base_excludes_chunk_buffer() {
        let inputs = PermitInputs {
            workers: 4,
            chunk_buffer: 100,
            is_tq: true,
            width: 320,
            height: 240,
            avg_frames_per_chunk: 100,
            available_memory_bytes: Some(u64::MAX / 4),
        };
        assert_eq!(compute_max_in_flight(&inputs), 4);
    }

    #[test]
    fn ramp_up_increments_by_two_until_cap() {
        let ctrl = PermitController::new(5);
        assert_eq!(ctrl.ramp_limit.load(Ordering::SeqCst), 2);
        ctrl.on_dispatch();
        ctrl.on_complete();
        assert_eq!(ctrl.ramp_limit.load(Ordering::SeqCst), 4);
        ctrl.on_dispatch();
        ctrl.on_complete();
        assert_eq!(ctrl.ramp_limit.load(Ordering::SeqCst), 5);
        ctrl.on_dispatch();
        ctrl.on_complete();
        assert_eq!(ctrl.ramp_limit.load(Ordering::SeqCst), 5);
        assert!(ctrl.is_quiescent());
    }

    #[test]
    fn ramp_up_is_noop_when_max_is_one() {
        let ctrl = PermitController::new(1);
        assert_eq!(ctrl.ramp_limit.load(Ordering::SeqCst), 1);
    }
}
