//! C3: chunk dispatcher (§4.3).
//!
//! Picks the next unstarted chunk based on proximity to already-completed chunks, which keeps
//! the CRF tracker's (C4) predictions relevant for whatever chunk is handed out next.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::chunk::Chunk;

#[derive(Default)]
struct State {
    ready: BTreeMap<usize, Chunk>,
    completed: BTreeSet<usize>,
}

/// Thread-safe; every method takes `&self`.
pub struct Dispatcher {
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        let ready = chunks.into_iter().map(|c| (c.idx, c)).collect();
        Self {
            state: Mutex::new(State {
                ready,
                completed: BTreeSet::new(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ready.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Returns the next chunk to dispatch, or `None` if `ready` is empty.
    pub fn next(&self) -> Option<Chunk> {
        let mut state = self.state.lock();

        let chosen_idx = if state.completed.is_empty() {
            // Sequential fallback: lowest idx.
            *state.ready.keys().next()?
        } else {
            let completed = &state.completed;
            state
                .ready
                .keys()
                .copied()
                .min_by_key(|idx| {
                    let distance = completed
                        .iter()
                        .map(|c| idx.abs_diff(*c))
                        .min()
                        .unwrap_or(usize::MAX);
                    (distance, *idx)
                })
                .expect("ready is non-empty")
        };

        state.ready.remove(&chosen_idx)
    }

    pub fn mark_complete(&self, idx: usize) {
        self.state.lock().completed.insert(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(idx: usize) -> Chunk {
        Chunk {
            idx,
            start: idx * 100,
            end: idx * 100 + 100,
        }
    }

    #[test]
    fn scenario_3_proximity_dispatch() {
        let d = Dispatcher::new([chunk(0), chunk(1), chunk(3), chunk(4)]);
        d.mark_complete(2);

        let first = d.next().unwrap();
        assert_eq!(first.idx, 1);

        d.mark_complete(1);
        let second = d.next().unwrap();
        assert_eq!(second.idx, 3);
    }

    #[test]
    fn sequential_fallback_when_nothing_completed() {
        let d = Dispatcher::new([chunk(5), chunk(2), chunk(9)]);
        assert_eq!(d.next().unwrap().idx, 2);
    }

    #[test]
    fn empty_dispatcher_returns_none() {
        let d = Dispatcher::new(std::iter::empty());
        assert!(d.next().is_none());
        assert!(d.is_empty());
    }

    #[test]
    fn ties_broken_by_lower_idx() {
        // completed={5}; ready={3,7} are both distance 2 away.
        let d = Dispatcher::new([chunk(7), chunk(3)]);
        d.mark_complete(5);
        assert_eq!(d.next().unwrap().idx, 3);
    }

    #[test]
    fn dispatched_chunk_is_removed_from_ready() {
        let d = Dispatcher::new([chunk(0), chunk(1)]);
        assert_eq!(d.remaining(), 2);
        d.next();
        assert_eq!(d.remaining(), 1);
    }
}
