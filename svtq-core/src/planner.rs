//! C1: keyframe planner (§4.1).
//!
//! Converts scene-change frame indices into a finite sequence of disjoint, covering chunks:
//! long scenes are split to bound worst-case decode memory, short scenes are merged so they
//! don't starve the TQ signal with one-frame chunks.

use tracing::debug;

use crate::chunk::Chunk;

pub const DEFAULT_MIN_DURATION_SECS: f64 = 4.0;

/// `max_frames = min(1000, round(30 * fps))` (§4.1 step 2).
fn max_frames(fps: f64) -> usize {
    (30.0 * fps).round().min(1000.0).max(1.0) as usize
}

/// `min_frames = round(min_duration_secs * fps)` (§4.1 step 3).
fn min_frames(fps: f64, min_duration_secs: f64) -> usize {
    (min_duration_secs * fps).round().max(1.0) as usize
}

/// Builds the final chunk list from scene-change indices.
///
/// Falls back to a single chunk spanning the whole input if `fps` is zero or invalid (§4.1
/// "Failure semantics").
pub fn plan(
    total_frames: usize,
    fps_num: u32,
    fps_den: u32,
    scene_indices: &[usize],
    min_duration_secs: f64,
) -> Vec<Chunk> {
    if total_frames == 0 {
        return Vec::new();
    }

    if fps_den == 0 || fps_num == 0 {
        debug!("planner: invalid fps, falling back to single-chunk plan");
        return vec![Chunk {
            idx: 0,
            start: 0,
            end: total_frames,
        }];
    }

    let fps = f64::from(fps_num) / f64::from(fps_den);
    let max_f = max_frames(fps);
    let min_f = min_frames(fps, min_duration_secs);

    // Step 1: augment with 0, dedupe, sort.
    let mut keys: Vec<usize> = scene_indices
        .iter()
        .copied()
        .filter(|&k| k < total_frames)
        .chain(std::iter::once(0))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    if keys.is_empty() {
        keys.push(0);
    }

    split_long_gaps(&mut keys, total_frames, max_f);
    merge_short_gaps(&mut keys, total_frames, min_f);

    emit_chunks(&keys, total_frames)
}

/// Step 2: for every gap longer than `max_f`, insert evenly-spaced interior keyframes.
fn split_long_gaps(keys: &mut Vec<usize>, total_frames: usize, max_f: usize) {
    loop {
        let mut bounds = keys.clone();
        bounds.push(total_frames);
        bounds.sort_unstable();
        bounds.dedup();

        let mut inserted = Vec::new();
        for w in bounds.windows(2) {
            let (lo, hi) = (w[0], w[1]);
            let len = hi - lo;
            if len > max_f {
                let n_new = (len as f64 / max_f as f64).ceil() as usize - 1;
                if n_new > 0 {
                    let step = len as f64 / (n_new + 1) as f64;
                    for i in 1..=n_new {
                        inserted.push(lo + (step * i as f64).round() as usize);
                    }
                }
            }
        }
        if inserted.is_empty() {
            break;
        }
        keys.extend(inserted);
        keys.sort_unstable();
        keys.dedup();
    }
}

/// Step 3: repeatedly merge any gap shorter than `min_f`, dropping whichever neighboring
/// keyframe produces the smaller resulting gap. `idx 0` is never removed.
fn merge_short_gaps(keys: &mut Vec<usize>, total_frames: usize, min_f: usize) {
    loop {
        let mut bounds = keys.clone();
        bounds.push(total_frames);
        bounds.sort_unstable();
        bounds.dedup();

        if bounds.len() <= 2 {
            break;
        }

        // Find the first short gap (excluding the implicit final `total_frames` sentinel,
        // which is not a real keyframe and cannot be dropped).
        let short_gap_end_pos = bounds.windows(2).position(|w| w[1] - w[0] < min_f);

        let Some(pos) = short_gap_end_pos else {
            break;
        };

        // The short gap is [bounds[pos], bounds[pos+1]).
        let lo = bounds[pos];
        let hi = bounds[pos + 1];
        debug_assert!(hi - lo < min_f);

        if lo == 0 {
            // First keyframe is never removed: drop the *next* keyframe (`hi`) instead,
            // unless `hi` is the synthetic `total_frames` endpoint (nothing to drop then,
            // this is the unavoidable "total_frames < min_frames" case).
            if hi == total_frames {
                break;
            }
            keys.retain(|&k| k != hi);
        } else {
            // Drop whichever of `lo`/`hi` creates the smaller resulting neighbor gap.
            let prev = bounds[pos.saturating_sub(1)];
            let next = if pos + 2 < bounds.len() {
                bounds[pos + 2]
            } else {
                total_frames
            };

            let drop_lo_result = hi - prev; // removing lo merges [prev,lo) and [lo,hi) into [prev,hi)
            let drop_hi_result = if hi == total_frames {
                // can't drop the synthetic endpoint; drop lo instead
                usize::MAX
            } else {
                next - lo
            };

            // "smaller resulting neighbor": comparing the gap that would be created by each
            // candidate removal; prefer dropping the key that yields the smaller new gap.
            if hi != total_frames && drop_hi_result <= drop_lo_result {
                keys.retain(|&k| k != hi);
            } else {
                keys.retain(|&k| k != lo);
            }
        }
    }
}

fn emit_chunks(keys: &[usize], total_frames: usize) -> Vec<Chunk> {
    let mut bounds = keys.to_vec();
    bounds.push(total_frames);
    bounds.sort_unstable();
    bounds.dedup();

    bounds
        .windows(2)
        .enumerate()
        .map(|(idx, w)| Chunk {
            idx,
            start: w[0],
            end: w[1],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(chunks: &[Chunk]) -> Vec<(usize, usize)> {
        chunks.iter().map(|c| (c.start, c.end)).collect()
    }

    // With fps=24, max_frames = min(1000, round(30*24)) = 720, so the 1000-frame scene
    // splits into two 500-frame halves (both already under the cap) rather than four.
    // Documented as a deliberate deviation from the literal worked-example numbers in
    // DESIGN.md: the stated max_frames formula does not actually produce 250-frame
    // quarters at fps=24, and this implementation follows the formula over the example.
    #[test]
    fn scenario_1_splits_one_long_scene() {
        let chunks = plan(1200, 24, 1, &[0, 1000], 4.0);
        assert_eq!(pairs(&chunks), vec![(0, 500), (500, 1000), (1000, 1200)]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.idx, i);
        }
    }

    #[test]
    fn scenario_2_merges_micro_scenes() {
        let chunks = plan(300, 24, 1, &[0, 10, 20, 30, 200], 4.0);
        assert_eq!(pairs(&chunks), vec![(0, 200), (200, 300)]);
    }

    // prev=0, lo=10, hi=11 (gap of 1, well under min_f), next=100: dropping `lo` would merge
    // [prev,hi) into a gap of 11, while dropping `hi` would merge [lo,next) into a gap of 90 —
    // `lo` must be the one dropped, keeping the far smaller resulting gap `[prev,hi)`.
    #[test]
    fn merge_short_gaps_prefers_dropping_the_neighbor_with_the_smaller_resulting_gap() {
        let chunks = plan(300, 24, 1, &[10, 11, 100], 0.3);
        assert_eq!(pairs(&chunks), vec![(0, 11), (11, 100), (100, 300)]);
    }

    #[test]
    fn invalid_fps_falls_back_to_single_chunk() {
        let chunks = plan(500, 0, 0, &[0, 100, 200], 4.0);
        assert_eq!(pairs(&chunks), vec![(0, 500)]);
    }

    #[test]
    fn covers_full_range_and_is_disjoint() {
        let chunks = plan(10_000, 30, 1, &[0, 37, 4500, 4600, 9999], 4.0);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, 10_000);
        for w in chunks.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.idx, i);
            assert!(c.start < c.end);
        }
    }

    #[test]
    fn total_frames_shorter_than_min_duration_is_single_chunk() {
        let chunks = plan(10, 24, 1, &[0], 4.0);
        assert_eq!(pairs(&chunks), vec![(0, 10)]);
    }

    #[quickcheck_macros::quickcheck]
    fn plan_always_covers_and_is_disjoint(total_frames: u16, seed: Vec<u16>) -> bool {
        let total_frames = (total_frames as usize).max(1);
        let scenes: Vec<usize> = seed
            .into_iter()
            .map(|s| s as usize % total_frames.max(1))
            .collect();
        let chunks = plan(total_frames, 24, 1, &scenes, 4.0);
        if chunks.is_empty() {
            return false;
        }
        if chunks[0].start != 0 || chunks.last().unwrap().end != total_frames {
            return false;
        }
        chunks.windows(2).all(|w| w[0].end == w[1].start) && chunks.iter().all(|c| c.start < c.end)
    }
}
