//! Sample-window probing (§4.7), used by the TQ encoder pipeline to probe a short interior
//! slice of a long chunk instead of the whole thing.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleWindow {
    pub offset: usize,
    pub encode_frames: usize,
    pub warmup_frames: usize,
    pub measure_frames: usize,
}

const WARMUP_SECS: f64 = 0.5;

/// Decides whether a chunk is eligible for sample-window probing and, if so, computes the
/// window. Returns `None` when the chunk should be probed whole (either because it's too
/// short, or because the window wouldn't fit in half the chunk).
pub fn plan_sample_window(
    chunk_frames: usize,
    fps: f64,
    sample_dur_secs: f64,
    sample_min_chunk_secs: f64,
) -> Option<SampleWindow> {
    if fps <= 0.0 {
        return None;
    }
    let chunk_dur = chunk_frames as f64 / fps;
    if chunk_dur < sample_min_chunk_secs {
        return None;
    }

    let encode_frames = ((sample_dur_secs + WARMUP_SECS) * fps).round() as usize;
    if encode_frames == 0 || encode_frames as f64 > chunk_frames as f64 / 2.0 {
        return None;
    }

    let warmup_frames = (WARMUP_SECS * fps).round() as usize;
    let measure_frames = encode_frames.saturating_sub(warmup_frames);

    let half = chunk_frames as f64 / 2.0 - encode_frames as f64 / 2.0;
    let max_offset = chunk_frames.saturating_sub(encode_frames);
    let offset = half.max(0.0).round() as usize;
    let offset = offset.min(max_offset);

    Some(SampleWindow {
        offset,
        encode_frames,
        warmup_frames,
        measure_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_6_sample_window_fits() {
        let w = plan_sample_window(720, 24.0, 3.0, 6.0).unwrap();
        assert_eq!(w.encode_frames, 84);
        assert_eq!(w.warmup_frames, 12);
        assert_eq!(w.measure_frames, 72);
        assert_eq!(w.offset, 318);
    }

    #[test]
    fn scenario_6_sample_window_disabled_for_short_chunk() {
        // 120 frames at 24 fps = 5s chunk, sample_min_chunk = 6s -> disabled.
        let w = plan_sample_window(120, 24.0, 3.0, 6.0);
        assert!(w.is_none());
    }

    #[test]
    fn invalid_fps_disables_sampling() {
        assert!(plan_sample_window(720, 0.0, 3.0, 6.0).is_none());
    }

    #[test]
    fn window_larger_than_half_chunk_disables_sampling() {
        // chunk of 100 frames, requesting a ~10s sample at 24fps = 252 encode_frames, way
        // more than half the chunk.
        assert!(plan_sample_window(100, 24.0, 10.0, 1.0).is_none());
    }

    #[test]
    fn offset_clamped_within_bounds() {
        let w = plan_sample_window(200, 24.0, 3.0, 1.0).unwrap();
        assert!(w.offset + w.encode_frames <= 200);
    }
}
