//! External perceptual-metric processor (§6 "External perceptual-metric processor").
//!
//! One `MetricProcessor` is lazily initialized per metric worker (§4.7), configured once from
//! the source color metadata, then called once per probe to score a source/distorted plane
//! pair. The metric library itself is external (an FFI binding); this module only owns the
//! Rust-side handle lifecycle and the trait seam so the TQ pipeline doesn't care which metric
//! implementation is linked in.

use std::ffi::c_void;
use std::ptr;

use crate::chunk::ColorMeta;

#[derive(Debug, Clone, Copy)]
pub struct PlaneTriple<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    pub stride_y: usize,
    pub stride_uv: usize,
}

/// Implemented once for the linked metric library; a mock implementation backs tests.
pub trait MetricProcessor: Send {
    fn score(&mut self, source: PlaneTriple<'_>, distorted: PlaneTriple<'_>) -> Result<f64, MetricError>;
}

#[derive(Debug, thiserror::Error)]
#[error("metric processor error: {0}")]
pub struct MetricError(pub String);

#[repr(C)]
#[derive(Copy, Clone)]
struct Ssimulacra2Handle {
    id: i64,
}

#[allow(non_snake_case)]
unsafe extern "C" {
    fn Ssimulacra2_Init(
        handler: *mut Ssimulacra2Handle,
        width: i32,
        height: i32,
        bit_depth: i32,
        matrix: i32,
        transfer: i32,
        primaries: i32,
        chroma_location: i32,
    ) -> i32;
    fn Ssimulacra2_Free(handler: Ssimulacra2Handle);
    fn Ssimulacra2_ComputeUint16(
        handler: Ssimulacra2Handle,
        score: *mut f64,
        src_planes: *const *const u8,
        src_strides: *const i64,
        dst_planes: *const *const u8,
        dst_strides: *const i64,
    ) -> i32;
}

/// Maps `ColorMeta`'s loosely-typed string fields onto the small integer enums the metric FFI
/// expects. Falls back to "unspecified" (value 2, matching AV1's CICP convention) when absent
/// or unrecognized.
fn cicp_value(field: Option<&str>) -> i32 {
    field.and_then(|s| s.parse::<i32>().ok()).unwrap_or(2)
}

pub struct Ssimulacra2Processor {
    handle: Ssimulacra2Handle,
}

impl Ssimulacra2Processor {
    pub fn new(width: u32, height: u32, color: &ColorMeta) -> Result<Self, MetricError> {
        let mut handle = Ssimulacra2Handle { id: 0 };
        let ret = unsafe {
            Ssimulacra2_Init(
                ptr::from_mut(&mut handle),
                width as i32,
                height as i32,
                10,
                cicp_value(color.matrix.as_deref()),
                cicp_value(color.transfer.as_deref()),
                cicp_value(color.primaries.as_deref()),
                cicp_value(color.chroma_sample_position.as_deref()),
            )
        };
        if ret != 0 {
            return Err(MetricError(format!("ssimulacra2 init failed with code {ret}")));
        }
        Ok(Self { handle })
    }
}

impl MetricProcessor for Ssimulacra2Processor {
    fn score(&mut self, source: PlaneTriple<'_>, distorted: PlaneTriple<'_>) -> Result<f64, MetricError> {
        let src_planes: [*const u8; 3] = [source.y.as_ptr(), source.u.as_ptr(), source.v.as_ptr()];
        let dst_planes: [*const u8; 3] = [distorted.y.as_ptr(), distorted.u.as_ptr(), distorted.v.as_ptr()];
        let src_strides = [
            source.stride_y as i64,
            source.stride_uv as i64,
            source.stride_uv as i64,
        ];
        let dst_strides = [
            distorted.stride_y as i64,
            distorted.stride_uv as i64,
            distorted.stride_uv as i64,
        ];

        let mut score = 0.0_f64;
        let ret = unsafe {
            Ssimulacra2_ComputeUint16(
                self.handle,
                ptr::from_mut(&mut score),
                src_planes.as_ptr(),
                src_strides.as_ptr(),
                dst_planes.as_ptr(),
                dst_strides.as_ptr(),
            )
        };
        if ret != 0 {
            return Err(MetricError(format!("ssimulacra2 compute failed with code {ret}")));
        }
        Ok(score)
    }
}

impl Drop for Ssimulacra2Processor {
    fn drop(&mut self) {
        unsafe { Ssimulacra2_Free(self.handle) };
    }
}

unsafe impl Send for Ssimulacra2Processor {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricMode {
    Mean,
    /// Nth percentile of per-frame scores, e.g. p5.
    Percentile(u8),
}

/// Reduces per-frame scores to a single chunk score per the configured `MetricMode`
/// (§6 "metric mode (mean or pN)").
pub fn reduce_scores(scores: &[f64], mode: MetricMode) -> f64 {
    assert!(!scores.is_empty(), "reduce_scores requires at least one frame score");
    match mode {
        MetricMode::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
        MetricMode::Percentile(p) => {
            let mut sorted = scores.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let rank = (f64::from(p) / 100.0 * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_reduction() {
        let v = reduce_scores(&[60.0, 70.0, 80.0], MetricMode::Mean);
        assert!((v - 70.0).abs() < 1e-9);
    }

    #[test]
    fn p5_reduction_picks_low_tail() {
        let scores: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let v = reduce_scores(&scores, MetricMode::Percentile(5));
        assert!((v - 5.0).abs() < 1.0);
    }

    #[test]
    fn cicp_value_falls_back_to_unspecified() {
        assert_eq!(cicp_value(None), 2);
        assert_eq!(cicp_value(Some("not-a-number")), 2);
        assert_eq!(cicp_value(Some("9")), 9);
    }

    struct MockMetric;
    impl MetricProcessor for MockMetric {
        fn score(&mut self, _source: PlaneTriple<'_>, _distorted: PlaneTriple<'_>) -> Result<f64, MetricError> {
            Ok(42.0)
        }
    }

    #[test]
    fn trait_object_is_usable() {
        let mut m: Box<dyn MetricProcessor> = Box::new(MockMetric);
        let buf = [0u8; 4];
        let plane = PlaneTriple {
            y: &buf,
            u: &buf,
            v: &buf,
            stride_y: 2,
            stride_uv: 1,
        };
        assert_eq!(m.score(plane, plane).unwrap(), 42.0);
    }
}
