//! The data model shared by every pipeline stage (§3).

use serde::{Deserialize, Serialize};

/// A contiguous, half-open frame range: `[start, end)`.
///
/// Invariants enforced by the planner (§4.1): `start < end`; chunks are disjoint; their union
/// equals `[0, total_frames)`; `idx` is dense and zero-based in planner order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub idx: usize,
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    pub const fn frames(&self) -> usize {
        self.end - self.start
    }

    /// Zero-padded file stem, e.g. `00007`. `pad_width` should come from
    /// [`padding_width_for`] so lexicographic sort matches `idx` order (§6).
    pub fn name(&self, pad_width: usize) -> String {
        format!("{:0width$}", self.idx, width = pad_width)
    }

    pub fn final_filename(&self, pad_width: usize) -> String {
        format!("{}.ivf", self.name(pad_width))
    }

    pub fn probe_filename(&self, pad_width: usize, crf: u32) -> String {
        format!("{}_{crf}.ivf", self.name(pad_width))
    }
}

/// The padding width needed for the largest chunk index plus one (§6 "Per-chunk file naming").
pub fn padding_width_for(chunk_count: usize) -> usize {
    if chunk_count == 0 {
        return 1;
    }
    let largest = chunk_count - 1;
    largest.to_string().len().max(1)
}

/// Optional color metadata forwarded from the source through to the encoder and metric
/// processor, never interpreted by the core pipeline itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorMeta {
    pub primaries: Option<String>,
    pub transfer: Option<String>,
    pub matrix: Option<String>,
    pub chroma_sample_position: Option<String>,
    pub range_full: bool,
}

/// Properties of the whole input, as returned by the external `MediaInspector` (§1, out of
/// core scope; only the record shape is part of the core data model).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub total_frames: usize,
    pub is_10bit: bool,
    pub color: ColorMeta,
}

impl VideoInfo {
    /// `fps` as a real number; `0.0` if denominator is zero (the planner treats this as the
    /// "invalid FPS" failure case, §4.1).
    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            0.0
        } else {
            f64::from(self.fps_num) / f64::from(self.fps_den)
        }
    }
}

/// Optional crop rectangle from the external `CropDetector` (§1).
///
/// Invariants: `2*offset_h + new_w <= width`; `2*offset_v + new_h <= height`; `new_w` and
/// `new_h` are even (chroma-safe for 4:2:0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub new_w: u32,
    pub new_h: u32,
    pub offset_h: u32,
    pub offset_v: u32,
}

impl CropRect {
    pub fn is_valid_for(&self, width: u32, height: u32) -> bool {
        self.new_w % 2 == 0
            && self.new_h % 2 == 0
            && 2 * self.offset_h + self.new_w <= width
            && 2 * self.offset_v + self.new_h <= height
    }
}

/// One decoded chunk's worth of raw frames.
///
/// Invariant: `yuv.len() == width * height * 3 * frame_count` — 10-bit planar 4:2:0 packs to
/// 3 bytes per luma pixel once chroma is included (§3). Always 10-bit, little-endian
/// 16-bit-per-sample, regardless of the source's native bit depth.
pub struct DecodedChunk {
    pub chunk: Chunk,
    pub yuv: Vec<u8>,
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub color: ColorMeta,
}

impl DecodedChunk {
    pub fn expected_len(width: u32, height: u32, frame_count: usize) -> usize {
        width as usize * height as usize * 3 * frame_count
    }

    pub fn is_well_formed(&self) -> bool {
        self.yuv.len() == Self::expected_len(self.width, self.height, self.frame_count)
    }
}

/// One encode of a chunk (or its sample window) at a specific CRF, plus the resulting
/// perceptual score and file size (§3, GLOSSARY).
#[derive(Debug, Clone)]
pub struct Probe {
    pub crf: f64,
    pub score: f64,
    pub per_frame_scores: Vec<f64>,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_width_matches_largest_index() {
        assert_eq!(padding_width_for(1), 1);
        assert_eq!(padding_width_for(10), 1);
        assert_eq!(padding_width_for(11), 2);
        assert_eq!(padding_width_for(100), 2);
        assert_eq!(padding_width_for(101), 3);
    }

    #[test]
    fn chunk_naming_sorts_lexicographically() {
        let chunks: Vec<Chunk> = (0..12)
            .map(|idx| Chunk {
                idx,
                start: idx * 10,
                end: idx * 10 + 10,
            })
            .collect();
        let pad = padding_width_for(chunks.len());
        let mut names: Vec<String> = chunks.iter().map(|c| c.final_filename(pad)).collect();
        let sorted = {
            let mut s = names.clone();
            s.sort();
            s
        };
        names.sort();
        assert_eq!(names, sorted);
        assert_eq!(chunks[0].final_filename(pad), "00.ivf");
        assert_eq!(chunks[11].final_filename(pad), "11.ivf");
    }

    #[test]
    fn crop_rect_validates_bounds() {
        let crop = CropRect {
            new_w: 1920,
            new_h: 800,
            offset_h: 0,
            offset_v: 140,
        };
        assert!(crop.is_valid_for(1920, 1080));
        let bad = CropRect {
            new_w: 1921,
            new_h: 800,
            offset_h: 0,
            offset_v: 140,
        };
        assert!(!bad.is_valid_for(1920, 1080));
    }
}
