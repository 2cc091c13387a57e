//! C2: decode source (§4.2).
//!
//! Wraps the external frame-accurate decoder. `extract` writes one frame into a caller-owned
//! buffer as 10-bit planar 4:2:0, widening 8-bit samples by left-shifting 2 bits. Chunk decode
//! is simply a sequential loop of `extract` calls into one contiguous buffer.

use std::path::Path;
use std::sync::Arc;

use ffmpeg_next::format::{input, Pixel};
use ffmpeg_next::media::Type as MediaType;
use ffmpeg_next::software::scaling::{context::Context as ScalingContext, flag::Flags};
use ffmpeg_next::util::frame::video::Video as VideoFrame;

use crate::chunk::{Chunk, ColorMeta, CropRect, DecodedChunk};
use crate::error::PipelineError;
use crate::media::widen_8_to_10;

/// Opened once per worker thread (§4.2 "thread hint equal to worker count"); concurrent
/// `extract` calls across distinct `DecodeSource` instances on the same file are allowed, each
/// owning its own decoder state so seeks don't race.
pub struct DecodeSource {
    path: std::path::PathBuf,
    color: Arc<ColorMeta>,
}

impl DecodeSource {
    pub fn open(path: &Path, color: Arc<ColorMeta>) -> Result<Self, PipelineError> {
        // A cheap existence probe; the real decoder context is opened lazily per extract batch
        // to keep one ffmpeg `Context` scoped to a single chunk's sequential reads.
        if !path.exists() {
            return Err(PipelineError::InvalidInput(format!("{path:?} does not exist")));
        }
        Ok(Self {
            path: path.to_path_buf(),
            color,
        })
    }

    /// Sequentially decodes `[chunk.start, chunk.end)` into one contiguous 10-bit planar 4:2:0
    /// buffer (§4.2 "Chunk decode"). `crop`, if present, is applied per frame.
    pub fn decode_chunk(
        &self,
        chunk: &Chunk,
        crop: Option<&CropRect>,
    ) -> Result<DecodedChunk, PipelineError> {
        let mut ictx = input(&self.path).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        let stream = ictx
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| PipelineError::InvalidInput("no video stream".into()))?;
        let stream_index = stream.index();

        let decoder_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        let mut decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

        let src_w = decoder.width();
        let src_h = decoder.height();
        let (out_w, out_h, offset_h, offset_v) = match crop {
            Some(c) if c.is_valid_for(src_w, src_h) => (c.new_w, c.new_h, c.offset_h, c.offset_v),
            _ => (src_w, src_h, 0, 0),
        };

        let mut scaler = ScalingContext::get(
            decoder.format(),
            src_w,
            src_h,
            Pixel::YUV420P10LE,
            out_w,
            out_h,
            Flags::BILINEAR,
        )
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

        let frame_count = chunk.frames();
        let frame_bytes = DecodedChunk::expected_len(out_w, out_h, 1);
        let mut yuv = vec![0u8; frame_bytes * frame_count];
        let mut written = 0usize;
        let mut frame_idx = 0usize;

        for (stream, packet) in ictx.packets() {
            if stream.index() != stream_index {
                continue;
            }
            decoder.send_packet(&packet).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

            let mut decoded = VideoFrame::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                if frame_idx >= chunk.end {
                    break;
                }
                if frame_idx >= chunk.start {
                    let mut scaled = VideoFrame::empty();
                    scaler
                        .run(&decoded, &mut scaled)
                        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
                    copy_cropped_plane(&scaled, &mut yuv, written, out_w, out_h, offset_h, offset_v, decoder.format());
                    written += frame_bytes;
                }
                frame_idx += 1;
            }
            if frame_idx >= chunk.end {
                break;
            }
        }

        let filled_frames = written / frame_bytes;
        yuv.truncate(written);

        Ok(DecodedChunk {
            chunk: chunk.clone(),
            yuv,
            frame_count: filled_frames,
            width: out_w,
            height: out_h,
            color: (*self.color).clone(),
        })
    }
}

/// Copies one already-scaled/cropped frame's planes into the chunk's contiguous buffer,
/// widening 8-bit source samples per §4.2. Ffmpeg's scaler output is already 10-bit planar
/// (`YUV420P10LE`), so this only needs a straight plane copy when the source decoder itself
/// was not already 10-bit; the widening therefore happens implicitly via the scaler's format
/// conversion in the common case, and explicitly here for the rare 8-bit passthrough path.
#[allow(clippy::too_many_arguments)]
fn copy_cropped_plane(
    frame: &VideoFrame,
    dst: &mut [u8],
    dst_offset: usize,
    width: u32,
    height: u32,
    offset_h: u32,
    offset_v: u32,
    source_format: Pixel,
) {
    let needs_manual_widen = matches!(source_format, Pixel::YUV420P);
    let dst_frame = &mut dst[dst_offset..];

    let luma_len = (width as usize) * (height as usize) * 2;
    let chroma_w = width as usize / 2;
    let chroma_h = height as usize / 2;
    let chroma_len = chroma_w * chroma_h * 2;

    for (plane_idx, plane_len) in [(0, luma_len), (1, chroma_len), (2, chroma_len)] {
        let stride = frame.stride(plane_idx);
        let data = frame.data(plane_idx);
        let (plane_w, plane_h) = if plane_idx == 0 {
            (width as usize, height as usize)
        } else {
            (chroma_w, chroma_h)
        };
        let (crop_x, crop_y) = if plane_idx == 0 {
            (offset_h as usize, offset_v as usize)
        } else {
            (offset_h as usize / 2, offset_v as usize / 2)
        };

        let dst_plane_offset: usize = match plane_idx {
            0 => 0,
            1 => luma_len,
            _ => luma_len + chroma_len,
        };

        for row in 0..plane_h {
            let src_row_start = (row + crop_y) * stride + crop_x * 2;
            let dst_row_start = dst_plane_offset + row * plane_w * 2;
            if !needs_manual_widen {
                let len = plane_w * 2;
                dst_frame[dst_row_start..dst_row_start + len]
                    .copy_from_slice(&data[src_row_start..src_row_start + len]);
            } else {
                for col in 0..plane_w {
                    let sample = data[src_row_start / 2 + col];
                    let widened = widen_8_to_10(sample).to_le_bytes();
                    let d = dst_row_start + col * 2;
                    dst_frame[d..d + 2].copy_from_slice(&widened);
                }
            }
        }
        let _ = plane_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rejects_missing_file() {
        let color = Arc::new(ColorMeta {
            primaries: None,
            transfer: None,
            matrix: None,
            chroma_sample_position: None,
            range_full: false,
        });
        let err = DecodeSource::open(Path::new("/nonexistent/file.mkv"), color).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
