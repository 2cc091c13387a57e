//! External scene-change detector wrapper (§2 "scene-change frame indices from an external
//! detector"), the input the keyframe planner (C1) augments and splits/merges.

use std::path::Path;
use std::process::{Command, Stdio};

use av_scenechange::{detect_scene_changes, DetectionOptions, SceneDetectionSpeed};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenecutMethod {
    Fast,
    Standard,
}

/// Pipes `source` through ffmpeg into a y4m stream and runs `rav1e`'s scene-change detector
/// over it, optionally downscaled for speed. Always includes frame `0`.
pub fn detect(
    source: &Path,
    min_scene_len: usize,
    method: ScenecutMethod,
    downscale_height: Option<u32>,
) -> anyhow::Result<Vec<usize>> {
    let mut filters: Vec<String> = vec!["-pix_fmt".into(), "yuv420p10le".into()];
    if let Some(h) = downscale_height {
        filters.push("-vf".into());
        filters.push(format!("scale=-2:'min({h},ih)'"));
    }

    let ffmpeg_stdout = Command::new("ffmpeg")
        .arg("-i")
        .arg(source)
        .args(&filters)
        .args(["-f", "yuv4mpegpipe", "-strict", "-1", "-"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?
        .stdout
        .ok_or_else(|| anyhow::anyhow!("ffmpeg did not hand back a stdout pipe"))?;

    let mut decoder = y4m::Decoder::new(ffmpeg_stdout)?;

    let options = DetectionOptions {
        min_scenecut_distance: Some(min_scene_len),
        analysis_speed: match method {
            ScenecutMethod::Fast => SceneDetectionSpeed::Fast,
            ScenecutMethod::Standard => SceneDetectionSpeed::Standard,
        },
        ..DetectionOptions::default()
    };

    let result = detect_scene_changes::<_, u16>(&mut decoder, options, None);
    info!(count = result.scene_changes.len(), "scene change detection complete");

    let mut frames = result.scene_changes;
    if frames.first() != Some(&0) {
        frames.insert(0, 0);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenecut_method_values_are_distinct() {
        assert_ne!(ScenecutMethod::Fast, ScenecutMethod::Standard);
    }
}
