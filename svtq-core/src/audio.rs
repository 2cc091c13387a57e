//! Ambient audio transcode (Opus), outside the chunked video pipeline proper but needed before
//! the merger muxes a final file (§1 "externally-prepared audio").

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use path_abs::{PathAbs, PathInfo};
use tracing::warn;

use crate::media::has_audio;

/// Transcodes `input`'s audio track(s) to Opus into `temp_dir/audio.mkv`. Returns `None` when
/// the source has no audio (not an error: video-only sources are valid).
pub fn encode_audio<S: AsRef<OsStr>>(
    input: impl AsRef<Path>,
    temp_dir: impl AsRef<Path>,
    bitrate_kbps: u32,
    language: Option<&str>,
    extra_params: &[S],
) -> Option<PathBuf> {
    let input = input.as_ref();
    let temp_dir = temp_dir.as_ref();

    if !has_audio(input) {
        return None;
    }

    let audio_file = temp_dir.join("audio.mkv");
    let mut cmd = Command::new("ffmpeg");
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-i"]);
    cmd.arg(input);
    cmd.args(["-map_metadata", "0", "-dn", "-vn", "-sn"]);
    cmd.args(["-c:a", "libopus", "-b:a", &format!("{bitrate_kbps}k")]);
    if let Some(lang) = language {
        cmd.args(["-metadata:s:a:0", &format!("language={lang}")]);
    }
    cmd.args(extra_params);
    cmd.arg(&audio_file);

    match cmd.output() {
        Ok(output) if output.status.success() => Some(audio_file),
        Ok(output) => {
            warn!(
                status = ?output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "ffmpeg audio transcode failed"
            );
            None
        }
        Err(e) => {
            warn!(error = %e, "failed to spawn ffmpeg for audio transcode");
            None
        }
    }
}

/// Escapes a path for use inside an ffmpeg filtergraph string (`movie=`, `subtitles=`, ...).
pub fn escape_path_in_filter(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let abs = PathAbs::new(path.as_ref())?;
    let as_str = abs.to_str().ok_or_else(|| anyhow::anyhow!("non-UTF8 path"))?;

    Ok(if cfg!(target_os = "windows") {
        // https://stackoverflow.com/questions/60440793 — ffmpeg filtergraphs on Windows need
        // forward slashes and an escaped drive-letter colon.
        as_str.replace('\\', "/").replace(':', r"\:")
    } else {
        as_str.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_path_is_noop_on_unix_like_paths() {
        if !cfg!(target_os = "windows") {
            let escaped = escape_path_in_filter("/tmp/input.mkv").unwrap();
            assert_eq!(escaped, "/tmp/input.mkv");
        }
    }
}
