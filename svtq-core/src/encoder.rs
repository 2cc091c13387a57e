//! External encoder invocation (§6 "External encoder process").
//!
//! Builds the `SvtAv1EncApp` command line for both the standard pipeline (C6) and TQ probes
//! (C7), and runs it as a child process with the chunk's YUV buffer piped to stdin.

use std::io::Write;
use std::process::{Command, Stdio};

use crate::chunk::{ColorMeta, VideoInfo};
use crate::error::{PipelineError, StringOrBytes, ToolCrash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidthCategory {
    Sd,
    Hd,
    Uhd,
}

impl WidthCategory {
    pub const fn for_width(width: u32) -> Self {
        if width >= 3840 {
            Self::Uhd
        } else if width >= 1280 {
            Self::Hd
        } else {
            Self::Sd
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderParams {
    pub preset: u8,
    pub keyint_secs: f64,
    pub logical_processors: usize,
    pub film_grain_table: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub info: &'a VideoInfo,
    pub color: &'a ColorMeta,
    pub width: u32,
    pub height: u32,
    pub frame_count: usize,
    pub crf: f64,
}

/// Builds (but does not spawn) the encoder command for one chunk or probe.
pub fn build_command(
    req: &EncodeRequest<'_>,
    params: &EncoderParams,
    output_path: &std::path::Path,
) -> Command {
    let mut cmd = Command::new("SvtAv1EncApp");

    let keyint_frames = if req.info.fps() > 0.0 {
        (params.keyint_secs * req.info.fps()).round() as i64
    } else {
        -1
    };

    cmd.arg("-i")
        .arg("stdin")
        .arg("--input-depth")
        .arg("10")
        .arg("--width")
        .arg(req.width.to_string())
        .arg("--height")
        .arg(req.height.to_string())
        .arg("--fps-num")
        .arg(req.info.fps_num.to_string())
        .arg("--fps-denom")
        .arg(req.info.fps_den.to_string())
        .arg("--crf")
        .arg(format!("{:.2}", req.crf))
        .arg("--preset")
        .arg(params.preset.to_string())
        .arg("--keyint")
        .arg(keyint_frames.to_string())
        .arg("--lp")
        .arg(params.logical_processors.to_string())
        .arg("--progress")
        .arg("0");

    colorize(&mut cmd, req.color);

    if let Some(table) = &params.film_grain_table {
        cmd.arg("--fgs-table").arg(table);
    }

    for arg in &params.extra_args {
        cmd.arg(arg);
    }

    cmd.arg("-b")
        .arg(output_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd
}

fn colorize(cmd: &mut Command, color: &ColorMeta) {
    if let Some(p) = &color.primaries {
        cmd.args(["--color-primaries", p]);
    }
    if let Some(t) = &color.transfer {
        cmd.args(["--transfer-characteristics", t]);
    }
    if let Some(m) = &color.matrix {
        cmd.args(["--matrix-coefficients", m]);
    }
    if let Some(pos) = &color.chroma_sample_position {
        cmd.args(["--chroma-sample-position", pos]);
    }
    cmd.args([
        "--color-range",
        if color.range_full { "1" } else { "0" },
    ]);
}

/// Default CRF by width category (§4.6 "Encoder is asked ... a CRF chosen by width category").
pub fn default_crf(category: WidthCategory, sd_crf: f64, hd_crf: f64, uhd_crf: f64) -> f64 {
    match category {
        WidthCategory::Sd => sd_crf,
        WidthCategory::Hd => hd_crf,
        WidthCategory::Uhd => uhd_crf,
    }
}

/// Spawns the encoder, pipes `yuv` to stdin, and waits for exit. Returns `Ok(())` on a zero
/// exit code, otherwise a `ToolCrash` carrying the captured stderr tail.
pub fn run_encode(mut cmd: Command, yuv: &[u8]) -> Result<(), PipelineError> {
    let mut child = cmd.spawn().map_err(PipelineError::Io)?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let write_result = stdin.write_all(yuv);
    drop(stdin);

    let output = child.wait_with_output().map_err(PipelineError::Io)?;
    write_result.map_err(PipelineError::Io)?;

    if !output.status.success() {
        return Err(PipelineError::ToolFailure(ToolCrash {
            exit_status: output.status,
            stdout: StringOrBytes::Bytes(output.stdout),
            stderr: StringOrBytes::Bytes(output.stderr),
            upstream_pipe_stderr: None,
        }));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ColorMeta;

    fn info() -> VideoInfo {
        VideoInfo {
            width: 1920,
            height: 1080,
            fps_num: 24000,
            fps_den: 1001,
            total_frames: 1000,
            is_10bit: true,
            color: ColorMeta {
                primaries: None,
                transfer: None,
                matrix: None,
                chroma_sample_position: None,
                range_full: false,
            },
        }
    }

    #[test]
    fn width_category_thresholds() {
        assert_eq!(WidthCategory::for_width(640), WidthCategory::Sd);
        assert_eq!(WidthCategory::for_width(1920), WidthCategory::Hd);
        assert_eq!(WidthCategory::for_width(3840), WidthCategory::Uhd);
    }

    #[test]
    fn default_crf_selects_by_category() {
        assert_eq!(default_crf(WidthCategory::Sd, 24.0, 28.0, 32.0), 24.0);
        assert_eq!(default_crf(WidthCategory::Uhd, 24.0, 28.0, 32.0), 32.0);
    }

    #[test]
    fn build_command_includes_core_args() {
        let info = info();
        let req = EncodeRequest {
            info: &info,
            color: &info.color,
            width: 1920,
            height: 1080,
            frame_count: 250,
            crf: 28.0,
        };
        let params = EncoderParams {
            preset: 6,
            keyint_secs: 10.0,
            logical_processors: 4,
            film_grain_table: None,
            extra_args: vec![],
        };
        let cmd = build_command(&req, &params, std::path::Path::new("/tmp/0000.ivf"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w[0] == "--crf" && w[1] == "28.00"));
        assert!(args.windows(2).any(|w| w[0] == "--lp" && w[1] == "4"));
    }
}
