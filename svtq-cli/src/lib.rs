use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;

use svtq_core::audio;
use svtq_core::chunk::{self, CropRect};
use svtq_core::crf_tracker::CrfTracker;
use svtq_core::decode::DecodeSource;
use svtq_core::dispatcher::Dispatcher;
use svtq_core::encoder::EncoderParams;
use svtq_core::error::PipelineError;
use svtq_core::grain::{self, TransferFunction};
use svtq_core::logging;
use svtq_core::media::MediaInspector;
use svtq_core::merge;
use svtq_core::metrics::{MetricError, MetricMode, MetricProcessor, Ssimulacra2Processor};
use svtq_core::permits::{self, PermitController, PermitInputs};
use svtq_core::pipeline_std::{self, StdPipelineConfig};
use svtq_core::pipeline_tq::{self, TqPipelineConfig};
use svtq_core::planner;
use svtq_core::reporter::{error_event, Event, NdjsonReporter, Reporter, TerminalReporter};
use svtq_core::resume::{self, ResumeStore};
use svtq_core::scene_detect::{self, ScenecutMethod};
use svtq_core::tq_state::TqConfig;

// Needs to be static, runtime-allocated string to avoid evil hacks to concatenate
// non-trivial strings at compile-time.
fn version() -> &'static str {
    static INSTANCE: OnceCell<String> = OnceCell::new();
    INSTANCE.get_or_init(|| {
        match (
            option_env!("VERGEN_GIT_SHA_SHORT"),
            option_env!("VERGEN_CARGO_PROFILE"),
            option_env!("VERGEN_RUSTC_SEMVER"),
            option_env!("VERGEN_BUILD_DATE"),
        ) {
            (Some(git_hash), Some(profile), Some(rustc_ver), Some(build_date)) => format!(
                "{} (rev {}) ({})\n\n* Compiler\n  rustc {}\n\n* Build Date\n  {}",
                env!("CARGO_PKG_VERSION"),
                git_hash,
                profile,
                rustc_ver,
                build_date
            ),
            // Only the semver when git information isn't available (a release build).
            _ => env!("CARGO_PKG_VERSION").into(),
        }
    })
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(4)
}

/// Cross-platform SVT-AV1 + Opus chunked encoder with optional per-chunk target-quality search.
#[derive(Parser, Debug)]
#[clap(name = "svtq", version = version())]
pub struct CliOpts {
    /// Input video file to encode
    #[clap(short, long)]
    pub input: PathBuf,

    /// Output file (container chosen by extension)
    #[clap(short, long)]
    pub output: PathBuf,

    /// Number of chunk-level encode workers
    #[clap(short, long, default_value_t = default_workers())]
    pub workers: usize,

    /// Chunks to keep decoded ahead of the encoder pool (standard pipeline only)
    #[clap(long, default_value_t = 4, help_heading = "ENCODING")]
    pub chunk_buffer: usize,

    /// CRF used for chunks narrower than 1280px in the standard pipeline
    #[clap(long, default_value_t = 24.0, help_heading = "ENCODING")]
    pub sd_crf: f64,

    /// CRF used for chunks from 1280px up to (not including) 3840px wide
    #[clap(long, default_value_t = 28.0, help_heading = "ENCODING")]
    pub hd_crf: f64,

    /// CRF used for chunks 3840px wide or more
    #[clap(long, default_value_t = 32.0, help_heading = "ENCODING")]
    pub uhd_crf: f64,

    /// SVT-AV1 preset (0 slowest/best quality - 13 fastest)
    #[clap(long, default_value_t = 6, help_heading = "ENCODING")]
    pub preset: u8,

    /// Detect and apply a crop rectangle (majority vote over ffmpeg's cropdetect)
    #[clap(long, help_heading = "ENCODING")]
    pub autocrop: bool,

    /// ISO strength for synthetic film-grain re-application (disabled unless set)
    #[clap(long, help_heading = "ENCODING")]
    pub film_grain: Option<u8>,

    /// Target-quality range "min-max" (e.g. "68-75"). Switches on the target-quality pipeline;
    /// omit to use the fixed per-width-category CRFs instead.
    #[clap(long, help_heading = "TARGET QUALITY")]
    pub target: Option<String>,

    /// CRF search bounds "min-max" for target-quality mode
    #[clap(long, default_value = "8-63", help_heading = "TARGET QUALITY")]
    pub qp_range: String,

    /// Metric worker thread count (target-quality mode only)
    #[clap(long, default_value_t = 2, help_heading = "TARGET QUALITY")]
    pub metric_workers: usize,

    /// Metric reduction mode across a chunk's per-frame scores: "mean" or "pN" (e.g. "p5")
    #[clap(long, default_value = "mean", help_heading = "TARGET QUALITY")]
    pub metric_mode: String,

    /// Sample-window duration in seconds for target-quality probing
    #[clap(long, default_value_t = 3.0, help_heading = "TARGET QUALITY")]
    pub sample_duration: f64,

    /// Minimum chunk duration, in seconds, eligible for sample-window probing
    #[clap(long, default_value_t = 6.0, help_heading = "TARGET QUALITY")]
    pub sample_min_chunk: f64,

    /// Always probe the whole chunk; disables sample-window probing
    #[clap(long, help_heading = "TARGET QUALITY")]
    pub disable_sampling: bool,

    /// Minimum distance, in frames, between scene-change keyframes
    #[clap(long, default_value_t = 12, help_heading = "SCENE DETECTION")]
    pub scene_threshold: usize,

    /// Opus audio bitrate in kb/s per stream
    #[clap(long, default_value_t = 96, help_heading = "AUDIO")]
    pub audio_bitrate: u32,

    /// Language tag stamped onto the transcoded audio stream
    #[clap(long, help_heading = "AUDIO")]
    pub audio_lang: Option<String>,

    /// Above this many chunks, merge the final output in two passes
    #[clap(long, default_value_t = merge::CONCAT_BATCH_THRESHOLD, help_heading = "ENCODING")]
    pub concat_threshold: usize,

    /// Directory for chunk files, logs, and the resume log [default: alongside the input]
    #[clap(long)]
    pub temp_dir: Option<PathBuf>,

    /// Log file location [default: <temp dir>/svtq.log]
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Keep the temporary directory after a successful encode
    #[clap(short, long)]
    pub keep: bool,

    /// Emit one JSON object per line to stdout instead of a terminal progress bar
    #[clap(long)]
    pub ndjson: bool,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u8,
}

fn parse_range(raw: &str, flag: &str) -> anyhow::Result<(f64, f64)> {
    let (lo, hi) = raw
        .split_once('-')
        .ok_or_else(|| anyhow!("--{flag} expects MIN-MAX, got {raw:?}"))?;
    let lo: f64 = lo.trim().parse().with_context(|| format!("--{flag} min is not a number"))?;
    let hi: f64 = hi.trim().parse().with_context(|| format!("--{flag} max is not a number"))?;
    if lo > hi {
        bail!("--{flag} min ({lo}) is greater than max ({hi})");
    }
    Ok((lo, hi))
}

fn parse_metric_mode(raw: &str) -> anyhow::Result<MetricMode> {
    if raw.eq_ignore_ascii_case("mean") {
        return Ok(MetricMode::Mean);
    }
    let pct = raw
        .strip_prefix('p')
        .or_else(|| raw.strip_prefix('P'))
        .ok_or_else(|| anyhow!("--metric-mode expects \"mean\" or \"pN\", got {raw:?}"))?;
    let pct: u8 = pct.parse().with_context(|| format!("--metric-mode percentile {pct:?} is not a number"))?;
    Ok(MetricMode::Percentile(pct))
}

fn default_temp_dir(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "svtq".into());
    input.with_file_name(format!(".{stem}_svtq_temp"))
}

/// Reads the available system memory, in bytes, for the permit controller's budget (§4.5
/// step 3 "unobtainable" path is hit when this returns `None`).
fn available_memory_bytes() -> Option<u64> {
    use sysinfo::{System, SystemExt};
    let mut sys = System::new();
    sys.refresh_memory();
    let kib = sys.available_memory();
    if kib == 0 {
        None
    } else {
        Some(kib * 1024)
    }
}

/// Samples ffmpeg's `cropdetect` filter over the first 60 decoded frames and takes the most
/// frequent `crop=W:H:X:Y` line (§1 "sampling and majority vote over cropdetect output").
fn detect_crop(input: &Path, width: u32, height: u32) -> anyhow::Result<Option<CropRect>> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "info", "-i"])
        .arg(input)
        .args(["-vf", "cropdetect=24:16:0", "-frames:v", "60", "-f", "null", "-"])
        .output()
        .context("running ffmpeg cropdetect")?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut counts: HashMap<(u32, u32, u32, u32), usize> = HashMap::new();
    for line in stderr.lines() {
        let Some(pos) = line.find("crop=") else {
            continue;
        };
        let rest = &line[pos + "crop=".len()..];
        let token = rest.split_whitespace().next().unwrap_or("");
        let fields: Vec<&str> = token.split(':').collect();
        let [w, h, x, y] = fields[..] else {
            continue;
        };
        if let (Ok(w), Ok(h), Ok(x), Ok(y)) = (w.parse(), h.parse(), x.parse(), y.parse()) {
            *counts.entry((w, h, x, y)).or_insert(0) += 1;
        }
    }

    let winner = counts.into_iter().max_by_key(|&(_, count)| count).map(|(rect, _)| rect);
    Ok(winner.and_then(|(w, h, x, y)| {
        let rect = CropRect {
            new_w: w,
            new_h: h,
            offset_h: x,
            offset_v: y,
        };
        if rect.is_valid_for(width, height) && (rect.new_w != width || rect.new_h != height) {
            Some(rect)
        } else {
            None
        }
    }))
}

/// Muxes the concatenated elementary video stream with the (optional) transcoded audio into
/// the final container, letting ffmpeg infer the container from `output`'s extension.
fn mux_final(video: &Path, audio: Option<&Path>, output: &Path) -> anyhow::Result<()> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-i"]).arg(video);
    if let Some(audio) = audio {
        cmd.arg("-i").arg(audio);
    }
    cmd.args(["-map", "0:v"]);
    if audio.is_some() {
        cmd.args(["-map", "1:a"]);
    }
    cmd.args(["-c", "copy"]).arg(output);

    let output_result = cmd.output().context("running ffmpeg final mux")?;
    if !output_result.status.success() {
        bail!(
            "ffmpeg final mux exited with {}: {}",
            output_result.status,
            String::from_utf8_lossy(&output_result.stderr)
        );
    }
    Ok(())
}

/// Wraps a fatal [`PipelineError`] with a reporter event before converting it for `?`, per the
/// title/message/context/suggestion contract (§7). Cancellation is deliberately not reported as
/// a loud failure.
fn report_pipeline_error(err: PipelineError, reporter: &dyn Reporter, context: &str) -> anyhow::Error {
    if !err.is_cancellation() {
        reporter.report(error_event(&err, context));
    }
    anyhow::Error::new(err)
}

pub fn run() -> anyhow::Result<()> {
    let opts = CliOpts::parse();

    let temp_dir = opts.temp_dir.clone().unwrap_or_else(|| default_temp_dir(&opts.input));
    fs::create_dir_all(&temp_dir).with_context(|| format!("creating temp dir {temp_dir:?}"))?;
    let chunk_dir = temp_dir.join("chunks");
    fs::create_dir_all(&chunk_dir).with_context(|| format!("creating chunk dir {chunk_dir:?}"))?;

    let log_path = opts.log_file.clone().unwrap_or_else(|| temp_dir.join("svtq.log"));
    let console_level = match opts.verbose {
        0 => logging::DEFAULT_CONSOLE_LEVEL,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    logging::init_logging(console_level, log_path, logging::DEFAULT_FILE_LEVEL);

    // A coarse cancellation flag: checked between session phases rather than per chunk, since
    // the pipeline stages themselves only ever see the errors their own stage produces.
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = Arc::clone(&cancelled);
        ctrlc::set_handler(move || cancelled.store(true, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }
    let check_cancelled = || -> anyhow::Result<()> {
        if cancelled.load(Ordering::SeqCst) {
            bail!(PipelineError::Cancelled);
        }
        Ok(())
    };

    info!(input = ?opts.input, output = ?opts.output, "starting session");

    let reporter: Box<dyn Reporter> = if opts.ndjson {
        Box::new(NdjsonReporter::new(std::io::stdout()))
    } else {
        Box::new(TerminalReporter)
    };

    let video_info = match MediaInspector::inspect(&opts.input) {
        Ok(v) => v,
        Err(e) => return Err(report_pipeline_error(e, reporter.as_ref(), "inspecting input")),
    };

    let crop = if opts.autocrop {
        detect_crop(&opts.input, video_info.width, video_info.height)?
    } else {
        None
    };
    let (out_w, out_h) = crop.map_or((video_info.width, video_info.height), |c| (c.new_w, c.new_h));

    check_cancelled()?;

    let scene_indices = scene_detect::detect(&opts.input, opts.scene_threshold, ScenecutMethod::Standard, None)
        .context("scene change detection")?;
    let chunks = planner::plan(
        video_info.total_frames,
        video_info.fps_num,
        video_info.fps_den,
        &scene_indices,
        planner::DEFAULT_MIN_DURATION_SECS,
    );
    if chunks.is_empty() {
        bail!("input has no frames to encode");
    }
    let pad_width = chunk::padding_width_for(chunks.len());

    let resume_path = temp_dir.join("resume.log");
    let resume_state = resume::load(&resume_path).context("loading resume log")?;
    let resume_store = ResumeStore::open(&resume_path).context("opening resume log")?;

    reporter.report(Event::SessionStart {
        total_chunks: chunks.len(),
        already_done: resume_state.done.len(),
    });

    let dispatcher = Dispatcher::new(chunks.clone());
    for idx in &resume_state.done {
        dispatcher.mark_complete(*idx);
    }

    let is_tq = opts.target.is_some();
    let avg_frames_per_chunk = (video_info.total_frames / chunks.len().max(1)).max(1) as u64;
    let permit_inputs = PermitInputs {
        workers: opts.workers,
        chunk_buffer: opts.chunk_buffer,
        is_tq,
        width: out_w,
        height: out_h,
        avg_frames_per_chunk,
        available_memory_bytes: available_memory_bytes(),
    };
    let max_in_flight = permits::compute_max_in_flight(&permit_inputs);
    info!(max_in_flight, "permit budget computed");
    let permit_controller = PermitController::new(max_in_flight);

    let crf_tracker = CrfTracker::new();
    let color = Arc::new(video_info.color.clone());
    let source = DecodeSource::open(&opts.input, Arc::clone(&color)).context("opening decode source")?;

    let film_grain_table = match opts.film_grain {
        Some(iso) => {
            let table_path = temp_dir.join("film_grain.tbl");
            grain::create_film_grain_file(&table_path, iso, out_w, out_h, TransferFunction::BT1886)
                .context("generating film grain table")?;
            Some(table_path.to_string_lossy().into_owned())
        }
        None => None,
    };

    let encoder_params = EncoderParams {
        preset: opts.preset,
        keyint_secs: 10.0,
        logical_processors: opts.workers.max(1),
        film_grain_table,
        extra_args: Vec::new(),
    };

    check_cancelled()?;

    let pipeline_result = if let Some(target_raw) = &opts.target {
        let (target_min, target_max) = parse_range(target_raw, "target")?;
        let (qp_min, qp_max) = parse_range(&opts.qp_range, "qp-range")?;
        let metric_mode = parse_metric_mode(&opts.metric_mode)?;

        let tq_cfg = TqConfig {
            qp_min,
            qp_max,
            target: (target_min + target_max) / 2.0,
            tolerance: (target_max - target_min) / 2.0,
            max_rounds: 20,
        };
        let pipeline_cfg = TqPipelineConfig {
            workers: opts.workers,
            metric_workers: opts.metric_workers,
            chunk_dir: chunk_dir.clone(),
            pad_width,
            encoder_params,
            tq: tq_cfg,
            metric_mode,
            sample_dur_secs: opts.sample_duration,
            sample_min_chunk_secs: opts.sample_min_chunk,
            disable_sampling: opts.disable_sampling,
        };

        let metric_color = (*color).clone();
        let metric_factory = move || -> Result<Box<dyn MetricProcessor>, MetricError> {
            Ok(Box::new(Ssimulacra2Processor::new(out_w, out_h, &metric_color)?))
        };

        pipeline_tq::run(
            &pipeline_cfg,
            &video_info,
            crop.as_ref(),
            &source,
            &dispatcher,
            &permit_controller,
            &crf_tracker,
            &resume_store,
            &resume_state.done,
            reporter.as_ref(),
            &metric_factory,
            &cancelled,
        )
    } else {
        let std_cfg = StdPipelineConfig {
            workers: opts.workers,
            chunk_dir: chunk_dir.clone(),
            pad_width,
            sd_crf: opts.sd_crf,
            hd_crf: opts.hd_crf,
            uhd_crf: opts.uhd_crf,
            encoder_params,
        };
        pipeline_std::run(
            &std_cfg,
            &video_info,
            crop.as_ref(),
            &source,
            &dispatcher,
            &permit_controller,
            &resume_store,
            &resume_state.done,
            reporter.as_ref(),
            &cancelled,
        )
    };

    if let Err(e) = pipeline_result {
        return Err(report_pipeline_error(e, reporter.as_ref(), "chunk encoding"));
    }

    check_cancelled()?;

    let audio_path = audio::encode_audio(&opts.input, &temp_dir, opts.audio_bitrate, opts.audio_lang.as_deref(), &[] as &[&str]);

    let video_out = temp_dir.join("video.ivf");
    merge::merge(&chunk_dir, &video_out, chunks.len(), pad_width).context("merging chunk files")?;
    mux_final(&video_out, audio_path.as_deref(), &opts.output)?;

    if !opts.keep {
        if let Err(e) = fs::remove_dir_all(&temp_dir) {
            warn!(error = %e, dir = ?temp_dir, "failed to clean up temp dir");
        }
    }

    reporter.report(Event::SessionFinished {
        output: opts.output.display().to_string(),
    });
    info!("session complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_accepts_simple_bounds() {
        assert_eq!(parse_range("68-75", "target").unwrap(), (68.0, 75.0));
    }

    #[test]
    fn parse_range_rejects_inverted_bounds() {
        assert!(parse_range("75-68", "target").is_err());
    }

    #[test]
    fn parse_range_rejects_missing_separator() {
        assert!(parse_range("75", "target").is_err());
    }

    #[test]
    fn parse_metric_mode_accepts_mean_and_percentile() {
        assert!(matches!(parse_metric_mode("mean").unwrap(), MetricMode::Mean));
        assert!(matches!(parse_metric_mode("p5").unwrap(), MetricMode::Percentile(5)));
        assert!(matches!(parse_metric_mode("P95").unwrap(), MetricMode::Percentile(95)));
    }

    #[test]
    fn parse_metric_mode_rejects_garbage() {
        assert!(parse_metric_mode("whatever").is_err());
    }

    #[test]
    fn default_temp_dir_is_hidden_sibling_of_input() {
        let dir = default_temp_dir(Path::new("/videos/movie.mkv"));
        assert_eq!(dir, PathBuf::from("/videos/.movie_svtq_temp"));
    }
}
