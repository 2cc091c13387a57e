//! C7: TQ encoder pipeline (§4.7). Replaces C6 when a target range is configured.
//!
//! Three stages on bounded (capacity 2) channels: encode -> metric -> coordinator, with a
//! rework channel carrying probes that haven't converged back to the encode stage. The
//! coordinator, not the decoder, closes the encode channel (§9): a chunk dispatched once by
//! the decoder keeps cycling encode -> metric -> coordinator until it converges, so the encode
//! channel may only close once every dispatched chunk has reached a terminal `Done`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use tracing::{debug, info};

use crate::chunk::{Chunk, CropRect, DecodedChunk, Probe, VideoInfo};
use crate::crf_tracker::CrfTracker;
use crate::decode::DecodeSource;
use crate::dispatcher::Dispatcher;
use crate::encoder::{self, EncodeRequest, EncoderParams};
use crate::error::{ErrorSlot, PipelineError};
use crate::media;
use crate::metrics::{MetricError, MetricMode, MetricProcessor, PlaneTriple};
use crate::permits::PermitController;
use crate::reporter::{Event, Reporter};
use crate::resume::{ResumeEntry, ResumeStore};
use crate::sample::{plan_sample_window, SampleWindow};
use crate::tq_state::{Completion, TqConfig, TqState};

/// Back-pressure channel capacity between stages (§4.7 "capacity 2").
const STAGE_CAPACITY: usize = 2;

pub struct TqPipelineConfig {
    pub workers: usize,
    pub metric_workers: usize,
    pub chunk_dir: PathBuf,
    pub pad_width: usize,
    pub encoder_params: EncoderParams,
    pub tq: TqConfig,
    pub metric_mode: MetricMode,
    pub sample_dur_secs: f64,
    pub sample_min_chunk_secs: f64,
    pub disable_sampling: bool,
}

struct InFlight {
    chunk: DecodedChunk,
    state: TqState,
}

enum CoordinatorMsg {
    Rework(InFlight),
    Done { inflight: InFlight, best: Probe },
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    cfg: &TqPipelineConfig,
    info: &VideoInfo,
    crop: Option<&CropRect>,
    source: &DecodeSource,
    dispatcher: &Dispatcher,
    permits: &PermitController,
    crf_tracker: &CrfTracker,
    resume: &ResumeStore,
    already_done: &std::collections::BTreeSet<usize>,
    reporter: &dyn Reporter,
    metric_processor_factory: &(dyn Fn() -> Result<Box<dyn MetricProcessor>, MetricError> + Sync),
    cancelled: &AtomicBool,
) -> Result<(), PipelineError> {
    let error_slot = Arc::new(ErrorSlot::new());
    let (encode_tx, encode_rx) = bounded::<InFlight>(STAGE_CAPACITY);
    let (metric_tx, metric_rx) = bounded::<(InFlight, PathBuf, Option<SampleWindow>)>(STAGE_CAPACITY);
    let (coord_tx, coord_rx) = bounded::<CoordinatorMsg>(STAGE_CAPACITY);

    // Incremented once per chunk when the decoder first dispatches it; decremented once per
    // chunk when the coordinator observes its terminal `Done`. Reaching zero after the decoder
    // has finished is the only correct signal that no more rework will arrive (§9).
    let chunks_in_flight = Arc::new(AtomicUsize::new(0));
    let decoder_done = Arc::new(AtomicBool::new(false));

    // The coordinator needs its own sender into the encode stage to route rework, and it alone
    // decides when to drop it, which is what ultimately lets `encode_rx.iter()` terminate.
    let rework_tx = encode_tx.clone();

    thread::scope(|scope| {
        // Decoder loop: attaches a fresh TqState (with predicted CRF) and dispatches to encode.
        {
            let chunks_in_flight = Arc::clone(&chunks_in_flight);
            let decoder_done = Arc::clone(&decoder_done);
            let error_slot = Arc::clone(&error_slot);
            scope.spawn(move || {
                let tx = encode_tx;
                while !dispatcher.is_empty() {
                    if error_slot.is_set() || cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(chunk) = dispatcher.next() else {
                        break;
                    };
                    if already_done.contains(&chunk.idx) {
                        dispatcher.mark_complete(chunk.idx);
                        continue;
                    }
                    if !permits.wait_for_slot(cancelled) {
                        error_slot.set(PipelineError::Cancelled);
                        break;
                    }
                    permits.on_dispatch();

                    match source.decode_chunk(&chunk, crop) {
                        Ok(decoded) => {
                            let predicted = crf_tracker.predict(chunk.idx, (cfg.tq.qp_min + cfg.tq.qp_max) / 2.0);
                            let state = TqState::new(cfg.tq, predicted);
                            chunks_in_flight.fetch_add(1, Ordering::SeqCst);
                            if tx.send(InFlight { chunk: decoded, state }).is_err() {
                                chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                                permits.on_complete();
                                break;
                            }
                        }
                        Err(e) => {
                            permits.on_complete();
                            error_slot.set(e);
                            break;
                        }
                    }
                }
                decoder_done.store(true, Ordering::SeqCst);
                // `tx` drops here; the encode channel still stays open via `rework_tx` until
                // the coordinator decides no chunk is left cycling.
            });
        }

        // Encode stage: `workers` parallel threads consume both fresh dispatches and rework.
        for worker_idx in 0..cfg.workers.max(1) {
            let encode_rx = encode_rx.clone();
            let metric_tx = metric_tx.clone();
            let error_slot = Arc::clone(&error_slot);
            let chunks_in_flight = Arc::clone(&chunks_in_flight);
            scope.spawn(move || {
                for mut inflight in encode_rx.iter() {
                    if error_slot.is_set() || cancelled.load(Ordering::SeqCst) {
                        chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                        permits.on_complete();
                        break;
                    }
                    let window = if cfg.disable_sampling {
                        None
                    } else {
                        plan_sample_window(
                            inflight.chunk.frame_count,
                            info.fps(),
                            cfg.sample_dur_secs,
                            cfg.sample_min_chunk_secs,
                        )
                    };

                    let crf = inflight.state.next_crf();
                    let probe_path = cfg
                        .chunk_dir
                        .join(inflight.chunk.chunk.probe_filename(cfg.pad_width, crf.round() as u32));

                    let req = EncodeRequest {
                        info,
                        color: &inflight.chunk.color,
                        width: inflight.chunk.width,
                        height: inflight.chunk.height,
                        frame_count: window.map_or(inflight.chunk.frame_count, |w| w.encode_frames),
                        crf,
                    };
                    let probe_yuv: Vec<u8> = window.map_or_else(
                        || inflight.chunk.yuv.clone(),
                        |w| slice_window(&inflight.chunk, w.offset, w.encode_frames).to_vec(),
                    );

                    let cmd = encoder::build_command(&req, &cfg.encoder_params, &probe_path);
                    debug!(worker_idx, idx = inflight.chunk.chunk.idx, crf, "probe encoding");
                    match encoder::run_encode(cmd, &probe_yuv) {
                        Ok(()) => {
                            if metric_tx.send((inflight, probe_path, window)).is_err() {
                                chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                                permits.on_complete();
                                break;
                            }
                        }
                        Err(e) => {
                            chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                            permits.on_complete();
                            error_slot.set(e);
                            break;
                        }
                    }
                }
            });
        }
        drop(metric_tx);

        // Metric stage: scores each probe and decides convergence.
        for worker_idx in 0..cfg.metric_workers.max(1) {
            let metric_rx = metric_rx.clone();
            let coord_tx = coord_tx.clone();
            let error_slot = Arc::clone(&error_slot);
            let chunks_in_flight = Arc::clone(&chunks_in_flight);
            let metric_mode = cfg.metric_mode;
            scope.spawn(move || {
                let mut processor: Option<Box<dyn MetricProcessor>> = None;
                for (mut inflight, probe_path, window) in metric_rx.iter() {
                    if error_slot.is_set() || cancelled.load(Ordering::SeqCst) {
                        chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                        permits.on_complete();
                        break;
                    }
                    if processor.is_none() {
                        match metric_processor_factory() {
                            Ok(p) => processor = Some(p),
                            Err(e) => {
                                chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                                permits.on_complete();
                                error_slot.set(PipelineError::Pipeline(e.to_string()));
                                break;
                            }
                        }
                    }
                    let proc = processor.as_mut().expect("metric processor initialized above");

                    match score_probe(proc.as_mut(), &inflight, &probe_path, window, metric_mode) {
                        Ok((score, per_frame)) => {
                            let crf = inflight.state.last_crf;
                            let size_bytes = std::fs::metadata(&probe_path).map(|m| m.len()).unwrap_or(0);
                            inflight.state.update_bounds(score);
                            inflight.state.probes.push(Probe {
                                crf,
                                score,
                                per_frame_scores: per_frame,
                                size_bytes,
                            });
                            debug!(worker_idx, idx = inflight.chunk.chunk.idx, crf, score, "probe scored");

                            let msg = match inflight.state.should_complete(score) {
                                Completion::Continue => CoordinatorMsg::Rework(inflight),
                                Completion::Complete { best } => {
                                    let best = best.clone();
                                    CoordinatorMsg::Done { inflight, best }
                                }
                            };
                            if coord_tx.send(msg).is_err() {
                                chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                                permits.on_complete();
                                break;
                            }
                        }
                        Err(e) => {
                            chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                            permits.on_complete();
                            error_slot.set(e);
                            break;
                        }
                    }
                }
            });
        }
        drop(coord_tx);

        // Coordinator: routes rework back to encode, commits completions, and is the only
        // stage that closes the encode channel, once the decoder is done and no chunk is left
        // cycling through encode/metric.
        for msg in coord_rx.iter() {
            if cancelled.load(Ordering::SeqCst) && !error_slot.is_set() {
                error_slot.set(PipelineError::Cancelled);
            }
            match msg {
                CoordinatorMsg::Rework(inflight) => {
                    if error_slot.is_set() {
                        chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                        permits.on_complete();
                    } else if rework_tx.send(inflight).is_err() {
                        chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                        permits.on_complete();
                        break;
                    }
                }
                CoordinatorMsg::Done { inflight, best } => {
                    commit_chunk(cfg, info, inflight, best, dispatcher, permits, crf_tracker, resume, reporter, &error_slot);
                    chunks_in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }

            if decoder_done.load(Ordering::SeqCst) && chunks_in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
        }
        drop(rework_tx);
    });

    if let Some(err) = error_slot.take() {
        return Err(err);
    }
    info!("TQ pipeline complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn commit_chunk(
    cfg: &TqPipelineConfig,
    info: &VideoInfo,
    inflight: InFlight,
    best: Probe,
    dispatcher: &Dispatcher,
    permits: &PermitController,
    crf_tracker: &CrfTracker,
    resume: &ResumeStore,
    reporter: &dyn Reporter,
    error_slot: &ErrorSlot,
) {
    let idx = inflight.chunk.chunk.idx;
    let final_path = cfg.chunk_dir.join(inflight.chunk.chunk.final_filename(cfg.pad_width));

    // §4.7 "one final full-chunk encode": a sample-window probe's file does not cover the
    // whole chunk, so it's re-encoded at the chosen CRF when a window was used; otherwise the
    // best probe file already is the final output.
    let used_sampling = !cfg.disable_sampling
        && plan_sample_window(
            inflight.chunk.frame_count,
            info.fps(),
            cfg.sample_dur_secs,
            cfg.sample_min_chunk_secs,
        )
        .is_some();

    let size = if used_sampling {
        let req = EncodeRequest {
            info,
            color: &inflight.chunk.color,
            width: inflight.chunk.width,
            height: inflight.chunk.height,
            frame_count: inflight.chunk.frame_count,
            crf: best.crf,
        };
        let cmd = encoder::build_command(&req, &cfg.encoder_params, &final_path);
        match encoder::run_encode(cmd, &inflight.chunk.yuv) {
            Ok(()) => std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0),
            Err(e) => {
                permits.on_complete();
                error_slot.set(e);
                return;
            }
        }
    } else {
        let probe_path = cfg
            .chunk_dir
            .join(inflight.chunk.chunk.probe_filename(cfg.pad_width, best.crf.round() as u32));
        if std::fs::rename(&probe_path, &final_path).is_err() {
            let _ = std::fs::copy(&probe_path, &final_path);
        }
        best.size_bytes
    };

    crf_tracker.record(idx, best.crf);
    dispatcher.mark_complete(idx);
    permits.on_complete();
    resume.append(ResumeEntry {
        chunk_idx: idx,
        frames: inflight.chunk.frame_count,
        size_bytes: size,
    });
    reporter.report(Event::ChunkCompleted {
        idx,
        final_crf: best.crf,
        frames: inflight.chunk.frame_count,
        size_bytes: size,
    });
}

/// Decodes the probe's own output and compares it frame-by-frame against the source chunk
/// (skipping the warmup portion of a sample window, if one was used), reducing the per-frame
/// scores to one chunk score via the configured [`MetricMode`].
fn score_probe(
    processor: &mut dyn MetricProcessor,
    inflight: &InFlight,
    probe_path: &std::path::Path,
    window: Option<SampleWindow>,
    mode: MetricMode,
) -> Result<(f64, Vec<f64>), PipelineError> {
    let color = Arc::new(inflight.chunk.color.clone());
    let probe_source = DecodeSource::open(probe_path, color)?;
    let probe_frame_total = media::num_frames(probe_path)?.max(1);
    let probe_chunk = Chunk {
        idx: 0,
        start: 0,
        end: probe_frame_total,
    };
    let decoded_probe = probe_source.decode_chunk(&probe_chunk, None)?;

    let (src_start_frame, probe_skip) = match window {
        Some(w) => (w.offset + w.warmup_frames, w.warmup_frames),
        None => (0, 0),
    };
    let wanted = window.map_or(inflight.chunk.frame_count, |w| w.measure_frames);

    let count = wanted
        .min(decoded_probe.frame_count.saturating_sub(probe_skip))
        .min(inflight.chunk.frame_count.saturating_sub(src_start_frame))
        .max(1);

    let mut per_frame = Vec::with_capacity(count);
    for i in 0..count {
        let src = frame_planes(&inflight.chunk.yuv, inflight.chunk.width, inflight.chunk.height, src_start_frame + i);
        let dst = frame_planes(&decoded_probe.yuv, decoded_probe.width, decoded_probe.height, probe_skip + i);
        let score = processor
            .score(src, dst)
            .map_err(|e| PipelineError::Pipeline(e.to_string()))?;
        per_frame.push(score);
    }

    let reduced = crate::metrics::reduce_scores(&per_frame, mode);
    Ok((reduced, per_frame))
}

/// Slices one frame's Y/U/V planes out of a contiguous 10-bit planar 4:2:0 buffer (§3).
fn frame_planes(buf: &[u8], width: u32, height: u32, frame_idx: usize) -> PlaneTriple<'_> {
    let w = width as usize;
    let h = height as usize;
    let luma_len = w * h * 2;
    let chroma_w = w / 2;
    let chroma_h = h / 2;
    let chroma_len = chroma_w * chroma_h * 2;
    let frame_len = luma_len + 2 * chroma_len;
    let base = frame_idx * frame_len;

    let y = &buf[base..base + luma_len];
    let u = &buf[base + luma_len..base + luma_len + chroma_len];
    let v = &buf[base + luma_len + chroma_len..base + frame_len];

    PlaneTriple {
        y,
        u,
        v,
        stride_y: w * 2,
        stride_uv: chroma_w * 2,
    }
}

fn slice_window(chunk: &DecodedChunk, offset_frames: usize, frame_count: usize) -> &[u8] {
    let frame_bytes = chunk.yuv.len() / chunk.frame_count.max(1);
    let start = offset_frames * frame_bytes;
    let end = (offset_frames + frame_count) * frame_bytes;
    &chunk.yuv[start..end.min(chunk.yuv.len())]
}
