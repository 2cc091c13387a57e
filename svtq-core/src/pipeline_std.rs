//! C6: standard encoder pipeline (§4.6). Encodes every chunk once at a fixed CRF chosen by
//! width category. Three roles: a single decoder loop, `workers` encoder threads, and a single
//! collector, connected by bounded channels.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use tracing::{debug, info};

use crate::chunk::{Chunk, CropRect, DecodedChunk, VideoInfo};
use crate::decode::DecodeSource;
use crate::dispatcher::Dispatcher;
use crate::encoder::{self, EncodeRequest, EncoderParams, WidthCategory};
use crate::error::{ErrorSlot, PipelineError};
use crate::permits::PermitController;
use crate::reporter::{Event, Reporter};
use crate::resume::{ResumeEntry, ResumeStore};

pub struct StdPipelineConfig {
    pub workers: usize,
    pub chunk_dir: PathBuf,
    pub pad_width: usize,
    pub sd_crf: f64,
    pub hd_crf: f64,
    pub uhd_crf: f64,
    pub encoder_params: EncoderParams,
}

/// Runs the standard pipeline to completion. `already_done` is the set of chunk indices the
/// resume store already has output for; those are skipped entirely without touching the
/// decoder or the permit controller.
#[allow(clippy::too_many_arguments)]
pub fn run(
    cfg: &StdPipelineConfig,
    info: &VideoInfo,
    crop: Option<&CropRect>,
    source: &DecodeSource,
    dispatcher: &Dispatcher,
    permits: &PermitController,
    resume: &ResumeStore,
    already_done: &std::collections::BTreeSet<usize>,
    reporter: &dyn Reporter,
    cancelled: &AtomicBool,
) -> Result<(), PipelineError> {
    let error_slot = Arc::new(ErrorSlot::new());
    let (work_tx, work_rx) = bounded::<DecodedChunk>(cfg.workers.max(1));
    let (result_tx, result_rx) = bounded::<(Chunk, u64)>(cfg.workers.max(1));

    let category = WidthCategory::for_width(info.width);
    let crf = encoder::default_crf(category, cfg.sd_crf, cfg.hd_crf, cfg.uhd_crf);

    // Decoder loop, `workers` encoder threads, and the collector all run concurrently inside
    // one scope so decoded chunks are encoded as they arrive rather than batched up front.
    thread::scope(|scope| {
        scope.spawn(|| {
            let tx = work_tx;
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
                        if tx.send(decoded).is_err() {
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
            // `tx` drops here, closing the work channel once the dispatcher is empty.
        });

        for worker_idx in 0..cfg.workers.max(1) {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let error_slot = Arc::clone(&error_slot);
            scope.spawn(move || {
                for decoded in work_rx.iter() {
                    if error_slot.is_set() || cancelled.load(Ordering::SeqCst) {
                        permits.on_complete();
                        break;
                    }
                    let output_path = cfg.chunk_dir.join(decoded.chunk.final_filename(cfg.pad_width));
                    let req = EncodeRequest {
                        info,
                        color: &decoded.color,
                        width: decoded.width,
                        height: decoded.height,
                        frame_count: decoded.frame_count,
                        crf,
                    };
                    let cmd = encoder::build_command(&req, &cfg.encoder_params, &output_path);
                    match encoder::run_encode(cmd, &decoded.yuv) {
                        Ok(()) => {
                            let size = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
                            debug!(worker_idx, idx = decoded.chunk.idx, size, "chunk encoded");
                            if result_tx.send((decoded.chunk, size)).is_err() {
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
            });
        }
        drop(result_tx);

        for (chunk, size) in result_rx.iter() {
            dispatcher.mark_complete(chunk.idx);
            permits.on_complete();
            resume.append(ResumeEntry {
                chunk_idx: chunk.idx,
                frames: chunk.frames(),
                size_bytes: size,
            });
            reporter.report(Event::ChunkCompleted {
                idx: chunk.idx,
                final_crf: crf,
                frames: chunk.frames(),
                size_bytes: size,
            });
        }
    });

    if let Some(err) = error_slot.take() {
        return Err(err);
    }
    info!("standard pipeline complete");
    Ok(())
}

pub fn chunk_path(dir: &Path, chunk: &Chunk, pad_width: usize) -> PathBuf {
    dir.join(chunk.final_filename(pad_width))
}
