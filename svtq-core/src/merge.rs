//! C10: merger (§4.10).
//!
//! Concatenates per-chunk elementary streams (no re-encode) in `idx` order. Chunk counts
//! above `CONCAT_BATCH_THRESHOLD` are merged in two passes to avoid pathological file-handle
//! or command-line limits on some platforms.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use av_format::buffer::AccReader;
use av_format::demuxer::{Context as DemuxerContext, Event};
use av_format::muxer::Context as MuxerContext;
use av_ivf::demuxer::IvfDemuxer;
use av_ivf::muxer::IvfMuxer;
use tracing::{debug, warn};

/// Above this many chunk files, merge in two passes (§4.10 "e.g. 500").
pub const CONCAT_BATCH_THRESHOLD: usize = 500;

pub fn final_filenames(chunk_dir: &Path, chunk_count: usize, pad_width: usize) -> Vec<PathBuf> {
    (0..chunk_count)
        .map(|idx| chunk_dir.join(format!("{:0width$}.ivf", idx, width = pad_width)))
        .collect()
}

/// Concatenates `files`, already in the desired order, into `out` as one elementary stream.
fn concat_ivf(files: &[PathBuf], out: &Path) -> anyhow::Result<()> {
    if files.is_empty() {
        return Err(anyhow!("no chunk files to concatenate"));
    }

    let output = File::create(out).with_context(|| format!("creating {out:?}"))?;
    let mut muxer = MuxerContext::new(Box::new(IvfMuxer::new()), Box::new(output));

    let global_info = {
        let acc = AccReader::new(File::open(&files[0])?);
        let mut demuxer = DemuxerContext::new(Box::new(IvfDemuxer::new()), Box::new(acc));
        demuxer.read_headers()?;

        let duration = demuxer.info.duration.unwrap_or(0)
            + files
                .iter()
                .skip(1)
                .filter_map(|file| {
                    let acc = AccReader::new(File::open(file).ok()?);
                    let mut demuxer = DemuxerContext::new(Box::new(IvfDemuxer::new()), Box::new(acc));
                    demuxer.read_headers().ok()?;
                    demuxer.info.duration
                })
                .sum::<u64>();

        let mut info = demuxer.info;
        info.duration = Some(duration);
        info
    };

    muxer.set_global_info(global_info)?;
    muxer.configure()?;
    muxer.write_header()?;

    let mut pos_offset: usize = 0;
    for file in files {
        let mut last_pos: usize = 0;
        let acc = AccReader::new(File::open(file).with_context(|| format!("opening {file:?}"))?);
        let mut demuxer = DemuxerContext::new(Box::new(IvfDemuxer::new()), Box::new(acc));
        demuxer.read_headers()?;

        loop {
            match demuxer.read_event() {
                Ok(Event::MoreDataNeeded(sz)) => {
                    return Err(anyhow!("demuxer requested {sz} more bytes mid-stream"))
                }
                Ok(Event::NewPacket(mut packet)) => {
                    if let Some(p) = packet.pos.as_mut() {
                        last_pos = *p;
                        *p += pos_offset;
                    }
                    muxer.write_packet(Arc::new(packet))?;
                }
                Ok(Event::Continue) => continue,
                Ok(Event::Eof) => break,
                Ok(Event::NewStream(_)) => continue,
                Err(e) => {
                    debug!(error = %e, file = ?file, "demuxer stopped early");
                    break;
                }
            }
        }
        pos_offset += last_pos + 1;
    }

    muxer.write_trailer()?;
    Ok(())
}

/// Merges every final chunk file under `chunk_dir` into `out`, in `idx` order, batching in two
/// passes when the chunk count exceeds `CONCAT_BATCH_THRESHOLD`.
pub fn merge(chunk_dir: &Path, out: &Path, chunk_count: usize, pad_width: usize) -> anyhow::Result<()> {
    let files = final_filenames(chunk_dir, chunk_count, pad_width);
    for f in &files {
        if !f.exists() {
            return Err(anyhow!("missing completed chunk file {f:?}"));
        }
    }

    if files.len() <= CONCAT_BATCH_THRESHOLD {
        return concat_ivf(&files, out);
    }

    let batch_dir = chunk_dir.join("concat_batches");
    fs::create_dir_all(&batch_dir).with_context(|| format!("creating {batch_dir:?}"))?;

    let mut batch_outputs = Vec::new();
    for (batch_idx, chunk) in files.chunks(CONCAT_BATCH_THRESHOLD).enumerate() {
        let batch_out = batch_dir.join(format!("batch_{batch_idx:04}.ivf"));
        concat_ivf(chunk, &batch_out)?;
        batch_outputs.push(batch_out);
    }

    let result = concat_ivf(&batch_outputs, out);

    for f in &batch_outputs {
        if let Err(e) = fs::remove_file(f) {
            warn!(error = %e, file = ?f, "failed to clean up intermediate concat batch");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_filenames_are_zero_padded_and_sorted() {
        let names = final_filenames(Path::new("/tmp/chunks"), 3, 4);
        assert_eq!(
            names,
            vec![
                PathBuf::from("/tmp/chunks/0000.ivf"),
                PathBuf::from("/tmp/chunks/0001.ivf"),
                PathBuf::from("/tmp/chunks/0002.ivf"),
            ]
        );
    }

    #[test]
    fn merge_reports_missing_chunk_file() {
        let dir = std::env::temp_dir().join(format!("svtq-merge-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let out = dir.join("out.ivf");
        let err = merge(&dir, &out, 2, 4).unwrap_err();
        assert!(err.to_string().contains("missing completed chunk file"));
        let _ = fs::remove_dir_all(&dir);
    }
}
