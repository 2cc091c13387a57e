//! C9: resume store (§4.9).
//!
//! An append-only, line-delimited log of completed chunks. Reading tolerates a truncated
//! trailing line (crash mid-write); writing is best-effort — a failed append is logged and
//! swallowed rather than failing the encode (§7).

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeEntry {
    pub chunk_idx: usize,
    pub frames: usize,
    pub size_bytes: u64,
}

impl ResumeEntry {
    fn to_line(self) -> String {
        format!("{}\t{}\t{}\n", self.chunk_idx, self.frames, self.size_bytes)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end().splitn(3, '\t');
        let chunk_idx = fields.next()?.parse().ok()?;
        let frames = fields.next()?.parse().ok()?;
        let size_bytes = fields.next()?.parse().ok()?;
        Some(Self {
            chunk_idx,
            frames,
            size_bytes,
        })
    }
}

/// Everything recovered from a prior session's log on startup.
pub struct ResumeState {
    pub done: BTreeSet<usize>,
    pub total_frames: usize,
    pub total_bytes: u64,
}

/// Reads the log at `path`, tolerating a missing file (fresh session) and a truncated final
/// line (crash during the last append).
pub fn load(path: &Path) -> std::io::Result<ResumeState> {
    let mut state = ResumeState {
        done: BTreeSet::new(),
        total_frames: 0,
        total_bytes: 0,
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(e),
    };

    for line in BufReader::new(file).lines() {
        let line = line?;
        match ResumeEntry::parse_line(&line) {
            Some(entry) => {
                if state.done.insert(entry.chunk_idx) {
                    state.total_frames += entry.frames;
                    state.total_bytes += entry.size_bytes;
                }
            }
            None => {
                if !line.trim().is_empty() {
                    warn!(%line, "ignoring malformed resume log line (likely crash-truncated)");
                }
            }
        }
    }

    Ok(state)
}

/// Thread-safe append handle for the session in progress.
pub struct ResumeStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ResumeStore {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Never returns an error to the caller: failures are logged and
    /// swallowed, since the worst consequence is re-encoding that chunk on the next run.
    pub fn append(&self, entry: ResumeEntry) {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return;
        };
        let line = entry.to_line();
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, chunk_idx = entry.chunk_idx, "resume append failed, chunk will re-encode on restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn roundtrip_entry_line() {
        let entry = ResumeEntry {
            chunk_idx: 42,
            frames: 500,
            size_bytes: 123_456,
        };
        let parsed = ResumeEntry::parse_line(entry.to_line().trim_end()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn missing_file_loads_empty_state() {
        let state = load(Path::new("/nonexistent/path/resume.log")).unwrap();
        assert!(state.done.is_empty());
        assert_eq!(state.total_frames, 0);
    }

    #[test]
    fn tolerates_truncated_trailing_line() {
        let dir = std::env::temp_dir().join(format!("svtq-resume-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("resume.log");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "0\t100\t5000").unwrap();
            writeln!(f, "1\t100\t5100").unwrap();
            write!(f, "2\t50").unwrap(); // truncated, no trailing newline or size field
        }

        let state = load(&path).unwrap();
        assert_eq!(state.done, BTreeSet::from([0, 1]));
        assert_eq!(state.total_frames, 200);
        assert_eq!(state.total_bytes, 10_100);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplicate_entries_count_once() {
        let dir = std::env::temp_dir().join(format!("svtq-resume-test-dup-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("resume.log");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "0\t100\t5000").unwrap();
            writeln!(f, "0\t100\t5000").unwrap();
        }

        let state = load(&path).unwrap();
        assert_eq!(state.done.len(), 1);
        assert_eq!(state.total_frames, 100);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_then_reload_round_trips() {
        let dir = std::env::temp_dir().join(format!("svtq-resume-test-append-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("resume.log");

        let store = ResumeStore::open(&path).unwrap();
        store.append(ResumeEntry {
            chunk_idx: 3,
            frames: 250,
            size_bytes: 9000,
        });
        drop(store);

        let state = load(&path).unwrap();
        assert!(state.done.contains(&3));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
