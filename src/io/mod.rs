use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use memmap2::{Mmap, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cube::{ChunkData, ChunkId};
use crate::error::CubeError;

/// Number of ticks the terminal bar uses to represent the range [0, 1].
pub const PROGRESS_TICKS: u64 = 1000;

/// Read-only memory map over an input file.
pub struct ChunkFileReader {
    mmap: Option<Mmap>,
    len: usize,
}

impl ChunkFileReader {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CubeError> {
        let path = path.as_ref();
        let open_err = |source| CubeError::Open {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len() as usize;

        // Zero-length files cannot be mapped on every platform.
        if len == 0 {
            return Ok(Self { mmap: None, len });
        }

        let mmap = unsafe { MmapOptions::new().map(&file).map_err(open_err)? };

        Ok(Self {
            mmap: Some(mmap),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes in `[offset, offset + len)`, truncated at end of file.
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let mmap = self.mmap.as_ref()?;
        if offset >= self.len {
            return None;
        }

        let end = (offset + len).min(self.len);
        Some(&mmap[offset..end])
    }
}

/// Writes chunks at arbitrary offsets of one output file.
///
/// Writes take `&self` so every worker can share one writer; callers hold
/// the run's sink lock around each `write_chunk`.
pub struct ChunkWriter {
    file: File,
    chunks_written: AtomicUsize,
}

impl ChunkWriter {
    pub fn new<P: AsRef<Path>>(path: P, total_len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(total_len)?;

        Ok(Self {
            file,
            chunks_written: AtomicUsize::new(0),
        })
    }

    pub fn write_chunk(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.chunks_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written.load(Ordering::SeqCst)
    }

    pub fn finish(self) -> io::Result<usize> {
        self.file.sync_all()?;
        Ok(self.chunks_written())
    }
}

/// Directory holding the chunks materialized by one worker process.
pub fn worker_dir(work_dir: &Path, worker: usize) -> PathBuf {
    work_dir.join(format!("worker-{worker}"))
}

/// Per-worker chunk files under `<work_dir>/worker-<k>/`.
#[derive(Debug, Clone)]
pub struct WorkerStore {
    dir: PathBuf,
}

impl WorkerStore {
    pub fn open(work_dir: &Path, worker: usize) -> Self {
        Self {
            dir: worker_dir(work_dir, worker),
        }
    }

    pub fn create(work_dir: &Path, worker: usize) -> io::Result<Self> {
        let store = Self::open(work_dir, worker);
        fs::create_dir_all(&store.dir)?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, id: ChunkId) -> PathBuf {
        self.dir.join(format!("chunk-{id}.bin"))
    }

    pub fn store(&self, id: ChunkId, data: &ChunkData) -> io::Result<()> {
        fs::write(self.chunk_path(id), data.as_bytes())
    }

    pub fn load(&self, id: ChunkId) -> io::Result<ChunkData> {
        fs::read(self.chunk_path(id)).map(ChunkData::new)
    }
}

pub fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::with_draw_target(Some(PROGRESS_TICKS), ProgressDrawTarget::stderr());
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}
