//! Aligned block memory and the background reader thread.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use crate::error::{PipelineError, alloc_zeroed};
use crate::track::TrackWaker;

/// Heap buffer whose usable region starts at an `align`-byte boundary.
pub(crate) struct AlignedBuf {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    pub(crate) fn new(len: usize, align: usize) -> Result<Self, PipelineError> {
        let align = align.max(1);
        let raw = alloc_zeroed(len + align - 1, "file input buffer")?;
        let offset = raw.as_ptr().align_offset(align);
        if offset >= align {
            return Err(PipelineError::Resource {
                context: format!("cannot align buffer to {align} bytes"),
            });
        }
        Ok(Self { raw, offset, len })
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }
}

/// Open `path` for reading, bypassing the page cache when `direct` is set.
///
/// Returns the file and whether direct I/O is actually in effect.
pub(crate) fn open_file(path: &Path, direct: bool) -> Result<(File, bool), PipelineError> {
    if direct {
        match open_direct(path) {
            Ok(Some(f)) => return Ok((f, true)),
            Ok(None) => {}
            Err(e) if e.raw_os_error() == Some(einval()) => {
                tracing::warn!(path = %path.display(), "direct I/O not supported, using buffered reads");
            }
            Err(e) => return Err(PipelineError::open(path, e)),
        }
    }
    let file = File::open(path).map_err(|e| PipelineError::open(path, e))?;
    Ok((file, false))
}

#[cfg(target_os = "linux")]
fn open_direct(path: &Path) -> io::Result<Option<File>> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
        .map(Some)
}

#[cfg(target_os = "macos")]
fn open_direct(path: &Path) -> io::Result<Option<File>> {
    use std::os::fd::AsRawFd;
    let file = File::open(path)?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if rc == -1 {
        tracing::warn!(path = %path.display(), "F_NOCACHE failed: {}", io::Error::last_os_error());
    }
    Ok(Some(file))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_direct(_path: &Path) -> io::Result<Option<File>> {
    Ok(None)
}

#[cfg(unix)]
fn einval() -> i32 {
    libc::EINVAL
}

#[cfg(not(unix))]
fn einval() -> i32 {
    87 // ERROR_INVALID_PARAMETER
}

/// One positioned read. A result shorter than `buf` means end of file.
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        #[cfg(unix)]
        let r = std::os::unix::fs::FileExt::read_at(file, buf, offset);
        #[cfg(windows)]
        let r = std::os::windows::fs::FileExt::seek_read(file, buf, offset);
        match r {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub(crate) struct ReadRequest {
    pub slot: usize,
    pub offset: u64,
    pub buf: AlignedBuf,
}

pub(crate) struct ReadDone {
    pub slot: usize,
    pub offset: u64,
    pub buf: AlignedBuf,
    pub result: io::Result<usize>,
}

/// State shared between the source and its reader thread.
#[derive(Default)]
pub(crate) struct FillState {
    pub completed: Option<ReadDone>,
    /// The consumer is suspended waiting for a fill.
    pub want_read: bool,
}

#[derive(Default)]
pub(crate) struct Shared {
    state: Mutex<FillState>,
    cv: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, FillState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a completed fill is waiting.
    pub(crate) fn wait_completed(&self) {
        let mut st = self.lock();
        while st.completed.is_none() {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Thread that services one fill request at a time.
pub(crate) struct IoWorker {
    tx: Option<Sender<ReadRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    pub(crate) fn spawn(
        file: File,
        shared: Arc<Shared>,
        waker: TrackWaker,
    ) -> Result<Self, PipelineError> {
        let (tx, rx) = crossbeam_channel::bounded::<ReadRequest>(1);
        let handle = thread::Builder::new()
            .name("file-input".into())
            .spawn(move || {
                for mut req in rx {
                    let result = read_at(&file, req.buf.as_mut_slice(), req.offset);
                    let mut st = shared.lock();
                    st.completed = Some(ReadDone {
                        slot: req.slot,
                        offset: req.offset,
                        buf: req.buf,
                        result,
                    });
                    let wake = std::mem::take(&mut st.want_read);
                    drop(st);
                    shared.cv.notify_all();
                    if wake {
                        waker.wake();
                    }
                }
            })
            .map_err(|e| PipelineError::io("spawn file reader", e))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn submit(&self, req: ReadRequest) -> Result<(), PipelineError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::protocol("in.file", "reader already stopped"))?;
        tx.send(req)
            .map_err(|_| PipelineError::protocol("in.file", "reader thread exited"))
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("file reader thread panicked");
            }
        }
    }
}
