//! Read-ahead block cache over an asynchronously read file.
//!
//! The cache owns `buffers` blocks of `buffer_size` bytes. A miss hands one
//! block to the reader thread and reports [`Fetch::Pending`]; the reader wakes
//! the track once the fill lands. At most one fill is in flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::FileInputConfig;
use crate::error::PipelineError;
use crate::source::io::{AlignedBuf, IoWorker, ReadDone, ReadRequest, Shared, open_file};
use crate::track::TrackWaker;

/// Whether a successful fetch may schedule fills for following blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    ReadAhead,
    Single,
}

#[derive(Debug)]
pub enum Fetch<'a> {
    /// Contiguous cached bytes starting at the cursor.
    Data(&'a [u8]),
    /// A fill is in flight; the track will be woken.
    Pending,
    /// The cursor reached end of file.
    Eof,
    /// End of file was already reported and nothing was sought since.
    Done,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Fetches served from a block that was already resident.
    pub cache_hits: u64,
    /// Fills issued to the reader.
    pub reads: u64,
    /// Fetches that had to wait for a fill.
    pub async_waits: u64,
    pub seeks: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    Empty,
    Filling,
    Full,
}

struct Block {
    /// `None` while the reader thread holds the memory.
    buf: Option<AlignedBuf>,
    offset: u64,
    len: usize,
    state: BlockState,
    last_used: u64,
}

impl Block {
    fn covers(&self, pos: u64) -> bool {
        self.state == BlockState::Full && pos >= self.offset && pos < self.offset + self.len as u64
    }
}

enum Decision {
    Serve(usize),
    Wait,
    Issue(usize, u64),
    Eof,
}

pub struct AsyncFileSource {
    path: PathBuf,
    blocks: Vec<Block>,
    block_size: usize,
    max_prebuffer: usize,
    size: Option<u64>,
    /// End offset learned from a short read.
    eof: Option<u64>,
    eof_reported: bool,
    in_flight: bool,
    /// Cursor the consumer is suspended on.
    waiting_for: Option<u64>,
    clock: u64,
    direct: bool,
    stats: SourceStats,
    shared: Arc<Shared>,
    worker: IoWorker,
}

impl AsyncFileSource {
    pub fn open(
        path: &Path,
        cfg: &FileInputConfig,
        waker: TrackWaker,
    ) -> Result<Self, PipelineError> {
        let (file, direct) = open_file(path, cfg.direct_io)?;
        let size = file
            .metadata()
            .map_err(|e| PipelineError::io(format!("stat {}", path.display()), e))?
            .len();

        let mut blocks = Vec::with_capacity(cfg.buffers);
        for _ in 0..cfg.buffers.max(1) {
            blocks.push(Block {
                buf: Some(AlignedBuf::new(cfg.buffer_size, cfg.align)?),
                offset: 0,
                len: 0,
                state: BlockState::Empty,
                last_used: 0,
            });
        }

        let shared = Arc::new(Shared::default());
        let worker = IoWorker::spawn(file, shared.clone(), waker)?;
        tracing::debug!(
            path = %path.display(),
            size,
            direct,
            buffers = blocks.len(),
            buffer_size = cfg.buffer_size,
            "file opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            blocks,
            block_size: cfg.buffer_size,
            max_prebuffer: cfg.max_prebuffer,
            size: Some(size),
            eof: None,
            eof_reported: false,
            in_flight: false,
            waiting_for: None,
            clock: 0,
            direct,
            stats: SourceStats::default(),
            shared,
            worker,
        })
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// A fill has been handed to the reader and not collected yet.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Reposition the logical cursor; resident blocks stay usable.
    pub fn seek(&mut self, offset: u64) {
        self.stats.seeks += 1;
        self.eof_reported = false;
        self.waiting_for = None;
        for b in &mut self.blocks {
            if !b.covers(offset) {
                b.last_used = 0;
            }
        }
    }

    pub fn get_data(&mut self, cursor: u64, mode: ReadMode) -> Result<Fetch<'_>, PipelineError> {
        let slot = loop {
            let done = self.shared.lock().completed.take();
            if let Some(done) = done {
                self.collect(done)?;
            }

            match self.decide(cursor) {
                Decision::Serve(slot) => break slot,
                Decision::Eof => {
                    if self.eof_reported {
                        return Ok(Fetch::Done);
                    }
                    self.eof_reported = true;
                    return Ok(Fetch::Eof);
                }
                Decision::Issue(slot, offset) => {
                    self.issue(slot, offset)?;
                }
                Decision::Wait => {}
            }

            let mut st = self.shared.lock();
            if st.completed.is_some() {
                continue;
            }
            st.want_read = true;
            drop(st);
            if self.waiting_for != Some(cursor) {
                self.stats.async_waits += 1;
                self.waiting_for = Some(cursor);
            }
            return Ok(Fetch::Pending);
        };

        if self.waiting_for.take() != Some(cursor) {
            self.stats.cache_hits += 1;
        }
        self.clock += 1;
        self.blocks[slot].last_used = self.clock;
        let block_off = self.blocks[slot].offset;
        if mode == ReadMode::ReadAhead {
            self.read_ahead(block_off)?;
        }

        let b = &self.blocks[slot];
        let start = (cursor - b.offset) as usize;
        match &b.buf {
            Some(buf) => Ok(Fetch::Data(&buf.as_slice()[start..b.len])),
            None => Err(PipelineError::protocol("in.file", "served block has no memory")),
        }
    }

    fn end(&self) -> Option<u64> {
        match (self.eof, self.size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn block_offset(&self, pos: u64) -> u64 {
        pos / self.block_size as u64 * self.block_size as u64
    }

    fn decide(&self, cursor: u64) -> Decision {
        if self.end().is_some_and(|end| cursor >= end) {
            return Decision::Eof;
        }
        if let Some(slot) = self.blocks.iter().position(|b| b.covers(cursor)) {
            return Decision::Serve(slot);
        }
        let want = self.block_offset(cursor);
        if self.in_flight {
            return Decision::Wait;
        }
        match self.victim(want, want + self.block_size as u64) {
            Some(slot) => Decision::Issue(slot, want),
            None => Decision::Wait,
        }
    }

    /// Pick a block to refill, avoiding those inside `[keep_from, keep_to)`.
    fn victim(&self, keep_from: u64, keep_to: u64) -> Option<usize> {
        if let Some(slot) = self.blocks.iter().position(|b| b.state == BlockState::Empty) {
            return Some(slot);
        }
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Full)
            .filter(|(_, b)| b.offset < keep_from || b.offset >= keep_to)
            .min_by_key(|(_, b)| b.last_used)
            .map(|(slot, _)| slot)
    }

    fn issue(&mut self, slot: usize, offset: u64) -> Result<(), PipelineError> {
        let block = &mut self.blocks[slot];
        let buf = block
            .buf
            .take()
            .ok_or_else(|| PipelineError::protocol("in.file", "block already being filled"))?;
        block.state = BlockState::Filling;
        block.offset = offset;
        block.len = 0;
        self.in_flight = true;
        self.stats.reads += 1;
        tracing::trace!(slot, offset, "fill issued");
        self.worker.submit(ReadRequest { slot, offset, buf })
    }

    fn collect(&mut self, done: ReadDone) -> Result<(), PipelineError> {
        self.in_flight = false;
        let block = &mut self.blocks[done.slot];
        block.buf = Some(done.buf);
        match done.result {
            Ok(n) => {
                block.len = n;
                block.state = BlockState::Full;
                if n < self.block_size {
                    self.eof = Some(done.offset + n as u64);
                }
                if n == 0 {
                    block.state = BlockState::Empty;
                }
                Ok(())
            }
            Err(e) => {
                block.state = BlockState::Empty;
                Err(PipelineError::io(
                    format!("read {} at {}", self.path.display(), done.offset),
                    e,
                ))
            }
        }
    }

    /// Schedule the next missing block after `from` while under the prebuffer bound.
    fn read_ahead(&mut self, from: u64) -> Result<(), PipelineError> {
        if self.in_flight {
            return Ok(());
        }
        let step = self.block_size as u64;
        let mut next = from + step;
        let mut ahead = 0;
        loop {
            if self.end().is_some_and(|end| next >= end) || ahead >= self.max_prebuffer {
                return Ok(());
            }
            let resident = self
                .blocks
                .iter()
                .any(|b| b.state != BlockState::Empty && b.offset == next);
            if !resident {
                break;
            }
            ahead += 1;
            next += step;
        }
        if let Some(slot) = self.victim(from, next) {
            self.issue(slot, next)?;
        }
        Ok(())
    }

    /// Block until the in-flight fill completes.
    #[cfg(test)]
    pub(crate) fn settle(&self) {
        if self.in_flight {
            self.shared.wait_completed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Track, TrackEvent};
    use std::io::Write;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn temp_file(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let data = pattern(len);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        (f, data)
    }

    fn fetch_data(src: &mut AsyncFileSource, cursor: u64) -> Vec<u8> {
        match src.get_data(cursor, ReadMode::ReadAhead).unwrap() {
            Fetch::Data(d) => d.to_vec(),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn read_ahead_and_seek_hit_cached_blocks() {
        let (f, data) = temp_file(200_000);
        let track = Track::new(1);
        let cfg = FileInputConfig::default();
        let mut src = AsyncFileSource::open(f.path(), &cfg, track.waker()).unwrap();

        assert!(matches!(src.get_data(0, ReadMode::ReadAhead).unwrap(), Fetch::Pending));
        assert_eq!(
            track.wait_event(Some(Duration::from_secs(5))),
            Some(TrackEvent::Resume)
        );

        let first = fetch_data(&mut src, 0);
        assert_eq!(first.len(), 65_536);
        assert_eq!(first, data[..65_536]);

        // Block 1 was prefetched while block 0 was served.
        src.settle();
        let waits = src.stats().async_waits;
        let second = fetch_data(&mut src, 65_536);
        assert_eq!(second, data[65_536..131_072]);
        assert_eq!(src.stats().async_waits, waits);

        src.settle();
        let before = src.stats();
        src.seek(10_000);
        let again = fetch_data(&mut src, 10_000);
        assert_eq!(again, data[10_000..65_536]);
        let after = src.stats();
        assert_eq!(after.seeks, 1);
        assert_eq!(after.reads, before.reads);
        assert_eq!(after.async_waits, before.async_waits);
        assert_eq!(after.cache_hits, before.cache_hits + 1);
    }

    #[test]
    fn eof_is_reported_once_then_done() {
        let (f, data) = temp_file(1000);
        let track = Track::new(1);
        let cfg = FileInputConfig {
            direct_io: false,
            ..Default::default()
        };
        let mut src = AsyncFileSource::open(f.path(), &cfg, track.waker()).unwrap();
        assert!(matches!(src.get_data(0, ReadMode::Single).unwrap(), Fetch::Pending));
        src.settle();
        assert_eq!(fetch_data(&mut src, 0), data);

        assert!(matches!(src.get_data(1000, ReadMode::Single).unwrap(), Fetch::Eof));
        assert!(matches!(src.get_data(1000, ReadMode::Single).unwrap(), Fetch::Done));
        let reads = src.stats().reads;
        assert!(matches!(src.get_data(1000, ReadMode::Single).unwrap(), Fetch::Done));
        assert_eq!(src.stats().reads, reads);

        src.seek(1000);
        assert!(matches!(src.get_data(1000, ReadMode::Single).unwrap(), Fetch::Eof));
    }

    #[test]
    fn at_most_one_fill_in_flight() {
        let (f, _) = temp_file(300_000);
        let track = Track::new(1);
        let cfg = FileInputConfig {
            direct_io: false,
            ..Default::default()
        };
        let mut src = AsyncFileSource::open(f.path(), &cfg, track.waker()).unwrap();
        assert!(matches!(src.get_data(0, ReadMode::ReadAhead).unwrap(), Fetch::Pending));
        let reads = src.stats().reads;
        // A second miss elsewhere must not issue another fill while one is pending.
        if let Fetch::Pending = src.get_data(200_000, ReadMode::ReadAhead).unwrap() {
            assert!(src.stats().reads <= reads + 1);
        }
        let filling = src
            .blocks
            .iter()
            .filter(|b| b.state == BlockState::Filling)
            .count();
        assert!(filling <= 1);
    }

    #[test]
    fn resume_is_sent_once_per_completed_fill() {
        let (f, _) = temp_file(4096);
        let track = Track::new(1);
        let cfg = FileInputConfig {
            direct_io: false,
            ..Default::default()
        };
        let mut src = AsyncFileSource::open(f.path(), &cfg, track.waker()).unwrap();
        assert!(matches!(src.get_data(0, ReadMode::Single).unwrap(), Fetch::Pending));
        assert_eq!(
            track.wait_event(Some(Duration::from_secs(5))),
            Some(TrackEvent::Resume)
        );
        assert_eq!(track.wait_event(Some(Duration::from_millis(50))), None);
        assert!(matches!(src.get_data(0, ReadMode::Single).unwrap(), Fetch::Data(_)));
    }

    #[test]
    fn missing_file_is_source_absent() {
        let dir = tempfile::tempdir().unwrap();
        let track = Track::new(1);
        let err = AsyncFileSource::open(
            &dir.path().join("absent.flac"),
            &FileInputConfig::default(),
            track.waker(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::SourceAbsent);
    }
}
