//! Borrowed buffer views passed between stages.
//!
//! A stage hands out a [`Chunk`] that borrows its own memory; the scheduler
//! copies it into the consumer's [`Link`] before calling the producer again.
//! The consumer sees the link through an [`Input`] and reports how much it
//! consumed.

use crate::error::PipelineError;
use crate::format::PcmFormat;

/// Per-channel regions inside one allocation.
///
/// Channel `c` occupies `data[c * stride + start..c * stride + start + len]`.
#[derive(Clone, Copy, Debug)]
pub struct Planes<'a> {
    data: &'a [u8],
    stride: usize,
    start: usize,
    len: usize,
    channels: usize,
}

impl<'a> Planes<'a> {
    pub fn new(data: &'a [u8], stride: usize, len: usize, channels: usize) -> Self {
        debug_assert!(len <= stride || channels <= 1);
        debug_assert!(channels == 0 || (channels - 1) * stride + len <= data.len());
        Self {
            data,
            stride,
            start: 0,
            len,
            channels,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes per channel.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn channel(&self, c: usize) -> &'a [u8] {
        let off = c * self.stride + self.start;
        &self.data[off..off + self.len]
    }

    fn advance(self, n: usize) -> Self {
        let n = n.min(self.len);
        Self {
            start: self.start + n,
            len: self.len - n,
            ..self
        }
    }

    fn truncate(self, n: usize) -> Self {
        Self {
            len: self.len.min(n),
            ..self
        }
    }
}

/// A view of stage output or staged input.
#[derive(Clone, Copy, Debug)]
pub enum Chunk<'a> {
    Interleaved(&'a [u8]),
    Planar(Planes<'a>),
}

impl<'a> Chunk<'a> {
    pub const EMPTY: Chunk<'static> = Chunk::Interleaved(&[]);

    /// Total bytes across all channels.
    pub fn len(&self) -> usize {
        match self {
            Self::Interleaved(b) => b.len(),
            Self::Planar(p) => p.len * p.channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole frames available in `fmt`.
    pub fn frames(&self, fmt: &PcmFormat) -> usize {
        match self {
            Self::Interleaved(b) => b.len() / fmt.frame_size().max(1),
            Self::Planar(p) => p.len / fmt.sample.bytes(),
        }
    }

    /// Bytes of one sample at (`frame`, `channel`).
    pub fn sample(&self, fmt: &PcmFormat, frame: usize, channel: usize) -> &'a [u8] {
        let ss = fmt.sample.bytes();
        match self {
            Self::Interleaved(b) => {
                let off = frame * fmt.frame_size() + channel * ss;
                &b[off..off + ss]
            }
            Self::Planar(p) => {
                let plane = p.channel(channel);
                &plane[frame * ss..frame * ss + ss]
            }
        }
    }

    /// Drop `n` bytes from the front; `n` counts all channels.
    fn advance(self, n: usize) -> Self {
        match self {
            Self::Interleaved(b) => Self::Interleaved(&b[n.min(b.len())..]),
            Self::Planar(p) => Self::Planar(p.advance(n / p.channels.max(1))),
        }
    }

    /// Keep the first `frames` frames.
    pub fn truncate_frames(self, fmt: &PcmFormat, frames: usize) -> Self {
        match self {
            Self::Interleaved(b) => {
                let n = (frames * fmt.frame_size()).min(b.len());
                Self::Interleaved(&b[..n])
            }
            Self::Planar(p) => Self::Planar(p.truncate(frames * fmt.sample.bytes())),
        }
    }
}

/// A stage's view of its pending input.
#[derive(Debug)]
pub struct Input<'a> {
    chunk: Chunk<'a>,
    consumed: usize,
    format: Option<PcmFormat>,
    last: bool,
    reset: bool,
}

impl<'a> Input<'a> {
    pub fn new(chunk: Chunk<'a>, format: Option<PcmFormat>, last: bool) -> Self {
        Self {
            chunk,
            consumed: 0,
            format,
            last,
            reset: false,
        }
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Remaining, not yet consumed data.
    pub fn chunk(&self) -> Chunk<'a> {
        self.chunk
    }

    /// Remaining bytes of an interleaved (raw) input; empty for planar input.
    pub fn bytes(&self) -> &'a [u8] {
        match self.chunk {
            Chunk::Interleaved(b) => b,
            Chunk::Planar(_) => &[],
        }
    }

    /// Mark `n` bytes (all channels) as consumed.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.chunk.len());
        self.chunk = self.chunk.advance(n);
        self.consumed += n;
    }

    pub fn consume_frames(&mut self, fmt: &PcmFormat, frames: usize) {
        self.consume(frames * fmt.frame_size());
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn remaining(&self) -> usize {
        self.chunk.len()
    }

    /// Format of the data, `None` for raw byte streams.
    pub fn format(&self) -> Option<PcmFormat> {
        self.format
    }

    pub(crate) fn require_format(&self, stage: &'static str) -> Result<PcmFormat, PipelineError> {
        self.format
            .ok_or_else(|| PipelineError::protocol(stage, "input has no PCM format"))
    }

    /// Upstream will send nothing after this data.
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// First data after a seek; discard any buffered state.
    pub fn is_reset(&self) -> bool {
        self.reset
    }
}

/// Owned staging area between two stages.
#[derive(Debug, Default)]
pub(crate) struct Link {
    data: Vec<u8>,
    start: usize,
    /// Bytes (interleaved) or bytes per channel (planar).
    len: usize,
    /// Channel count for planar data, 0 for interleaved.
    planes: usize,
    stride: usize,
    pub format: Option<PcmFormat>,
    pub last: bool,
    pub reset: bool,
}

impl Link {
    pub fn view(&self) -> Chunk<'_> {
        if self.planes == 0 {
            return Chunk::Interleaved(&self.data[self.start..self.start + self.len]);
        }
        let mut p = Planes::new(&self.data, self.stride, self.start + self.len, self.planes);
        p = p.advance(self.start);
        Chunk::Planar(p)
    }

    pub fn input(&self) -> Input<'_> {
        Input::new(self.view(), self.format, self.last).with_reset(self.reset)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn consume(&mut self, n: usize) {
        let per = if self.planes == 0 { n } else { n / self.planes };
        let per = per.min(self.len);
        self.start += per;
        self.len -= per;
        if self.len == 0 {
            self.start = 0;
            self.data.clear();
        }
    }

    pub fn append(&mut self, chunk: Chunk<'_>) -> Result<(), PipelineError> {
        match chunk {
            Chunk::Interleaved(b) => {
                if b.is_empty() {
                    return Ok(());
                }
                if self.len == 0 {
                    self.reset_storage();
                } else if self.planes != 0 {
                    return Err(PipelineError::protocol(
                        "scheduler",
                        "interleaved output appended to pending planar data",
                    ));
                } else if self.start > 0 {
                    self.data.drain(..self.start);
                    self.start = 0;
                }
                self.data.extend_from_slice(b);
                self.len += b.len();
            }
            Chunk::Planar(p) => {
                if p.is_empty() {
                    return Ok(());
                }
                if self.len != 0 && (self.planes != p.channels()) {
                    return Err(PipelineError::protocol(
                        "scheduler",
                        "planar output appended to mismatched pending data",
                    ));
                }
                let stride = self.len + p.len();
                let mut data = Vec::with_capacity(stride * p.channels());
                for c in 0..p.channels() {
                    if self.len != 0 {
                        let off = c * self.stride + self.start;
                        data.extend_from_slice(&self.data[off..off + self.len]);
                    }
                    data.extend_from_slice(p.channel(c));
                }
                self.data = data;
                self.start = 0;
                self.len = stride;
                self.stride = stride;
                self.planes = p.channels();
            }
        }
        Ok(())
    }

    /// Move everything pending in `other` behind our own data.
    pub fn take_from(&mut self, other: &mut Link) -> Result<(), PipelineError> {
        self.append(other.view())?;
        if other.format.is_some() {
            self.format = other.format;
        }
        self.last |= other.last;
        self.reset |= other.reset;
        other.clear();
        Ok(())
    }

    /// Drop pending data; flags are left untouched.
    pub fn clear(&mut self) {
        self.reset_storage();
    }

    fn reset_storage(&mut self) {
        self.data.clear();
        self.start = 0;
        self.len = 0;
        self.planes = 0;
        self.stride = 0;
    }
}

/// Owned copy of a chunk, for stages that modify data in place.
#[derive(Debug, Default)]
pub(crate) struct ChunkBuf {
    data: Vec<u8>,
    /// `(bytes per channel, channels)` when planar.
    planar: Option<(usize, usize)>,
}

impl ChunkBuf {
    pub(crate) fn copy_from(&mut self, chunk: Chunk<'_>) {
        self.data.clear();
        match chunk {
            Chunk::Interleaved(b) => {
                self.data.extend_from_slice(b);
                self.planar = None;
            }
            Chunk::Planar(p) => {
                for c in 0..p.channels() {
                    self.data.extend_from_slice(p.channel(c));
                }
                self.planar = Some((p.len(), p.channels()));
            }
        }
    }

    /// All samples, channel regions back to back when planar.
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn view(&self) -> Chunk<'_> {
        match self.planar {
            None => Chunk::Interleaved(&self.data),
            Some((len, channels)) => Chunk::Planar(Planes::new(&self.data, len, len, channels)),
        }
    }
}
