//! Per-track shared state.
//!
//! A [`Track`] is the only state stages share. It carries seek requests,
//! position bookkeeping, push-down format requests and the event channel
//! used to resume a suspended scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::format::{FormatRequest, PcmFormat};

/// A seek target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    Frames(u64),
    Time(Duration),
}

impl Position {
    pub fn to_frames(self, rate: u32) -> u64 {
        match self {
            Self::Frames(f) => f,
            Self::Time(d) => (d.as_secs_f64() * rate as f64).round() as u64,
        }
    }
}

/// Messages delivered to a track's scheduler from other threads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackEvent {
    /// A pending operation completed; run the scheduler again.
    Resume,
    /// Stop was requested.
    Stop,
    /// Reposition the stream.
    Seek(Position),
}

/// Cloneable handle that wakes a suspended track.
#[derive(Clone, Debug)]
pub struct TrackWaker {
    tx: Sender<TrackEvent>,
}

impl TrackWaker {
    pub fn wake(&self) {
        // The receiver lives as long as the track; a send error only means it is gone.
        let _ = self.tx.send(TrackEvent::Resume);
    }
}

/// Cloneable handle that asks a track to stop.
#[derive(Clone, Debug)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    tx: Sender<TrackEvent>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(TrackEvent::Stop);
    }

    pub fn seek(&self, pos: Position) {
        let _ = self.tx.send(TrackEvent::Seek(pos));
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Receives metadata tags found while decoding.
pub trait MetaSink {
    fn set(&mut self, key: &str, value: &str);
}

impl<F> MetaSink for F
where
    F: FnMut(&str, &str),
{
    fn set(&mut self, key: &str, value: &str) {
        self(key, value)
    }
}

pub struct Track {
    id: u64,
    /// Input file.
    pub input: Option<PathBuf>,
    /// Output file for file-writing sinks.
    pub output: Option<PathBuf>,
    /// Pending user-level seek, consumed by the decoder.
    pub seek_request: Option<Position>,
    /// Pending byte offset for the source, set by the decoder.
    pub input_seek: Option<u64>,
    /// Total frames, if known.
    pub total_length: Option<u64>,
    /// Frame position of the most recent decoded data.
    pub current_position: u64,
    /// Source frame the decoder last repositioned to.
    pub seeked_to: Option<u64>,
    /// Input size in bytes, if known.
    pub input_size: Option<u64>,
    /// Stop after reading the header.
    pub info_only: bool,
    /// Format reported by the decoder.
    pub source_format: Option<PcmFormat>,
    /// Codec name reported by the decoder.
    pub codec: Option<String>,
    requests: Vec<(usize, FormatRequest)>,
    meta: Option<Box<dyn MetaSink>>,
    stop: Arc<AtomicBool>,
    tx: Sender<TrackEvent>,
    rx: Receiver<TrackEvent>,
}

impl Track {
    pub fn new(id: u64) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            id,
            input: None,
            output: None,
            seek_request: None,
            input_seek: None,
            total_length: None,
            current_position: 0,
            seeked_to: None,
            input_size: None,
            info_only: false,
            source_format: None,
            codec: None,
            requests: Vec::new(),
            meta: None,
            stop: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = Some(path.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn with_meta_sink(mut self, sink: impl MetaSink + 'static) -> Self {
        self.meta = Some(Box::new(sink));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Forward one tag to the metadata sink.
    pub fn set_meta(&mut self, key: &str, value: &str) {
        match self.meta.as_mut() {
            Some(sink) => sink.set(key, value),
            None => tracing::debug!(key, value, "tag"),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn waker(&self) -> TrackWaker {
        TrackWaker {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn post_request(&mut self, index: usize, req: FormatRequest) {
        match self.requests.iter_mut().find(|(i, _)| *i == index) {
            Some((_, r)) => {
                r.sample = req.sample.or(r.sample);
                r.channels = req.channels.or(r.channels);
                r.rate = req.rate.or(r.rate);
                r.layout = req.layout.or(r.layout);
            }
            None => self.requests.push((index, req)),
        }
    }

    /// Take one field of the nearest downstream request after `index`.
    pub(crate) fn take_request<T>(
        &mut self,
        index: usize,
        field: impl Fn(&mut FormatRequest) -> &mut Option<T>,
    ) -> Option<T> {
        let mut best: Option<usize> = None;
        for pos in 0..self.requests.len() {
            let i = self.requests[pos].0;
            if i <= index || field(&mut self.requests[pos].1).is_none() {
                continue;
            }
            if best.is_none_or(|b| i < self.requests[b].0) {
                best = Some(pos);
            }
        }
        field(&mut self.requests[best?].1).take()
    }

    pub(crate) fn try_event(&self) -> Option<TrackEvent> {
        self.rx.try_recv().ok()
    }

    /// Block until an event arrives or `timeout` passes.
    pub(crate) fn wait_event(&self, timeout: Option<Duration>) -> Option<TrackEvent> {
        match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(ev) => Some(ev),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            // The track owns a sender, so the channel never disconnects here.
            None => self.rx.recv().ok(),
        }
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("seek_request", &self.seek_request)
            .field("total_length", &self.total_length)
            .field("current_position", &self.current_position)
            .finish_non_exhaustive()
    }
}
