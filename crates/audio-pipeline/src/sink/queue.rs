//! Bounded sample queue between the device sink and the output callback.
//!
//! The pipeline side never blocks: when the queue is full it registers the
//! track's waker and suspends. The callback side pops without waiting and
//! wakes the track once it has made room.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::track::TrackWaker;

/// Queue capacity in samples for `seconds` of audio.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub(crate) fn calc_max_buffered_samples(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

struct Inner {
    queue: VecDeque<f32>,
    /// Samples popped by the callback that it has not played yet.
    held: usize,
    closed: bool,
    waiter: Option<TrackWaker>,
}

/// Interleaved `f32` samples with a fixed channel count.
pub(crate) struct SampleQueue {
    channels: usize,
    max_samples: usize,
    inner: Mutex<Inner>,
}

impl SampleQueue {
    pub(crate) fn new(channels: usize, max_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            max_samples: max_samples.max(channels),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                held: 0,
                closed: false,
                waiter: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels
    }

    pub(crate) fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    /// Push as many whole frames as fit; returns the number of samples taken.
    ///
    /// If not everything fit, `waker` fires once room has been made.
    pub(crate) fn push_available(&self, samples: &[f32], waker: &TrackWaker) -> usize {
        let mut g = self.lock();
        if g.closed {
            return samples.len();
        }
        let room = self.max_samples.saturating_sub(g.queue.len());
        let take = room.min(samples.len()) / self.channels * self.channels;
        g.queue.extend(&samples[..take]);
        if take < samples.len() {
            g.waiter = Some(waker.clone());
        }
        take
    }

    /// Pop up to `max_frames` frames into `out` without waiting.
    ///
    /// The popped samples count as held until [`SampleQueue::set_held`]
    /// reports them played.
    pub(crate) fn pop_into(&self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        let mut g = self.lock();
        let frames = (g.queue.len() / self.channels).min(max_frames);
        out.extend(g.queue.drain(..frames * self.channels));
        g.held = frames * self.channels;
        let waiter = if frames > 0 { g.waiter.take() } else { None };
        drop(g);
        if let Some(w) = waiter {
            w.wake();
        }
        frames
    }

    /// Record how many popped samples the callback still has to play.
    ///
    /// Wakes a waiting [`SampleQueue::drained`] once nothing is left anywhere.
    pub(crate) fn set_held(&self, samples: usize) {
        let mut g = self.lock();
        g.held = samples;
        let waiter = if samples == 0 && g.queue.is_empty() {
            g.waiter.take()
        } else {
            None
        };
        drop(g);
        if let Some(w) = waiter {
            w.wake();
        }
    }

    /// Whether everything pushed has been played; registers `waker` if not.
    pub(crate) fn drained(&self, waker: &TrackWaker) -> bool {
        let mut g = self.lock();
        if (g.queue.is_empty() && g.held == 0) || g.closed {
            return true;
        }
        g.waiter = Some(waker.clone());
        false
    }

    /// Drop everything queued, e.g. after a seek.
    pub(crate) fn clear(&self) {
        self.lock().queue.clear();
    }

    /// Stop accepting samples and release any waiter.
    pub(crate) fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        g.queue.clear();
        let waiter = g.waiter.take();
        drop(g);
        if let Some(w) = waiter {
            w.wake();
        }
    }
}
