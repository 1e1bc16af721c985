//! `filter.peaks`: per-channel peak, average level and clipping count.

use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::{Chunk, ChunkBuf};
use crate::error::PipelineError;
use crate::filter::{frames_ready, no_frames};
use crate::format::{FormatRequest, Layout, SampleFormat};
use crate::pcm;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "filter.peaks";

/// Levels of one channel, normalized to full scale.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelPeaks {
    pub highest: f64,
    pub average: f64,
    pub clipped: u64,
}

impl ChannelPeaks {
    pub fn highest_db(&self) -> f64 {
        pcm::gain_to_db(self.highest)
    }

    pub fn average_db(&self) -> f64 {
        pcm::gain_to_db(self.average)
    }
}

/// Where the filter leaves its results when the track closes.
#[derive(Clone, Debug, Default)]
pub struct PeaksHandle {
    inner: Arc<Mutex<Vec<ChannelPeaks>>>,
}

impl PeaksHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> Vec<ChannelPeaks> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct PeaksFactory {
    handle: PeaksHandle,
}

impl PeaksFactory {
    pub fn new() -> Self {
        Self::with_handle(PeaksHandle::new())
    }

    pub fn with_handle(handle: PeaksHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> PeaksHandle {
        self.handle.clone()
    }
}

impl Default for PeaksFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for PeaksFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(Peaks {
            handle: self.handle.clone(),
            requested: false,
            probed: false,
            acc: Vec::new(),
            buf: ChunkBuf::default(),
        }))
    }
}

#[derive(Clone, Copy, Default)]
struct Acc {
    highest: f64,
    sum: f64,
    frames: u64,
    clipped: u64,
}

struct Peaks {
    handle: PeaksHandle,
    requested: bool,
    probed: bool,
    acc: Vec<Acc>,
    buf: ChunkBuf,
}

impl Stage for Peaks {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        // Levels live in the accumulators, so stopping loses no output.
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        if !self.requested {
            self.requested = true;
            cx.request_format(FormatRequest {
                sample: Some(SampleFormat::I16),
                layout: Some(Layout::Planar),
                ..Default::default()
            });
        }
        let Some((fmt, frames)) = frames_ready(cx, &mut self.probed) else {
            return Ok(no_frames(cx, &mut self.probed));
        };

        let chunk = cx.input.chunk().truncate_frames(&fmt, frames);
        let channels = fmt.channels as usize;
        if self.acc.len() != channels {
            self.acc = vec![Acc::default(); channels];
        }
        for (c, acc) in self.acc.iter_mut().enumerate() {
            for f in 0..frames {
                let raw = chunk.sample(&fmt, f, c);
                let v = pcm::read_sample(fmt.sample, raw).abs();
                acc.highest = acc.highest.max(v);
                acc.sum += v;
                if is_clipped(fmt.sample, raw) {
                    acc.clipped += 1;
                }
            }
            acc.frames += frames as u64;
        }

        self.buf.copy_from(chunk);
        cx.input.consume_frames(&fmt, frames);
        Ok(Flow::Data(self.buf.view()))
    }

    fn close(&mut self, _track: &mut Track) {
        let peaks: Vec<ChannelPeaks> = self
            .acc
            .iter()
            .map(|a| ChannelPeaks {
                highest: a.highest,
                average: if a.frames == 0 { 0.0 } else { a.sum / a.frames as f64 },
                clipped: a.clipped,
            })
            .collect();
        for (c, p) in peaks.iter().enumerate() {
            tracing::info!(
                channel = c,
                highest_db = %format!("{:.2}", p.highest_db()),
                average_db = %format!("{:.2}", p.average_db()),
                clipped = p.clipped,
                "peaks"
            );
        }
        *self
            .handle
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = peaks;
    }
}

fn is_clipped(fmt: SampleFormat, raw: &[u8]) -> bool {
    match fmt {
        SampleFormat::I16 => {
            let s = i16::from_le_bytes([raw[0], raw[1]]);
            s == i16::MAX || s == i16::MIN
        }
        SampleFormat::U8 => raw[0] == 0 || raw[0] == u8::MAX,
        other => pcm::read_sample(other, raw).abs() >= 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Chunk, Input, Planes};
    use crate::format::PcmFormat;

    #[test]
    fn requests_planar_s16_and_measures_levels() {
        let mut track = Track::new(1);
        let factory = PeaksFactory::new();
        let handle = factory.handle();
        let mut stage = factory.open(&mut track).unwrap();

        let fmt = PcmFormat::new(SampleFormat::I16, 2, 8000).planar();
        let left: Vec<u8> = [16_384i16, -16_384, 0, 0].iter().flat_map(|s| s.to_le_bytes()).collect();
        let right: Vec<u8> = [i16::MAX, 0, 0, i16::MIN].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut data = left.clone();
        data.extend_from_slice(&right);
        let chunk = Chunk::Planar(Planes::new(&data, 8, 8, 2));

        let mut cx = StageContext::new(&mut track, Input::new(chunk, Some(fmt), false), 3);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Data(c) if c.len() == 16));
        assert_eq!(cx.input.remaining(), 0);
        assert_eq!(cx.take_request(|r| &mut r.layout), None);
        drop(cx);
        stage.close(&mut track);

        let peaks = handle.channels();
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].highest, 0.5);
        assert_eq!(peaks[0].average, 0.25);
        assert_eq!(peaks[0].clipped, 0);
        assert_eq!(peaks[1].clipped, 2);
        assert!((peaks[0].highest_db() + 6.0206).abs() < 1e-3);
    }

    #[test]
    fn request_is_visible_upstream() {
        let mut track = Track::new(1);
        let mut stage = PeaksFactory::new().open(&mut track).unwrap();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, None, false), 3);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Data(c) if c.is_empty()));
        drop(cx);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, None, false), 1);
        assert_eq!(cx.take_request(|r| &mut r.sample), Some(SampleFormat::I16));
        assert_eq!(cx.take_request(|r| &mut r.layout), Some(Layout::Planar));
    }

    #[test]
    fn stop_keeps_levels_measured_so_far() {
        let mut track = Track::new(1);
        let factory = PeaksFactory::new();
        let handle = factory.handle();
        let mut stage = factory.open(&mut track).unwrap();
        let fmt = PcmFormat::new(SampleFormat::I16, 1, 8000).planar();
        let data: Vec<u8> = [8192i16, -8192].iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Planar(Planes::new(&data, 4, 4, 1)), Some(fmt), false), 3);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Data(c) if c.len() == 4));
        drop(cx);

        track.request_stop();
        let loud: Vec<u8> = [i16::MAX, i16::MAX].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Planar(Planes::new(&loud, 4, 4, 1)), Some(fmt), false), 3);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Done(c) if c.is_empty()));
        drop(cx);
        stage.close(&mut track);

        let peaks = handle.channels();
        assert_eq!(peaks[0].highest, 0.25);
        assert_eq!(peaks[0].clipped, 0);
    }
}
