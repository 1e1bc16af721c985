//! `filter.gain`: constant gain in decibels.

use crate::buffer::{Chunk, ChunkBuf};
use crate::error::PipelineError;
use crate::filter::{frames_ready, no_frames};
use crate::pcm;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "filter.gain";

pub struct GainFactory {
    gain_db: f64,
}

impl GainFactory {
    pub fn new(gain_db: f64) -> Self {
        Self { gain_db }
    }
}

impl StageFactory for GainFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(Gain {
            factor: pcm::db_to_gain(self.gain_db),
            probed: false,
            buf: ChunkBuf::default(),
        }))
    }
}

struct Gain {
    factor: f64,
    probed: bool,
    buf: ChunkBuf,
}

impl Stage for Gain {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        if self.factor == 1.0 {
            return Ok(Flow::DonePrevious);
        }
        let Some((fmt, frames)) = frames_ready(cx, &mut self.probed) else {
            return Ok(no_frames(cx, &mut self.probed));
        };
        self.buf.copy_from(cx.input.chunk().truncate_frames(&fmt, frames));
        pcm::scale(self.buf.bytes_mut(), fmt.sample, self.factor);
        cx.input.consume_frames(&fmt, frames);
        Ok(Flow::Data(self.buf.view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Chunk, Input};
    use crate::format::{PcmFormat, SampleFormat};

    fn open(db: f64) -> Box<dyn Stage> {
        GainFactory::new(db).open(&mut Track::new(1)).unwrap()
    }

    #[test]
    fn unity_gain_bypasses() {
        let mut stage = open(0.0);
        let mut track = Track::new(1);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, None, false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::DonePrevious));
    }

    #[test]
    fn scales_samples() {
        let mut stage = open(-6.020_599_913_279_624);
        let mut track = Track::new(1);
        let fmt = PcmFormat::new(SampleFormat::I16, 1, 8000);

        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Data(c) if c.is_empty()));

        let data: Vec<u8> = [1000i16, -2000, 3].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data[..5]), Some(fmt), false), 2);
        match stage.process(&mut cx).unwrap() {
            Flow::Data(Chunk::Interleaved(out)) => {
                let s: Vec<i16> = out.chunks(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
                assert_eq!(s, vec![500, -1000]);
            }
            other => panic!("unexpected {}", other.name()),
        }
        assert_eq!(cx.input.consumed(), 4);
    }

    #[test]
    fn empty_after_probe_needs_more_and_last_is_done() {
        let mut stage = open(3.0);
        let mut track = Track::new(1);
        let fmt = PcmFormat::new(SampleFormat::F32, 2, 8000);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        stage.process(&mut cx).unwrap();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::NeedMore));
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), true), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Done(_)));
    }

    #[test]
    fn stop_leaves_input_unscaled() {
        let mut stage = open(3.0);
        let mut track = Track::new(1);
        let fmt = PcmFormat::new(SampleFormat::I16, 1, 8000);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        stage.process(&mut cx).unwrap();

        track.request_stop();
        let data = [0u8; 4];
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt), false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Done(c) if c.is_empty()));
        assert_eq!(cx.input.consumed(), 0);
    }
}
