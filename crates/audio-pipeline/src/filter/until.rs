//! `filter.until`: end the stream at a fixed time position.

use std::time::Duration;

use crate::buffer::{Chunk, ChunkBuf};
use crate::error::PipelineError;
use crate::filter::{frames_ready, no_frames};
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "filter.until";

pub struct UntilFactory {
    until: Duration,
}

impl UntilFactory {
    pub fn new(until: Duration) -> Self {
        Self { until }
    }
}

impl StageFactory for UntilFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(Until {
            until: self.until,
            passed: 0,
            length_set: false,
            probed: false,
            buf: ChunkBuf::default(),
        }))
    }
}

struct Until {
    until: Duration,
    /// Frames seen at the current input rate.
    passed: u64,
    length_set: bool,
    probed: bool,
    buf: ChunkBuf,
}

impl Until {
    fn cap_total_length(&mut self, track: &mut Track) {
        if self.length_set {
            return;
        }
        if let Some(src) = track.source_format {
            let cap = src.duration_to_frames(self.until);
            self.length_set = true;
            if cap == u64::MAX {
                return;
            }
            track.total_length = Some(track.total_length.map_or(cap, |t| t.min(cap)));
        }
    }
}

impl Stage for Until {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        self.cap_total_length(cx.track);

        if cx.input.is_reset() {
            if let (Some(fmt), Some(src)) = (cx.input.format(), cx.track.source_format) {
                let at = src.frames_to_duration(cx.track.seeked_to.unwrap_or(0));
                self.passed = fmt.duration_to_frames(at);
            }
        }

        let Some((fmt, frames)) = frames_ready(cx, &mut self.probed) else {
            return Ok(no_frames(cx, &mut self.probed));
        };
        let limit = fmt.duration_to_frames(self.until);
        if self.passed >= limit {
            cx.input.consume(cx.input.remaining());
            return Ok(Flow::LastOutput(Chunk::EMPTY));
        }

        let take = frames.min(usize::try_from(limit - self.passed).unwrap_or(usize::MAX));
        self.buf.copy_from(cx.input.chunk().truncate_frames(&fmt, take));
        cx.input.consume_frames(&fmt, take);
        self.passed += take as u64;

        if self.passed >= limit {
            tracing::debug!(frames = self.passed, "end position reached");
            cx.input.consume(cx.input.remaining());
            Ok(Flow::LastOutput(self.buf.view()))
        } else {
            Ok(Flow::Data(self.buf.view()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Input;
    use crate::format::{PcmFormat, SampleFormat};

    fn fmt() -> PcmFormat {
        PcmFormat::new(SampleFormat::I16, 1, 1000)
    }

    #[test]
    fn truncates_at_limit_and_caps_length() {
        let mut track = Track::new(1);
        track.source_format = Some(fmt());
        track.total_length = Some(5000);
        let mut stage = UntilFactory::new(Duration::from_millis(150))
            .open(&mut track)
            .unwrap();
        let data = vec![0u8; 200];

        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt()), false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Data(c) if c.len() == 200));

        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt()), false), 2);
        match stage.process(&mut cx).unwrap() {
            Flow::LastOutput(c) => assert_eq!(c.len(), 100),
            other => panic!("unexpected {}", other.name()),
        }
        assert_eq!(cx.input.remaining(), 0);
        assert_eq!(track.total_length, Some(150));
    }

    #[test]
    fn reset_restarts_count_from_seek_target() {
        let mut track = Track::new(1);
        track.source_format = Some(fmt());
        let mut stage = UntilFactory::new(Duration::from_millis(100))
            .open(&mut track)
            .unwrap();
        track.seeked_to = Some(90);
        let data = vec![0u8; 100];
        let input = Input::new(Chunk::Interleaved(&data), Some(fmt()), false).with_reset(true);
        let mut cx = StageContext::new(&mut track, input, 2);
        match stage.process(&mut cx).unwrap() {
            Flow::LastOutput(c) => assert_eq!(c.len(), 20),
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn stop_ends_before_limit() {
        let mut track = Track::new(1);
        track.source_format = Some(fmt());
        let mut stage = UntilFactory::new(Duration::from_secs(10))
            .open(&mut track)
            .unwrap();
        let data = vec![0u8; 200];
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt()), false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Data(c) if c.len() == 200));

        track.request_stop();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt()), false), 2);
        assert!(matches!(stage.process(&mut cx).unwrap(), Flow::Done(c) if c.is_empty()));
        assert_eq!(cx.input.consumed(), 0);
    }
}
