//! `out.null`: consumes and counts frames.

use crate::buffer::Chunk;
use crate::error::PipelineError;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

pub struct NullOutputFactory;

impl StageFactory for NullOutputFactory {
    fn name(&self) -> &'static str {
        "out.null"
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(NullOutput { frames: 0 }))
    }
}

struct NullOutput {
    frames: u64,
}

impl Stage for NullOutput {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if let Some(fmt) = cx.input.format() {
            self.frames += cx.input.chunk().frames(&fmt) as u64;
        }
        cx.input.consume(cx.input.remaining());
        if cx.input.is_last() || cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        Ok(Flow::NeedMore)
    }

    fn close(&mut self, _track: &mut Track) {
        tracing::debug!(frames = self.frames, "null output closed");
    }
}
