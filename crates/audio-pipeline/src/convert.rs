//! `convert.format`: sample encoding, channel count and layout conversion.
//!
//! The first call emits nothing so that downstream stages can post their
//! format requests. The second call negotiates; an unchanged format bypasses
//! the stage entirely.

use crate::buffer::{Chunk, Planes};
use crate::config::ConvertConfig;
use crate::error::{PipelineError, alloc_zeroed};
use crate::format::{Layout, PcmFormat};
use crate::pcm;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "convert.format";

pub struct ConvertFactory {
    cfg: ConvertConfig,
}

impl ConvertFactory {
    pub fn new(cfg: ConvertConfig) -> Self {
        Self { cfg }
    }
}

impl StageFactory for ConvertFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(Converter::new(self.cfg.clone())))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Probe,
    Negotiate,
    Data,
}

struct Conversion {
    input: PcmFormat,
    output: PcmFormat,
    buf: Vec<u8>,
    capacity_frames: usize,
    /// Bytes per channel region for planar output.
    plane_stride: usize,
}

pub(crate) struct Converter {
    cfg: ConvertConfig,
    phase: Phase,
    conv: Option<Conversion>,
}

impl Converter {
    pub(crate) fn new(cfg: ConvertConfig) -> Self {
        Self {
            cfg,
            phase: Phase::Probe,
            conv: None,
        }
    }

    fn negotiate(&mut self, cx: &mut StageContext<'_>) -> Result<bool, PipelineError> {
        let input = cx.input.require_format(NAME)?;
        input.validate(NAME)?;
        let output = PcmFormat {
            sample: cx.take_request(|r| &mut r.sample).unwrap_or(input.sample),
            channels: cx.take_request(|r| &mut r.channels).unwrap_or(input.channels),
            rate: input.rate,
            layout: cx.take_request(|r| &mut r.layout).unwrap_or(input.layout),
        };
        if output == input {
            tracing::debug!(format = %input, "conversion not needed");
            return Ok(false);
        }
        output.validate(NAME)?;

        let cap_bytes = input.bytes_for_ms(self.cfg.buffer_ms);
        let capacity_frames = (cap_bytes / output.frame_size()).max(1);
        let buf = alloc_zeroed(capacity_frames * output.frame_size(), "conversion buffer")?;
        let plane_stride = match output.layout {
            Layout::Planar => capacity_frames * output.sample.bytes(),
            Layout::Interleaved => 0,
        };
        tracing::debug!(from = %input, to = %output, capacity_frames, "converting");
        self.conv = Some(Conversion {
            input,
            output,
            buf,
            capacity_frames,
            plane_stride,
        });
        Ok(true)
    }
}

impl Stage for Converter {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        // Converted output is handed on at once, so nothing is held back.
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        match self.phase {
            Phase::Probe => {
                self.phase = Phase::Negotiate;
                return Ok(Flow::Data(Chunk::EMPTY));
            }
            Phase::Negotiate => {
                if !self.negotiate(cx)? {
                    return Ok(Flow::DonePrevious);
                }
                self.phase = Phase::Data;
            }
            Phase::Data => {}
        }

        let Some(conv) = self.conv.as_mut() else {
            return Err(PipelineError::protocol(NAME, "no conversion set up"));
        };
        cx.set_output_format(conv.output);

        let src = cx.input.chunk();
        let available = src.frames(&conv.input);
        if available == 0 {
            if cx.input.is_last() {
                if cx.input.remaining() != 0 {
                    tracing::warn!(bytes = cx.input.remaining(), "dropping partial frame");
                    cx.input.consume(cx.input.remaining());
                }
                return Ok(Flow::Done(Chunk::EMPTY));
            }
            return Ok(Flow::NeedMore);
        }

        let frames = available.min(conv.capacity_frames);
        pcm::convert(
            &src,
            &conv.input,
            &mut conv.buf,
            &conv.output,
            conv.plane_stride,
            frames,
        );
        cx.input.consume_frames(&conv.input, frames);

        let out = match conv.output.layout {
            Layout::Interleaved => {
                Chunk::Interleaved(&conv.buf[..frames * conv.output.frame_size()])
            }
            Layout::Planar => Chunk::Planar(Planes::new(
                &conv.buf,
                conv.plane_stride,
                frames * conv.output.sample.bytes(),
                conv.output.channels as usize,
            )),
        };
        Ok(Flow::Data(out))
    }
}
