//! `out.stdout`: writes raw PCM to standard output.
//!
//! No container: bytes go out as little-endian samples in the negotiated
//! format, one frame after another.

use std::io::{self, BufWriter, Write};

use crate::buffer::Chunk;
use crate::config::EncodeConfig;
use crate::error::PipelineError;
use crate::format::PcmFormat;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "out.stdout";

pub struct StdoutOutputFactory {
    encode: EncodeConfig,
}

impl StdoutOutputFactory {
    pub fn new(encode: EncodeConfig) -> Self {
        Self { encode }
    }
}

impl StageFactory for StdoutOutputFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(RawOutput::new(
            BufWriter::new(io::stdout()),
            self.encode.clone(),
        )))
    }
}

pub(crate) struct RawOutput<W: Write> {
    out: W,
    encode: EncodeConfig,
    requested: bool,
    format: Option<PcmFormat>,
    frames: u64,
}

impl<W: Write> RawOutput<W> {
    pub(crate) fn new(out: W, encode: EncodeConfig) -> Self {
        Self {
            out,
            encode,
            requested: false,
            format: None,
            frames: 0,
        }
    }

    fn write_chunk(&mut self, chunk: Chunk<'_>, fmt: &PcmFormat, frames: usize) -> io::Result<()> {
        match chunk.truncate_frames(fmt, frames) {
            Chunk::Interleaved(b) => self.out.write_all(b)?,
            planar @ Chunk::Planar(_) => {
                for f in 0..frames {
                    for c in 0..fmt.channels as usize {
                        self.out.write_all(planar.sample(fmt, f, c))?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl<W: Write> Stage for RawOutput<W> {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if !self.requested {
            self.requested = true;
            cx.request_format(self.encode.request());
            if !cx.input.is_last() {
                return Ok(Flow::NeedMore);
            }
        }

        if let Some(fmt) = cx.input.format() {
            let frames = cx.input.chunk().frames(&fmt);
            if frames > 0 && !cx.track.stop_requested() {
                if self.format.is_none() {
                    tracing::info!(format = %fmt, "writing raw pcm to stdout");
                }
                self.format = Some(fmt);
                self.write_chunk(cx.input.chunk(), &fmt, frames)
                    .map_err(|e| PipelineError::io("write stdout", e))?;
                cx.input.consume_frames(&fmt, frames);
                self.frames += frames as u64;
            }
        }

        if cx.input.is_last() || cx.track.stop_requested() {
            cx.input.consume(cx.input.remaining());
            self.out
                .flush()
                .map_err(|e| PipelineError::io("flush stdout", e))?;
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        Ok(Flow::NeedMore)
    }

    fn close(&mut self, _track: &mut Track) {
        if let Err(e) = self.out.flush() {
            tracing::warn!("flush stdout: {e}");
        }
        tracing::debug!(frames = self.frames, "stdout closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Input, Planes};
    use crate::format::{Layout, SampleFormat};

    fn stage() -> RawOutput<Vec<u8>> {
        let encode = EncodeConfig {
            format: Some(SampleFormat::I16),
            ..Default::default()
        };
        RawOutput::new(Vec::new(), encode)
    }

    #[test]
    fn posts_encode_request_before_writing() {
        let mut track = Track::new(1);
        let mut out = stage();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, None, false), 3);
        assert!(matches!(out.process(&mut cx).unwrap(), Flow::NeedMore));
        drop(cx);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, None, false), 1);
        assert_eq!(cx.take_request(|r| &mut r.sample), Some(SampleFormat::I16));
        assert_eq!(cx.take_request(|r| &mut r.layout), Some(Layout::Interleaved));
    }

    #[test]
    fn writes_interleaved_bytes_and_finishes_on_last() {
        let mut track = Track::new(1);
        let mut out = stage();
        let fmt = PcmFormat::new(SampleFormat::I16, 2, 8000);
        let data: Vec<u8> = (0..9).collect();

        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        out.process(&mut cx).unwrap();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt), false), 2);
        assert!(matches!(out.process(&mut cx).unwrap(), Flow::NeedMore));
        assert_eq!(cx.input.consumed(), 8);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data[8..]), Some(fmt), true), 2);
        assert!(matches!(out.process(&mut cx).unwrap(), Flow::Done(_)));
        assert_eq!(out.out, (0..8).collect::<Vec<u8>>());
        assert_eq!(out.frames, 2);
    }

    #[test]
    fn planar_input_is_interleaved() {
        let mut track = Track::new(1);
        let mut out = stage();
        let fmt = PcmFormat::new(SampleFormat::I16, 2, 8000).planar();
        // Left plane [1, 2], right plane [3, 4].
        let data: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        out.process(&mut cx).unwrap();
        let chunk = Chunk::Planar(Planes::new(&data, 4, 4, 2));
        let mut cx = StageContext::new(&mut track, Input::new(chunk, Some(fmt), true), 2);
        assert!(matches!(out.process(&mut cx).unwrap(), Flow::Done(_)));
        let samples: Vec<i16> = out.out.chunks(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(samples, vec![1, 3, 2, 4]);
    }

    #[test]
    fn stop_flushes_without_writing_more() {
        let mut track = Track::new(1);
        let mut out = stage();
        let fmt = PcmFormat::new(SampleFormat::I16, 1, 8000);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, Some(fmt), false), 2);
        out.process(&mut cx).unwrap();
        track.request_stop();
        let data = [0u8; 4];
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::Interleaved(&data), Some(fmt), false), 2);
        assert!(matches!(out.process(&mut cx).unwrap(), Flow::Done(_)));
        assert!(out.out.is_empty());
    }
}
