//! `convert.resample`: sample rate conversion.
//!
//! Uses Rubato's asynchronous sinc resampler with a fixed input chunk. Input of
//! any encoding is widened to `f32`, resampled, and written back in the
//! input's encoding and layout. At end of stream the remaining partial chunk
//! and the filter delay are flushed in the same call that reports `Done`.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::buffer::{Chunk, Planes};
use crate::config::ResampleConfig;
use crate::error::PipelineError;
use crate::format::{Layout, PcmFormat};
use crate::pcm;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "convert.resample";

pub struct ResampleFactory {
    cfg: ResampleConfig,
}

impl ResampleFactory {
    pub fn new(cfg: ResampleConfig) -> Self {
        Self { cfg }
    }
}

impl StageFactory for ResampleFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(ResampleStage::new(self.cfg)))
    }
}

fn engine_error(what: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::decode(NAME, format!("{what}: {e}"))
}

/// Run one block through the resampler, returning `(frames_in, frames_out)`.
fn process_block(
    resampler: &mut Async<f32>,
    input: &[f32],
    frames: usize,
    partial_len: Option<usize>,
    channels: usize,
    out: &mut [f32],
) -> Result<(usize, usize), PipelineError> {
    let input_adapter = InterleavedSlice::new(input, channels, frames)
        .map_err(|e| engine_error("interleaved slice (input)", e))?;
    let out_frames = out.len() / channels;
    let mut output_adapter = InterleavedSlice::new_mut(out, channels, out_frames)
        .map_err(|e| engine_error("interleaved slice (output)", e))?;
    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len,
    };
    resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
        .map_err(|e| engine_error("resampler process", e))
}

struct Engine {
    resampler: Async<f32>,
    channels: usize,
    chunk: usize,
    ratio: f64,
    from: u64,
    to: u64,
    /// Interleaved input not yet fed to the resampler.
    pending: Vec<f32>,
    scratch: Vec<f32>,
    out: Vec<f32>,
    /// Output collected during the current call.
    produced: Vec<f32>,
    delay_left: usize,
    total_in: u64,
    total_out: u64,
    flushed: bool,
}

impl Engine {
    fn new(from: u32, to: u32, channels: usize, cfg: &ResampleConfig) -> Result<Self, PipelineError> {
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len: cfg.sinc_len,
            f_cutoff: calculate_cutoff(cfg.sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: cfg.oversampling_factor,
            window,
        };
        let ratio = to as f64 / from as f64;
        let chunk = cfg.chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| engine_error("resampler init", e))?;
        let out = vec![0.0; resampler.output_frames_max() * channels];
        let delay_left = resampler.output_delay();
        Ok(Self {
            resampler,
            channels,
            chunk,
            ratio,
            from: from as u64,
            to: to as u64,
            pending: Vec::new(),
            scratch: vec![0.0; chunk * channels],
            out,
            produced: Vec::new(),
            delay_left,
            total_in: 0,
            total_out: 0,
            flushed: false,
        })
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.produced.clear();
        self.delay_left = self.resampler.output_delay();
        self.total_in = 0;
        self.total_out = 0;
        self.flushed = false;
    }

    /// Keep `n` frames of `out`, dropping the filter delay at stream start.
    fn keep(&mut self, n: usize) {
        let skip = self.delay_left.min(n);
        self.delay_left -= skip;
        let ch = self.channels;
        self.produced.extend_from_slice(&self.out[skip * ch..n * ch]);
        self.total_out += (n - skip) as u64;
    }

    /// Feed every complete chunk.
    fn run(&mut self) -> Result<(), PipelineError> {
        let ch = self.channels;
        while self.pending.len() >= self.chunk * ch {
            let (n_in, n_out) = process_block(
                &mut self.resampler,
                &self.pending[..self.chunk * ch],
                self.chunk,
                None,
                ch,
                &mut self.out,
            )?;
            self.pending.drain(..n_in.max(1).min(self.chunk) * ch);
            self.keep(n_out);
        }
        Ok(())
    }

    /// Push the tail and the filter delay out of the resampler.
    fn flush(&mut self) -> Result<(), PipelineError> {
        let ch = self.channels;
        let expected = (self.total_in * self.to).div_ceil(self.from);
        let valid = self.pending.len() / ch;

        self.scratch.fill(0.0);
        self.scratch[..valid * ch].copy_from_slice(&self.pending[..valid * ch]);
        self.pending.clear();
        let (_, n_out) = process_block(
            &mut self.resampler,
            &self.scratch,
            self.chunk,
            Some(valid),
            ch,
            &mut self.out,
        )?;
        self.keep(n_out);

        self.scratch.fill(0.0);
        let per_round = ((self.chunk as f64 * self.ratio) as usize).max(1);
        let max_rounds = 4 + self.resampler.output_delay() / per_round;
        let mut rounds = 0;
        while self.total_out < expected && rounds < max_rounds {
            let (_, n_out) = process_block(
                &mut self.resampler,
                &self.scratch,
                self.chunk,
                Some(0),
                ch,
                &mut self.out,
            )?;
            self.keep(n_out);
            rounds += 1;
        }

        if self.total_out > expected {
            let extra = ((self.total_out - expected) as usize * ch).min(self.produced.len());
            self.produced.truncate(self.produced.len() - extra);
            self.total_out = expected;
        }
        self.flushed = true;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Probe,
    Negotiate,
    Data,
}

pub(crate) struct ResampleStage {
    cfg: ResampleConfig,
    phase: Phase,
    target: u32,
    engine: Option<Engine>,
    out_fmt: Option<PcmFormat>,
    out: Vec<u8>,
}

impl ResampleStage {
    pub(crate) fn new(cfg: ResampleConfig) -> Self {
        Self {
            cfg,
            phase: Phase::Probe,
            target: 0,
            engine: None,
            out_fmt: None,
            out: Vec::new(),
        }
    }
}

/// Encode `produced` into `out` and clear it.
fn render<'a>(produced: &mut Vec<f32>, fmt: &PcmFormat, out: &'a mut Vec<u8>) -> Chunk<'a> {
    let stride = pcm::from_f32_interleaved(produced, fmt, out);
    produced.clear();
    let out: &'a [u8] = out;
    match fmt.layout {
        Layout::Interleaved => Chunk::Interleaved(out),
        Layout::Planar => Chunk::Planar(Planes::new(out, stride, stride, fmt.channels as usize)),
    }
}

impl Stage for ResampleStage {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if cx.track.stop_requested() {
            // Hand on what the filter still holds for the input already taken.
            if let (Some(engine), Some(fmt)) = (self.engine.as_mut(), self.out_fmt) {
                if !engine.flushed {
                    engine.flush()?;
                }
                if !engine.produced.is_empty() {
                    return Ok(Flow::LastOutput(render(&mut engine.produced, &fmt, &mut self.out)));
                }
            }
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        match self.phase {
            Phase::Probe => {
                self.phase = Phase::Negotiate;
                return Ok(Flow::Data(Chunk::EMPTY));
            }
            Phase::Negotiate => {
                let fmt = cx.input.require_format(NAME)?;
                match cx.take_request(|r| &mut r.rate) {
                    Some(rate) if rate != fmt.rate && rate > 0 => {
                        tracing::info!(from_hz = fmt.rate, to_hz = rate, "resampling");
                        self.target = rate;
                        self.phase = Phase::Data;
                    }
                    _ => {
                        tracing::info!(rate_hz = fmt.rate, "resample skipped");
                        return Ok(Flow::DonePrevious);
                    }
                }
            }
            Phase::Data => {}
        }

        let fmt = cx.input.require_format(NAME)?;
        let out_fmt = PcmFormat {
            rate: self.target,
            ..fmt
        };
        cx.set_output_format(out_fmt);
        self.out_fmt = Some(out_fmt);

        if cx.input.is_reset() {
            if let Some(engine) = self.engine.as_mut() {
                engine.reset();
            }
        }

        let src = cx.input.chunk();
        let frames = src.frames(&fmt);
        if frames > 0 && self.engine.is_none() {
            self.engine = Some(Engine::new(fmt.rate, self.target, fmt.channels as usize, &self.cfg)?);
        }
        let Some(engine) = self.engine.as_mut() else {
            if cx.input.is_last() {
                cx.input.consume(cx.input.remaining());
                return Ok(Flow::Done(Chunk::EMPTY));
            }
            return Ok(Flow::NeedMore);
        };
        if engine.channels != fmt.channels as usize {
            return Err(PipelineError::unsupported(NAME, "channel count change mid-stream"));
        }

        pcm::to_f32_interleaved(&src, &fmt, frames, &mut engine.pending);
        engine.total_in += frames as u64;
        cx.input.consume_frames(&fmt, frames);
        engine.run()?;

        let last = cx.input.is_last() && cx.input.remaining() < fmt.frame_size();
        if last {
            if cx.input.remaining() != 0 {
                tracing::warn!(bytes = cx.input.remaining(), "dropping partial frame");
                cx.input.consume(cx.input.remaining());
            }
            if !engine.flushed {
                engine.flush()?;
            }
        }

        if engine.produced.is_empty() {
            if last {
                return Ok(Flow::Done(Chunk::EMPTY));
            }
            return Ok(Flow::NeedMore);
        }

        let chunk = render(&mut engine.produced, &out_fmt, &mut self.out);
        if last {
            Ok(Flow::Done(chunk))
        } else {
            Ok(Flow::Data(chunk))
        }
    }
}
