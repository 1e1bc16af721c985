//! `out.device`: plays the stream on an audio output device.
//!
//! The stage asks upstream for interleaved `f32` at the device's rate and
//! channel count, feeds a bounded [`SampleQueue`], and suspends the track
//! while the queue is full. The CPAL callback drains the queue without
//! blocking and outputs silence on underrun.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, StreamTrait};

use crate::buffer::Chunk;
use crate::config::OutputConfig;
use crate::error::PipelineError;
use crate::format::{FormatRequest, Layout, PcmFormat, SampleFormat};
use crate::pcm;
use crate::sink::device::{pick_buffer_size, pick_device, pick_output_config};
use crate::sink::queue::{SampleQueue, calc_max_buffered_samples};
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "out.device";

pub struct DeviceOutputFactory {
    cfg: OutputConfig,
}

impl DeviceOutputFactory {
    pub fn new(cfg: OutputConfig) -> Self {
        Self { cfg }
    }
}

impl StageFactory for DeviceOutputFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        let host = cpal::default_host();
        let device = pick_device(&host, self.cfg.device.as_deref())?;
        let supported = pick_output_config(&device, track.source_format.map(|f| f.rate))?;
        let sample_format = supported.sample_format();
        let mut config: cpal::StreamConfig = supported.config();
        if let Some(size) = pick_buffer_size(&supported) {
            config.buffer_size = size;
        }

        let channels = config.channels;
        let rate = config.sample_rate;
        let queue = Arc::new(SampleQueue::new(
            channels as usize,
            calc_max_buffered_samples(rate, channels as usize, self.cfg.buffer_seconds),
        ));
        let underruns = Arc::new(AtomicU64::new(0));
        let stream = build_output_stream(
            &device,
            &config,
            sample_format,
            &queue,
            self.cfg.refill_max_frames,
            &underruns,
        )?;
        stream
            .play()
            .map_err(|e| PipelineError::Device(format!("start stream: {e}")))?;

        let device_name = device
            .description()
            .map(|d| d.name().to_string())
            .unwrap_or_default();
        tracing::info!(
            device = %device_name,
            rate_hz = rate,
            channels,
            format = ?sample_format,
            "output stream started"
        );

        Ok(Box::new(DeviceOutput {
            stream: Some(stream),
            queue,
            underruns,
            format: PcmFormat::new(SampleFormat::F32, channels, rate),
            requested: false,
            pending: Vec::new(),
            pushed: 0,
            played: 0,
        }))
    }
}

struct DeviceOutput {
    stream: Option<cpal::Stream>,
    queue: Arc<SampleQueue>,
    underruns: Arc<AtomicU64>,
    format: PcmFormat,
    requested: bool,
    /// Samples converted but not yet accepted by the queue.
    pending: Vec<f32>,
    pushed: usize,
    played: u64,
}

impl DeviceOutput {
    /// Move pending samples into the queue; false if some are left.
    fn flush_pending(&mut self, track: &Track) -> bool {
        let n = self
            .queue
            .push_available(&self.pending[self.pushed..], &track.waker());
        self.pushed += n;
        if self.pushed < self.pending.len() {
            return false;
        }
        self.pending.clear();
        self.pushed = 0;
        true
    }
}

impl Stage for DeviceOutput {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if !self.requested {
            self.requested = true;
            cx.request_format(FormatRequest {
                sample: Some(SampleFormat::F32),
                channels: Some(self.format.channels),
                rate: Some(self.format.rate),
                layout: Some(Layout::Interleaved),
            });
        }
        if cx.track.stop_requested() {
            self.queue.clear();
            cx.input.consume(cx.input.remaining());
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        if cx.input.is_reset() {
            self.queue.clear();
            self.pending.clear();
            self.pushed = 0;
        }
        if !self.pending.is_empty() && !self.flush_pending(cx.track) {
            return Ok(Flow::Pending);
        }

        if let Some(fmt) = cx.input.format() {
            let frames = cx.input.chunk().frames(&fmt);
            if frames > 0 {
                if fmt.channels != self.format.channels || fmt.rate != self.format.rate {
                    return Err(PipelineError::unsupported(
                        NAME,
                        format!("device plays {}, got {fmt}", self.format),
                    ));
                }
                pcm::to_f32_interleaved(&cx.input.chunk(), &fmt, frames, &mut self.pending);
                cx.input.consume_frames(&fmt, frames);
                self.played += frames as u64;
                if !self.flush_pending(cx.track) {
                    return Ok(Flow::Pending);
                }
            }
        }

        if !cx.input.is_last() {
            return Ok(Flow::NeedMore);
        }
        if !self.queue.drained(&cx.track.waker()) {
            return Ok(Flow::Pending);
        }
        cx.input.consume(cx.input.remaining());
        Ok(Flow::Done(Chunk::EMPTY))
    }

    fn close(&mut self, _track: &mut Track) {
        self.queue.close();
        self.stream.take();
        tracing::debug!(
            frames = self.played,
            underrun_frames = self.underruns.load(Ordering::Relaxed),
            "output stream closed"
        );
    }
}

/// Build a CPAL output stream that plays interleaved `f32` from `queue`.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
    refill_max_frames: usize,
    underruns: &Arc<AtomicU64>,
) -> Result<cpal::Stream, PipelineError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, refill_max_frames, underruns),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, refill_max_frames, underruns),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, refill_max_frames, underruns),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, refill_max_frames, underruns),
        other => Err(PipelineError::Device(format!("unsupported sample format: {other:?}"))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
    refill_max_frames: usize,
    underruns: &Arc<AtomicU64>,
) -> Result<cpal::Stream, PipelineError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = queue.channels();
    let refill = refill_max_frames.max(1);
    let queue = queue.clone();
    let underruns = underruns.clone();
    let mut local: Vec<f32> = Vec::with_capacity(refill * channels);
    let mut pos = 0usize;

    let err_fn = |err| tracing::warn!("stream error: {err}");
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let mut i = 0;
                while i < data.len() {
                    if pos >= local.len() {
                        local.clear();
                        pos = 0;
                        if queue.pop_into(&mut local, refill) == 0 {
                            // Underrun: silence for the rest of the buffer.
                            let missing = (data.len() - i) / channels;
                            underruns.fetch_add(missing as u64, Ordering::Relaxed);
                            data[i..].fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                            break;
                        }
                    }
                    data[i] = <T as cpal::Sample>::from_sample::<f32>(local[pos]);
                    pos += 1;
                    i += 1;
                }
                queue.set_held(local.len() - pos);
            },
            err_fn,
            None,
        )
        .map_err(|e| PipelineError::Device(format!("build output stream: {e}")))
}
