//! Tuning parameters for the built-in stages.
//!
//! Every struct has a `Default` matching the values the pipeline was tuned with;
//! callers (the CLI) override individual fields.

use std::time::Duration;

use crate::error::PipelineError;
use crate::format::{FormatRequest, Layout, SampleFormat};

/// File source buffering.
#[derive(Clone, Debug)]
pub struct FileInputConfig {
    /// Size of one cache block in bytes.
    pub buffer_size: usize,
    /// Number of cache blocks.
    pub buffers: usize,
    /// Alignment of block memory and file offsets.
    pub align: usize,
    /// Bypass the OS page cache where supported.
    pub direct_io: bool,
    /// Upper bound on filled-but-unread blocks kept ahead of the cursor.
    pub max_prebuffer: usize,
}

impl Default for FileInputConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            buffers: 3,
            align: 4096,
            direct_io: true,
            max_prebuffer: 2,
        }
    }
}

/// Sample format converter.
#[derive(Clone, Debug)]
pub struct ConvertConfig {
    /// Conversion buffer length, measured at the input format.
    pub buffer_ms: u64,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self { buffer_ms: 1000 }
    }
}

/// Sample rate converter.
#[derive(Clone, Copy, Debug)]
pub struct ResampleConfig {
    /// Input chunk size in frames fed to the resampler per call.
    pub chunk_frames: usize,
    pub sinc_len: usize,
    pub oversampling_factor: usize,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            sinc_len: 128,
            oversampling_factor: 256,
        }
    }
}

/// Audio device output.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Case-insensitive substring of the device name; default device when unset.
    pub device: Option<String>,
    /// Target buffer duration for the playback queue.
    pub buffer_seconds: f32,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_seconds: 2.0,
            refill_max_frames: 4096,
        }
    }
}

/// Encoder-side knobs read by output file stages.
#[derive(Clone, Debug, Default)]
pub struct EncodeConfig {
    pub format: Option<SampleFormat>,
    pub rate: Option<u32>,
    pub channels: Option<u16>,
}

impl EncodeConfig {
    pub fn request(&self) -> FormatRequest {
        FormatRequest {
            sample: self.format,
            channels: self.channels,
            rate: self.rate,
            layout: Some(Layout::Interleaved),
        }
    }
}

/// Per-run filter settings.
#[derive(Clone, Debug, Default)]
pub struct FilterConfig {
    /// Gain in dB; 0 disables the gain stage.
    pub gain_db: f64,
    /// Stop after this much audio has passed.
    pub until: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub input: FileInputConfig,
    pub convert: ConvertConfig,
    pub resample: ResampleConfig,
    pub output: OutputConfig,
    pub encode: EncodeConfig,
    pub filters: FilterConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let input = &self.input;
        if input.buffers == 0 || input.buffer_size == 0 {
            return Err(PipelineError::Config(
                "file input needs at least one non-empty buffer".into(),
            ));
        }
        if !input.align.is_power_of_two() {
            return Err(PipelineError::Config(format!(
                "align must be a power of two, got {}",
                input.align
            )));
        }
        if input.direct_io && input.buffer_size % input.align != 0 {
            return Err(PipelineError::Config(format!(
                "buffer size {} is not a multiple of align {} (required for direct I/O)",
                input.buffer_size, input.align
            )));
        }
        if self.resample.chunk_frames == 0 {
            return Err(PipelineError::Config("chunk frames must be positive".into()));
        }
        if self.convert.buffer_ms == 0 {
            return Err(PipelineError::Config("convert buffer must be positive".into()));
        }
        if !self.filters.gain_db.is_finite() {
            return Err(PipelineError::Config("gain must be finite".into()));
        }
        if matches!(self.encode.channels, Some(0)) || matches!(self.encode.rate, Some(0)) {
            return Err(PipelineError::Config(
                "output rate and channels must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.input.buffer_size, 65_536);
        assert_eq!(cfg.input.buffers, 3);
        assert_eq!(cfg.input.max_prebuffer, 2);
    }

    #[test]
    fn rejects_misaligned_direct_io_buffer() {
        let mut cfg = PipelineConfig::default();
        cfg.input.buffer_size = 10_000;
        assert!(cfg.validate().is_err());
        cfg.input.direct_io = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_align() {
        let mut cfg = PipelineConfig::default();
        cfg.input.align = 3000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn encode_request_is_interleaved() {
        let enc = EncodeConfig {
            format: Some(SampleFormat::I24),
            ..Default::default()
        };
        let req = enc.request();
        assert_eq!(req.sample, Some(SampleFormat::I24));
        assert_eq!(req.layout, Some(Layout::Interleaved));
        assert!(req.rate.is_none());
    }
}
