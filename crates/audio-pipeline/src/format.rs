//! PCM format description and push-down format requests.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PipelineError;

/// Sample encoding. All multi-byte encodings are little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    I16,
    I24,
    I32,
    F32,
    F64,
}

impl SampleFormat {
    /// Bytes per sample.
    pub fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub fn bits(self) -> u16 {
        (self.bytes() * 8) as u16
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I16 => "s16",
            Self::I24 => "s24",
            Self::I32 => "s32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl FromStr for SampleFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "u8" => Ok(Self::U8),
            "s16" | "i16" | "int16" => Ok(Self::I16),
            "s24" | "i24" | "int24" => Ok(Self::I24),
            "s32" | "i32" | "int32" => Ok(Self::I32),
            "f32" | "float" | "float32" => Ok(Self::F32),
            "f64" | "float64" => Ok(Self::F64),
            other => Err(PipelineError::Config(format!("unknown sample format: {other}"))),
        }
    }
}

/// How channels are laid out in a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    /// `frame0[ch0], frame0[ch1], frame1[ch0], ...`
    Interleaved,
    /// One contiguous region per channel.
    Planar,
}

/// Full description of a PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    pub sample: SampleFormat,
    pub channels: u16,
    pub rate: u32,
    pub layout: Layout,
}

impl PcmFormat {
    pub fn new(sample: SampleFormat, channels: u16, rate: u32) -> Self {
        Self {
            sample,
            channels,
            rate,
            layout: Layout::Interleaved,
        }
    }

    pub fn planar(self) -> Self {
        Self {
            layout: Layout::Planar,
            ..self
        }
    }

    /// Bytes per frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.sample.bytes() * self.channels as usize
    }

    /// Bytes needed to hold `ms` milliseconds of audio.
    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        let frames = self.rate as u64 * ms / 1000;
        (frames as usize).saturating_mul(self.frame_size())
    }

    pub fn frames_to_duration(&self, frames: u64) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.rate as f64)
    }

    pub fn duration_to_frames(&self, d: Duration) -> u64 {
        (d.as_secs_f64() * self.rate as f64).round() as u64
    }

    pub(crate) fn validate(&self, stage: &'static str) -> Result<(), PipelineError> {
        if self.channels == 0 || self.rate == 0 {
            return Err(PipelineError::unsupported(stage, format!("format {self}")));
        }
        Ok(())
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.layout {
            Layout::Interleaved => "i",
            Layout::Planar => "ni",
        };
        write!(
            f,
            "{}/{}/{}/{}",
            self.sample.name(),
            self.rate,
            self.channels,
            layout
        )
    }
}

/// A downstream stage's wishes for the format it receives.
///
/// `None` fields mean "leave unchanged".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatRequest {
    pub sample: Option<SampleFormat>,
    pub channels: Option<u16>,
    pub rate: Option<u32>,
    pub layout: Option<Layout>,
}

impl FormatRequest {
    pub fn is_empty(&self) -> bool {
        self.sample.is_none()
            && self.channels.is_none()
            && self.rate.is_none()
            && self.layout.is_none()
    }

    /// The format produced by applying this request to `fmt`.
    pub fn apply(&self, fmt: &PcmFormat) -> PcmFormat {
        PcmFormat {
            sample: self.sample.unwrap_or(fmt.sample),
            channels: self.channels.unwrap_or(fmt.channels),
            rate: self.rate.unwrap_or(fmt.rate),
            layout: self.layout.unwrap_or(fmt.layout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_and_ms_sizing() {
        let fmt = PcmFormat::new(SampleFormat::I16, 2, 44_100);
        assert_eq!(fmt.frame_size(), 4);
        assert_eq!(fmt.bytes_for_ms(1000), 176_400);
        assert_eq!(fmt.bytes_for_ms(500), 88_200);
    }

    #[test]
    fn display_is_compact() {
        let fmt = PcmFormat::new(SampleFormat::F32, 2, 48_000).planar();
        assert_eq!(fmt.to_string(), "f32/48000/2/ni");
    }

    #[test]
    fn parse_sample_format_aliases() {
        assert_eq!("S16".parse::<SampleFormat>().unwrap(), SampleFormat::I16);
        assert_eq!("float".parse::<SampleFormat>().unwrap(), SampleFormat::F32);
        assert!("s12".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn request_apply_keeps_unset_fields() {
        let fmt = PcmFormat::new(SampleFormat::I16, 2, 44_100);
        let req = FormatRequest {
            sample: Some(SampleFormat::F32),
            ..Default::default()
        };
        let out = req.apply(&fmt);
        assert_eq!(out.sample, SampleFormat::F32);
        assert_eq!(out.channels, 2);
        assert_eq!(out.rate, 44_100);
        assert_eq!(out.layout, Layout::Interleaved);
        assert!(FormatRequest::default().is_empty());
    }

    #[test]
    fn duration_frame_conversion() {
        let fmt = PcmFormat::new(SampleFormat::I16, 1, 48_000);
        assert_eq!(fmt.duration_to_frames(Duration::from_millis(1500)), 72_000);
        assert_eq!(fmt.frames_to_duration(24_000), Duration::from_millis(500));
    }
}
