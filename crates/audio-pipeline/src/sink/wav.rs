//! `out.wav`: writes the stream to a WAV file with `hound`.

use std::fs::File;
use std::io::{self, BufWriter};

use crate::buffer::{Chunk, Input};
use crate::config::EncodeConfig;
use crate::error::PipelineError;
use crate::format::{PcmFormat, SampleFormat};
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "out.wav";

pub struct WavOutputFactory {
    encode: EncodeConfig,
}

impl WavOutputFactory {
    pub fn new(encode: EncodeConfig) -> Self {
        Self { encode }
    }
}

impl StageFactory for WavOutputFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        if track.output.is_none() {
            return Err(PipelineError::Config(format!("{NAME}: track has no output path")));
        }
        Ok(Box::new(WavOutput {
            encode: self.encode.clone(),
            requested: false,
            writer: None,
            frames: 0,
        }))
    }
}

fn wav_error(e: hound::Error) -> PipelineError {
    match e {
        hound::Error::IoError(e) => PipelineError::io("write wav", e),
        other => PipelineError::io("write wav", io::Error::other(other.to_string())),
    }
}

fn wav_spec(fmt: &PcmFormat) -> Result<hound::WavSpec, PipelineError> {
    let sample_format = match fmt.sample {
        SampleFormat::F32 => hound::SampleFormat::Float,
        SampleFormat::F64 => {
            return Err(PipelineError::unsupported(NAME, "64-bit float samples"));
        }
        _ => hound::SampleFormat::Int,
    };
    Ok(hound::WavSpec {
        channels: fmt.channels,
        sample_rate: fmt.rate,
        bits_per_sample: fmt.sample.bits(),
        sample_format,
    })
}

struct Writer {
    inner: hound::WavWriter<BufWriter<File>>,
    format: PcmFormat,
}

impl Writer {
    fn write_frames(&mut self, chunk: &Chunk<'_>, frames: usize) -> Result<(), hound::Error> {
        let fmt = self.format;
        for f in 0..frames {
            for c in 0..fmt.channels as usize {
                let b = chunk.sample(&fmt, f, c);
                match fmt.sample {
                    SampleFormat::U8 => self.inner.write_sample((b[0] as i16 - 128) as i8)?,
                    SampleFormat::I16 => self.inner.write_sample(i16::from_le_bytes([b[0], b[1]]))?,
                    SampleFormat::I24 => {
                        self.inner.write_sample(i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8)?
                    }
                    SampleFormat::I32 => {
                        self.inner.write_sample(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))?
                    }
                    SampleFormat::F32 => {
                        self.inner.write_sample(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))?
                    }
                    SampleFormat::F64 => return Err(hound::Error::Unsupported),
                }
            }
        }
        Ok(())
    }
}

struct WavOutput {
    encode: EncodeConfig,
    requested: bool,
    writer: Option<Writer>,
    frames: u64,
}

impl WavOutput {
    fn create(&mut self, track: &Track, fmt: PcmFormat) -> Result<(), PipelineError> {
        let path = track
            .output
            .as_ref()
            .ok_or_else(|| PipelineError::Config(format!("{NAME}: track has no output path")))?;
        let spec = wav_spec(&fmt)?;
        let inner = hound::WavWriter::create(path, spec).map_err(wav_error)?;
        tracing::info!(path = %path.display(), format = %fmt, "writing wav");
        self.writer = Some(Writer { inner, format: fmt });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), PipelineError> {
        if let Some(w) = self.writer.take() {
            w.inner.finalize().map_err(wav_error)?;
            tracing::debug!(frames = self.frames, "wav finalized");
        }
        Ok(())
    }

    fn write(&mut self, track: &Track, input: &mut Input<'_>) -> Result<(), PipelineError> {
        let Some(fmt) = input.format() else {
            return Ok(());
        };
        let frames = input.chunk().frames(&fmt);
        if frames == 0 {
            return Ok(());
        }
        match &self.writer {
            Some(w) if w.format != fmt => {
                return Err(PipelineError::unsupported(
                    NAME,
                    format!("format changed from {} to {fmt}", w.format),
                ));
            }
            Some(_) => {}
            None => self.create(track, fmt)?,
        }
        if let Some(w) = self.writer.as_mut() {
            w.write_frames(&input.chunk(), frames).map_err(wav_error)?;
        }
        input.consume_frames(&fmt, frames);
        self.frames += frames as u64;
        Ok(())
    }
}

impl Stage for WavOutput {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if !self.requested {
            self.requested = true;
            let req = self.encode.request();
            if req.sample == Some(SampleFormat::F64) {
                return Err(PipelineError::unsupported(NAME, "64-bit float samples"));
            }
            cx.request_format(req);
            // Let upstream converters see the request before any data is written.
            if !cx.input.is_last() {
                return Ok(Flow::NeedMore);
            }
        }

        self.write(cx.track, &mut cx.input)?;

        if cx.input.is_last() || cx.track.stop_requested() {
            if self.writer.is_none() {
                if let Some(fmt) = cx.input.format() {
                    self.create(cx.track, fmt)?;
                }
            }
            cx.input.consume(cx.input.remaining());
            self.finish()?;
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        Ok(Flow::NeedMore)
    }

    fn close(&mut self, _track: &mut Track) {
        if let Err(e) = self.finish() {
            tracing::error!("wav finalize: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stage: &mut Box<dyn Stage>, track: &mut Track, data: &[u8], fmt: PcmFormat, last: bool) -> bool {
        let mut cx = StageContext::new(track, Input::new(Chunk::Interleaved(data), Some(fmt), last), 4);
        matches!(stage.process(&mut cx).unwrap(), Flow::Done(_))
    }

    #[test]
    fn writes_s16_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut track = Track::new(1).with_output(&path);
        let mut stage = WavOutputFactory::new(EncodeConfig::default())
            .open(&mut track)
            .unwrap();
        let fmt = PcmFormat::new(SampleFormat::I16, 2, 22_050);
        let data: Vec<u8> = [1i16, -1, 300, -300].iter().flat_map(|s| s.to_le_bytes()).collect();

        assert!(!run(&mut stage, &mut track, &[], fmt, false));
        assert!(!run(&mut stage, &mut track, &data, fmt, false));
        assert!(run(&mut stage, &mut track, &[], fmt, true));
        stage.close(&mut track);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 22_050);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -1, 300, -300]);
    }

    #[test]
    fn posts_encode_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut track = Track::new(1).with_output(dir.path().join("x.wav"));
        let encode = EncodeConfig {
            format: Some(SampleFormat::I24),
            rate: Some(48_000),
            channels: None,
        };
        let mut stage = WavOutputFactory::new(encode).open(&mut track).unwrap();
        let fmt = PcmFormat::new(SampleFormat::F32, 1, 44_100);
        run(&mut stage, &mut track, &[], fmt, false);
        let mut cx = StageContext::new(&mut track, Input::new(Chunk::EMPTY, None, false), 1);
        assert_eq!(cx.take_request(|r| &mut r.sample), Some(SampleFormat::I24));
        assert_eq!(cx.take_request(|r| &mut r.rate), Some(48_000));
        assert_eq!(cx.take_request(|r| &mut r.channels), None);
    }

    #[test]
    fn missing_output_path_is_config_error() {
        let mut track = Track::new(1);
        let err = WavOutputFactory::new(EncodeConfig::default())
            .open(&mut track)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
