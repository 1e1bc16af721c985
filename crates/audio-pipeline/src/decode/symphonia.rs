//! `decode.symphonia`: container and codec decoding through Symphonia.
//!
//! Symphonia reads the file itself, so this stage starts a chain and emits
//! interleaved `f32` PCM.

use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::buffer::{Chunk, Input};
use crate::decode::{Codec, CodecEvent, DecodeLoop, StreamInfo};
use crate::error::PipelineError;
use crate::format::{PcmFormat, SampleFormat};
use crate::stage::{Stage, StageFactory};
use crate::track::Track;

const NAME: &str = "decode.symphonia";

pub struct SymphoniaDecodeFactory;

impl StageFactory for SymphoniaDecodeFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        let path = track
            .input
            .clone()
            .ok_or_else(|| PipelineError::Config(format!("{NAME}: track has no input path")))?;
        let codec = SymphoniaCodec::open(&path)?;
        track.input_size = codec.file_size;
        Ok(Box::new(DecodeLoop::new(NAME, codec)))
    }
}

pub(crate) struct SymphoniaCodec {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: Option<StreamInfo>,
    tags: Vec<(String, String)>,
    file_size: Option<u64>,
    sample_buf: Option<SampleBuffer<f32>>,
    /// Frames to drop from the next packets, up to this timestamp.
    trim_to: Option<u64>,
    /// Timestamp where the encoder padding starts.
    end_ts: Option<u64>,
    out: Vec<u8>,
    header_sent: bool,
}

impl SymphoniaCodec {
    fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| PipelineError::open(path, e))?;
        let file_size = file.metadata().ok().map(|m| m.len());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        // Delay and padding are trimmed here so the decode loop sees codec
        // timestamps and can offset seeks by the delay.
        let format_opts = FormatOptions {
            enable_gapless: false,
            ..Default::default()
        };
        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| PipelineError::decode(NAME, format!("probe {}: {e}", path.display())))?;

        let mut tags = Vec::new();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(rev, &mut tags);
        }
        let mut format = probed.format;
        if let Some(rev) = format.metadata().current() {
            collect_tags(rev, &mut tags);
        }
        // Handed out with pop().
        tags.reverse();

        let track = format
            .default_track()
            .ok_or_else(|| PipelineError::decode(NAME, "no default audio track"))?;
        let params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let channels = params
            .channels
            .ok_or_else(|| PipelineError::decode(NAME, "unknown channel layout"))?
            .count();
        let rate = params
            .sample_rate
            .ok_or_else(|| PipelineError::decode(NAME, "unknown sample rate"))?;
        let channels = u16::try_from(channels)
            .map_err(|_| PipelineError::unsupported(NAME, format!("{channels} channels")))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| PipelineError::unsupported(NAME, e.to_string()))?;

        let (info, end_ts) = stream_info(&params, PcmFormat::new(SampleFormat::F32, channels, rate));
        if info.delay > 0 || end_ts.is_some() {
            tracing::debug!(stage = NAME, delay = info.delay, end = ?end_ts, "gapless trim");
        }
        let trim_to = (info.delay > 0).then_some(info.delay);

        Ok(Self {
            format,
            decoder,
            track_id,
            info: Some(info),
            tags,
            file_size,
            sample_buf: None,
            trim_to,
            end_ts,
            out: Vec::new(),
            header_sent: false,
        })
    }

    fn rate(&self) -> u32 {
        self.decoder.codec_params().sample_rate.unwrap_or(1).max(1)
    }
}

impl Codec for SymphoniaCodec {
    fn decode(&mut self, _input: &mut Input<'_>) -> Result<CodecEvent, PipelineError> {
        if let Some(info) = self.info.take() {
            return Ok(CodecEvent::Header(info));
        }
        if let Some((key, value)) = self.tags.pop() {
            return Ok(CodecEvent::Tag { key, value });
        }
        if !self.header_sent {
            self.header_sent = true;
            return Ok(CodecEvent::HeaderDone);
        }

        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(CodecEvent::Done);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(PipelineError::decode(NAME, format!("read packet: {e}"))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(msg)) => {
                    tracing::warn!(stage = NAME, "skipping corrupt packet: {msg}");
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(PipelineError::decode(NAME, e.to_string())),
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            if self
                .sample_buf
                .as_ref()
                .is_none_or(|b| (b.capacity() as u64) < capacity * spec.channels.count() as u64)
            {
                self.sample_buf = Some(SampleBuffer::<f32>::new(capacity, spec));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let channels = spec.channels.count().max(1);
            let frames = buf.samples().len() / channels;
            let ts = packet.ts();
            if self.end_ts.is_some_and(|end| ts >= end) {
                return Ok(CodecEvent::Done);
            }
            let keep = keep_range(ts, frames, self.trim_to, self.end_ts);
            if self.trim_to.is_some_and(|t| t < ts + frames as u64) {
                self.trim_to = None;
            }
            if keep.is_empty() {
                continue;
            }
            let samples = &buf.samples()[keep.start * channels..keep.end * channels];

            self.out.clear();
            self.out.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
            return Ok(CodecEvent::Data(samples.len() / channels));
        }
    }

    fn pcm(&self) -> Chunk<'_> {
        Chunk::Interleaved(&self.out)
    }

    fn seek(&mut self, frame: u64) -> Result<(), PipelineError> {
        let rate = self.rate() as u64;
        let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| PipelineError::decode(NAME, format!("seek failed: {e}")))?;
        self.decoder.reset();
        self.trim_to = Some(seeked.required_ts);
        Ok(())
    }
}

fn collect_tags(rev: &MetadataRevision, out: &mut Vec<(String, String)>) {
    for tag in rev.tags() {
        let key = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => "title".to_string(),
            Some(StandardTagKey::Artist) => "artist".to_string(),
            Some(StandardTagKey::AlbumArtist) => "albumartist".to_string(),
            Some(StandardTagKey::Album) => "album".to_string(),
            Some(StandardTagKey::Date) => "date".to_string(),
            Some(StandardTagKey::Genre) => "genre".to_string(),
            Some(StandardTagKey::TrackNumber) => "tracknumber".to_string(),
            Some(StandardTagKey::DiscNumber) => "discnumber".to_string(),
            Some(StandardTagKey::Comment) => "comment".to_string(),
            _ => tag.key.to_ascii_lowercase(),
        };
        let value = tag.value.to_string();
        if !value.is_empty() {
            out.push((key, value));
        }
    }
}

/// Stream parameters plus the timestamp where trailing padding begins.
///
/// Reported totals include the encoder delay, which the decode loop subtracts.
fn stream_info(params: &CodecParameters, format: PcmFormat) -> (StreamInfo, Option<u64>) {
    let delay = params.delay.map_or(0, u64::from);
    let padding = params.padding.map_or(0, u64::from);
    let total_frames = params.n_frames.map(|n| n.saturating_sub(padding));
    let end_ts = if padding > 0 { total_frames } else { None };
    let info = StreamInfo {
        format,
        total_frames,
        delay,
        codec: codec_name(params),
    };
    (info, end_ts)
}

/// Frames of a packet starting at `ts` that fall inside `[start, end)`.
fn keep_range(ts: u64, frames: usize, start: Option<u64>, end: Option<u64>) -> Range<usize> {
    let stop = end.map_or(frames, |e| e.saturating_sub(ts).min(frames as u64) as usize);
    let skip = start.map_or(0, |s| s.saturating_sub(ts).min(frames as u64) as usize);
    skip.min(stop)..stop
}

/// Best-effort codec label.
fn codec_name(params: &CodecParameters) -> String {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => "unknown",
    };
    name.to_string()
}
