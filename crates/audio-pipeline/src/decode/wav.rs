//! `decode.wav`: incremental RIFF/WAVE parser fed by `in.file`.

use std::collections::VecDeque;

use crate::buffer::{Chunk, Input};
use crate::decode::{Codec, CodecEvent, DecodeLoop, StreamInfo};
use crate::error::PipelineError;
use crate::format::{PcmFormat, SampleFormat};
use crate::stage::{Stage, StageFactory};
use crate::track::Track;

const NAME: &str = "decode.wav";

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_FLOAT: u16 = 0x0003;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// LIST chunks larger than this are skipped rather than buffered.
const MAX_LIST_SIZE: u32 = 1 << 20;
/// Largest `fmt ` chunk accepted; real ones are at most a few dozen bytes.
const MAX_FMT_SIZE: u32 = 64 * 1024;

pub struct WavDecodeFactory;

impl StageFactory for WavDecodeFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, _track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        Ok(Box::new(DecodeLoop::new(NAME, WavCodec::new())))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Riff,
    ChunkHeader,
    Fmt(u32),
    List(u32),
    Skip(u64),
    Data,
    Done,
}

pub(crate) struct WavCodec {
    state: State,
    header: Vec<u8>,
    format: Option<PcmFormat>,
    block_align: usize,
    /// Size field of the RIFF header; 0 or all ones when written as a stream.
    riff_size: u32,
    /// File offset of the next input byte.
    offset: u64,
    data_start: u64,
    data_len: Option<u64>,
    data_left: Option<u64>,
    tags: Vec<(String, String)>,
    events: VecDeque<CodecEvent>,
    pending_seek: Option<u64>,
    out: Vec<u8>,
}

impl WavCodec {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Riff,
            header: Vec::new(),
            format: None,
            block_align: 0,
            riff_size: 0,
            offset: 0,
            data_start: 0,
            data_len: None,
            data_left: None,
            tags: Vec::new(),
            events: VecDeque::new(),
            pending_seek: None,
            out: Vec::new(),
        }
    }

    /// Accumulate header bytes until `n` are buffered.
    fn gather(&mut self, input: &mut Input<'_>, n: usize) -> bool {
        let want = n.saturating_sub(self.header.len());
        let bytes = input.bytes();
        let take = want.min(bytes.len());
        self.header.extend_from_slice(&bytes[..take]);
        input.consume(take);
        self.offset += take as u64;
        self.header.len() >= n
    }

    fn parse_fmt(&mut self, size: u32) -> Result<(), PipelineError> {
        let h = &self.header;
        if size < 16 {
            return Err(PipelineError::decode(NAME, format!("fmt chunk too short ({size} bytes)")));
        }
        let mut tag = u16_at(h, 0);
        let channels = u16_at(h, 2);
        let rate = u32_at(h, 4);
        let block_align = u16_at(h, 12) as usize;
        let bits = u16_at(h, 14);
        if tag == FORMAT_EXTENSIBLE {
            if size < 40 {
                return Err(PipelineError::decode(NAME, "truncated extensible fmt chunk"));
            }
            tag = u16_at(h, 24);
        }
        let sample = match (tag, bits) {
            (FORMAT_PCM, 8) => SampleFormat::U8,
            (FORMAT_PCM, 16) => SampleFormat::I16,
            (FORMAT_PCM, 24) => SampleFormat::I24,
            (FORMAT_PCM, 32) => SampleFormat::I32,
            (FORMAT_FLOAT, 32) => SampleFormat::F32,
            (FORMAT_FLOAT, 64) => SampleFormat::F64,
            _ => {
                return Err(PipelineError::unsupported(
                    NAME,
                    format!("format tag {tag:#06x} with {bits} bits"),
                ));
            }
        };
        let format = PcmFormat::new(sample, channels, rate);
        if block_align != format.frame_size() {
            return Err(PipelineError::unsupported(
                NAME,
                format!("block align {block_align} for {format}"),
            ));
        }
        self.block_align = block_align;
        self.format = Some(format);
        Ok(())
    }

    fn parse_list(&mut self) {
        let h = &self.header;
        if h.len() < 4 || &h[..4] != b"INFO" {
            return;
        }
        let mut pos = 4;
        while pos + 8 <= h.len() {
            let id = &h[pos..pos + 4];
            let size = u32_at(h, pos + 4) as usize;
            let start = pos + 8;
            let end = (start + size).min(h.len());
            if let Some(key) = info_key(id) {
                let value = String::from_utf8_lossy(&h[start..end]);
                let value = value.trim_end_matches('\0').trim();
                if !value.is_empty() {
                    self.tags.push((key.to_string(), value.to_string()));
                }
            }
            pos = start + size + (size & 1);
        }
    }

    fn start_data(&mut self, size: u32) -> Result<(), PipelineError> {
        let Some(format) = self.format else {
            return Err(PipelineError::decode(NAME, "data chunk before fmt chunk"));
        };
        self.data_start = self.offset;
        let streamed = matches!(self.riff_size, 0 | u32::MAX);
        self.data_len = match size {
            u32::MAX => None,
            0 if streamed => None,
            n => Some(n as u64),
        };
        self.data_left = self.data_len;
        let total_frames = self.data_len.map(|l| l / self.block_align as u64);
        tracing::debug!(data_start = self.data_start, data_len = ?self.data_len, "wav data chunk");

        self.events.push_back(CodecEvent::Header(StreamInfo {
            format,
            total_frames,
            delay: 0,
            codec: "PCM".to_string(),
        }));
        for (key, value) in self.tags.drain(..) {
            self.events.push_back(CodecEvent::Tag { key, value });
        }
        self.events.push_back(CodecEvent::HeaderDone);
        self.state = State::Data;
        Ok(())
    }

    fn read_data(&mut self, input: &mut Input<'_>) -> CodecEvent {
        let bytes = input.bytes();
        let mut n = bytes.len();
        if let Some(left) = self.data_left {
            if left == 0 {
                self.state = State::Done;
                return CodecEvent::Done;
            }
            n = n.min(usize::try_from(left).unwrap_or(usize::MAX));
        }
        n -= n % self.block_align;
        if n == 0 {
            return CodecEvent::More;
        }
        self.out.clear();
        self.out.extend_from_slice(&bytes[..n]);
        input.consume(n);
        self.offset += n as u64;
        if let Some(left) = self.data_left.as_mut() {
            *left -= n as u64;
        }
        CodecEvent::Data(n / self.block_align)
    }
}

impl Codec for WavCodec {
    fn decode(&mut self, input: &mut Input<'_>) -> Result<CodecEvent, PipelineError> {
        if let Some(off) = self.pending_seek.take() {
            self.offset = off;
            return Ok(CodecEvent::SeekInput(off));
        }
        loop {
            if let Some(ev) = self.events.pop_front() {
                return Ok(ev);
            }
            match self.state {
                State::Riff => {
                    if !self.gather(input, 12) {
                        return Ok(CodecEvent::More);
                    }
                    if &self.header[..4] != b"RIFF" || &self.header[8..12] != b"WAVE" {
                        return Err(PipelineError::decode(NAME, "not a RIFF/WAVE file"));
                    }
                    self.riff_size = u32_at(&self.header, 4);
                    self.header.clear();
                    self.state = State::ChunkHeader;
                }
                State::ChunkHeader => {
                    if !self.gather(input, 8) {
                        return Ok(CodecEvent::More);
                    }
                    let size = u32_at(&self.header, 4);
                    let id = [self.header[0], self.header[1], self.header[2], self.header[3]];
                    self.header.clear();
                    match &id {
                        b"fmt " if size > MAX_FMT_SIZE => {
                            return Err(PipelineError::decode(
                                NAME,
                                format!("fmt chunk too large ({size} bytes)"),
                            ));
                        }
                        b"fmt " => self.state = State::Fmt(size),
                        b"LIST" if size <= MAX_LIST_SIZE => self.state = State::List(size),
                        b"data" => self.start_data(size)?,
                        _ => {
                            tracing::trace!(chunk = %String::from_utf8_lossy(&id), size, "skipping chunk");
                            self.state = State::Skip(size as u64 + (size & 1) as u64);
                        }
                    }
                }
                State::Fmt(size) => {
                    if !self.gather(input, padded(size)) {
                        return Ok(CodecEvent::More);
                    }
                    self.parse_fmt(size)?;
                    self.header.clear();
                    self.state = State::ChunkHeader;
                }
                State::List(size) => {
                    if !self.gather(input, padded(size)) {
                        return Ok(CodecEvent::More);
                    }
                    self.parse_list();
                    self.header.clear();
                    self.state = State::ChunkHeader;
                }
                State::Skip(left) => {
                    let n = (input.remaining() as u64).min(left);
                    input.consume(n as usize);
                    self.offset += n;
                    if n < left {
                        self.state = State::Skip(left - n);
                        return Ok(CodecEvent::More);
                    }
                    self.state = State::ChunkHeader;
                }
                State::Data => return Ok(self.read_data(input)),
                State::Done => return Ok(CodecEvent::Done),
            }
        }
    }

    fn pcm(&self) -> Chunk<'_> {
        Chunk::Interleaved(&self.out)
    }

    fn seek(&mut self, frame: u64) -> Result<(), PipelineError> {
        if self.format.is_none() {
            return Err(PipelineError::protocol(NAME, "seek before data chunk"));
        }
        let ba = self.block_align as u64;
        let total = self.data_len.map(|l| l / ba);
        let frame = total.map_or(frame, |t| frame.min(t));
        let byte = frame * ba;
        self.data_left = self.data_len.map(|l| l - byte);
        self.pending_seek = Some(self.data_start + byte);
        self.state = State::Data;
        Ok(())
    }
}

fn padded(size: u32) -> usize {
    size as usize + (size & 1) as usize
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn info_key(id: &[u8]) -> Option<&'static str> {
    Some(match id {
        b"INAM" => "title",
        b"IART" => "artist",
        b"IPRD" => "album",
        b"ICMT" => "comment",
        b"ICRD" => "date",
        b"IGNR" => "genre",
        b"ITRK" => "tracknumber",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Layout;

    fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        if body.len() % 2 == 1 {
            out.push(0);
        }
        out
    }

    fn fmt_body(tag: u16, channels: u16, rate: u32, bits: u16) -> Vec<u8> {
        let align = channels * bits / 8;
        let mut b = Vec::new();
        b.extend_from_slice(&tag.to_le_bytes());
        b.extend_from_slice(&channels.to_le_bytes());
        b.extend_from_slice(&rate.to_le_bytes());
        b.extend_from_slice(&(rate * align as u32).to_le_bytes());
        b.extend_from_slice(&align.to_le_bytes());
        b.extend_from_slice(&bits.to_le_bytes());
        b
    }

    fn wav(fmt: Vec<u8>, extra: &[Vec<u8>], data: &[u8], data_size: Option<u32>) -> Vec<u8> {
        let mut body = b"WAVE".to_vec();
        body.extend(chunk(b"fmt ", &fmt));
        for c in extra {
            body.extend_from_slice(c);
        }
        body.extend_from_slice(b"data");
        body.extend_from_slice(&data_size.unwrap_or(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);
        let mut out = b"RIFF".to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend(body);
        out
    }

    fn info_list() -> Vec<u8> {
        let mut body = b"INFO".to_vec();
        body.extend(chunk(b"INAM", b"Song\0"));
        body.extend(chunk(b"IART", b"Band\0"));
        body.extend(chunk(b"ISFT", b"Lavf\0"));
        chunk(b"LIST", &body)
    }

    /// Feed `bytes` in `step`-sized pieces and collect every event.
    fn drive(codec: &mut WavCodec, bytes: &[u8], step: usize) -> Vec<CodecEvent> {
        let mut events = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut fed = 0;
        loop {
            let mut input = Input::new(Chunk::Interleaved(&pending), None, fed >= bytes.len());
            let ev = codec.decode(&mut input).unwrap();
            let consumed = input.consumed();
            pending.drain(..consumed);
            match ev {
                CodecEvent::More if fed < bytes.len() => {
                    let end = (fed + step).min(bytes.len());
                    pending.extend_from_slice(&bytes[fed..end]);
                    fed = end;
                }
                CodecEvent::More | CodecEvent::Done => {
                    events.push(ev);
                    return events;
                }
                ev => events.push(ev),
            }
        }
    }

    #[test]
    fn parses_header_tags_and_data_in_small_pieces() {
        let data: Vec<u8> = (0..40u8).collect();
        let file = wav(fmt_body(FORMAT_PCM, 2, 8000, 16), &[info_list()], &data, None);
        let mut codec = WavCodec::new();
        let events = drive(&mut codec, &file, 3);

        let CodecEvent::Header(info) = &events[0] else {
            panic!("expected header, got {:?}", events[0]);
        };
        assert_eq!(info.format, PcmFormat::new(SampleFormat::I16, 2, 8000));
        assert_eq!(info.format.layout, Layout::Interleaved);
        assert_eq!(info.total_frames, Some(10));

        let tags: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CodecEvent::Tag { key, value } => Some((key.as_str(), value.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(tags, vec![("title", "Song"), ("artist", "Band")]);
        assert!(events.iter().any(|e| matches!(e, CodecEvent::HeaderDone)));

        let frames: usize = events
            .iter()
            .filter_map(|e| match e {
                CodecEvent::Data(n) => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(frames, 10);
        assert!(matches!(events.last(), Some(CodecEvent::Done)));
    }

    #[test]
    fn float_and_extensible_formats() {
        let mut codec = WavCodec::new();
        let file = wav(fmt_body(FORMAT_FLOAT, 1, 48_000, 32), &[], &[0; 8], None);
        let events = drive(&mut codec, &file, 64);
        assert!(matches!(&events[0], CodecEvent::Header(i) if i.format.sample == SampleFormat::F32));

        let mut ext = fmt_body(FORMAT_EXTENSIBLE, 2, 96_000, 24);
        ext.extend_from_slice(&22u16.to_le_bytes());
        ext.extend_from_slice(&24u16.to_le_bytes());
        ext.extend_from_slice(&3u32.to_le_bytes());
        ext.extend_from_slice(&FORMAT_PCM.to_le_bytes());
        ext.extend_from_slice(&[0; 14]);
        let mut codec = WavCodec::new();
        let events = drive(&mut codec, &wav(ext, &[], &[0; 12], None), 64);
        assert!(matches!(&events[0], CodecEvent::Header(i) if i.format.sample == SampleFormat::I24));
    }

    #[test]
    fn unknown_length_reads_to_end_of_input() {
        let file = wav(fmt_body(FORMAT_PCM, 1, 8000, 16), &[], &[1; 20], Some(u32::MAX));
        let mut codec = WavCodec::new();
        let events = drive(&mut codec, &file, 7);
        assert!(matches!(&events[0], CodecEvent::Header(i) if i.total_frames.is_none()));
        let frames: usize = events
            .iter()
            .filter_map(|e| match e {
                CodecEvent::Data(n) => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(frames, 10);
        assert!(matches!(events.last(), Some(CodecEvent::More)));
    }

    #[test]
    fn seek_requests_input_offset() {
        let file = wav(fmt_body(FORMAT_PCM, 2, 8000, 16), &[], &[0; 400], None);
        let mut codec = WavCodec::new();
        let mut input = Input::new(Chunk::Interleaved(&file[..44]), None, false);
        loop {
            if let CodecEvent::HeaderDone = codec.decode(&mut input).unwrap() {
                break;
            }
        }
        assert_eq!(codec.data_start, 44);
        codec.seek(25).unwrap();
        let mut empty = Input::new(Chunk::EMPTY, None, false);
        assert!(matches!(codec.decode(&mut empty).unwrap(), CodecEvent::SeekInput(144)));
        assert_eq!(codec.data_left, Some(300));
    }

    #[test]
    fn rejects_non_wave_and_unsupported_formats() {
        let mut codec = WavCodec::new();
        let mut input = Input::new(Chunk::Interleaved(b"OggS\0\0\0\0\0\0\0\0"), None, false);
        assert!(codec.decode(&mut input).is_err());

        let file = wav(fmt_body(0x0055, 2, 44_100, 16), &[], &[], None);
        let mut codec = WavCodec::new();
        let mut input = Input::new(Chunk::Interleaved(&file), None, true);
        let err = loop {
            match codec.decode(&mut input) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
    }

    #[test]
    fn oversized_fmt_chunk_is_rejected() {
        let mut file = b"RIFF".to_vec();
        file.extend_from_slice(&u32::MAX.to_le_bytes());
        file.extend_from_slice(b"WAVEfmt ");
        file.extend_from_slice(&(1u32 << 24).to_le_bytes());
        file.extend_from_slice(&[0; 64]);
        let mut codec = WavCodec::new();
        let mut input = Input::new(Chunk::Interleaved(&file), None, false);
        let err = codec.decode(&mut input).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
        assert!(codec.header.is_empty());
    }

    #[test]
    fn empty_data_chunk_ignores_trailing_chunks() {
        let trailer = chunk(b"LIST", &[7; 32]);
        let file = wav(fmt_body(FORMAT_PCM, 2, 8000, 16), &[], &trailer, Some(0));
        let mut codec = WavCodec::new();
        let events = drive(&mut codec, &file, 16);
        assert!(matches!(&events[0], CodecEvent::Header(i) if i.total_frames == Some(0)));
        assert!(!events.iter().any(|e| matches!(e, CodecEvent::Data(_))));
        assert!(matches!(events.last(), Some(CodecEvent::Done)));
    }

    #[test]
    fn streamed_file_with_zero_sizes_reads_to_end() {
        let mut file = wav(fmt_body(FORMAT_PCM, 1, 8000, 16), &[], &[1; 20], Some(0));
        file[4..8].copy_from_slice(&0u32.to_le_bytes());
        let mut codec = WavCodec::new();
        let events = drive(&mut codec, &file, 7);
        assert!(matches!(&events[0], CodecEvent::Header(i) if i.total_frames.is_none()));
        let frames: usize = events
            .iter()
            .filter_map(|e| match e {
                CodecEvent::Data(n) => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(frames, 10);
    }
}
