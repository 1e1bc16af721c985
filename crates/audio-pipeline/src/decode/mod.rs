//! Decoder stages.
//!
//! Every decoder runs the same header, tags, data loop; the codec itself only
//! reports what it found. [`DecodeLoop`] turns those reports into track
//! updates and pipeline control flow.

mod symphonia;
mod wav;

pub use self::symphonia::SymphoniaDecodeFactory;
pub use self::wav::WavDecodeFactory;

use crate::buffer::{Chunk, Input};
use crate::error::PipelineError;
use crate::format::PcmFormat;
use crate::stage::{Flow, Stage, StageContext};
use crate::track::Track;

/// Stream parameters known once the header is parsed.
#[derive(Clone, Debug)]
pub(crate) struct StreamInfo {
    pub format: PcmFormat,
    /// Frames in the stream including the codec delay, when known.
    pub total_frames: Option<u64>,
    /// Frames the codec emits before the first real sample.
    pub delay: u64,
    pub codec: String,
}

#[derive(Debug)]
pub(crate) enum CodecEvent {
    /// Needs more input bytes.
    More,
    Header(StreamInfo),
    Tag { key: String, value: String },
    /// Everything before the audio data has been reported.
    HeaderDone,
    /// `frames` frames of PCM are available from [`Codec::pcm`].
    Data(usize),
    /// Continue reading the input at this byte offset.
    SeekInput(u64),
    Done,
}

pub(crate) trait Codec {
    fn decode(&mut self, input: &mut Input<'_>) -> Result<CodecEvent, PipelineError>;

    /// PCM produced by the last [`CodecEvent::Data`].
    fn pcm(&self) -> Chunk<'_>;

    /// Reposition to `frame`, counted in codec frames (delay included).
    fn seek(&mut self, frame: u64) -> Result<(), PipelineError>;

    fn close(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Header,
    Tags,
    Data,
}

pub(crate) struct DecodeLoop<C> {
    name: &'static str,
    codec: C,
    state: State,
    format: Option<PcmFormat>,
    delay: u64,
}

impl<C: Codec> DecodeLoop<C> {
    pub(crate) fn new(name: &'static str, codec: C) -> Self {
        Self {
            name,
            codec,
            state: State::Header,
            format: None,
            delay: 0,
        }
    }

    fn apply_seek(&mut self, track: &mut Track) -> Result<(), PipelineError> {
        let Some(pos) = track.seek_request.take() else {
            return Ok(());
        };
        let Some(fmt) = self.format else {
            return Err(PipelineError::protocol(self.name, "seek before header"));
        };
        let mut frame = pos.to_frames(fmt.rate);
        if let Some(total) = track.total_length {
            frame = frame.min(total);
        }
        tracing::debug!(stage = self.name, frame, "seeking");
        self.codec.seek(frame + self.delay)?;
        track.current_position = frame;
        track.seeked_to = Some(frame);
        Ok(())
    }

    fn on_header(&mut self, info: StreamInfo, cx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        info.format.validate(self.name)?;
        let total = info.total_frames.map(|t| t.saturating_sub(info.delay));
        tracing::info!(
            codec = %info.codec,
            format = %info.format,
            frames = ?total,
            "decoding"
        );
        cx.track.total_length = total;
        cx.track.source_format = Some(info.format);
        cx.track.codec = Some(info.codec);
        cx.set_output_format(info.format);
        self.format = Some(info.format);
        self.delay = info.delay;
        self.state = State::Tags;
        Ok(())
    }

    fn incomplete(&self, track: &Track) -> bool {
        match self.state {
            State::Data => track
                .total_length
                .is_some_and(|total| track.current_position < total),
            _ => true,
        }
    }
}

impl<C: Codec> Stage for DecodeLoop<C> {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        // Decoded PCM is returned as soon as the codec reports it.
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }
        if self.state == State::Data {
            self.apply_seek(cx.track)?;
        }

        loop {
            match self.codec.decode(&mut cx.input)? {
                CodecEvent::More => {
                    if !cx.input.is_last() {
                        return Ok(Flow::NeedMore);
                    }
                    if self.incomplete(cx.track) {
                        tracing::warn!(stage = self.name, "file is incomplete");
                    }
                    cx.input.consume(cx.input.remaining());
                    return Ok(Flow::Done(Chunk::EMPTY));
                }
                CodecEvent::Header(info) => self.on_header(info, cx)?,
                CodecEvent::Tag { key, value } => cx.track.set_meta(&key, &value),
                CodecEvent::HeaderDone => {
                    if self.format.is_none() {
                        return Err(PipelineError::protocol(self.name, "no header before data"));
                    }
                    self.state = State::Data;
                    if cx.track.info_only {
                        return Ok(Flow::Done(Chunk::EMPTY));
                    }
                    // A seek may have been queued before the data started.
                    self.apply_seek(cx.track)?;
                }
                CodecEvent::SeekInput(offset) => {
                    cx.track.input_seek = Some(offset);
                    return Ok(Flow::NeedMore);
                }
                CodecEvent::Data(frames) => {
                    cx.track.current_position += frames as u64;
                    return Ok(Flow::Data(self.codec.pcm()));
                }
                CodecEvent::Done => return Ok(Flow::Done(Chunk::EMPTY)),
            }
        }
    }

    fn close(&mut self, track: &mut Track) {
        tracing::debug!(
            stage = self.name,
            position = track.current_position,
            "decoder closed"
        );
        self.codec.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::track::Position;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        events: VecDeque<CodecEvent>,
        seeks: Arc<Mutex<Vec<u64>>>,
        out: Vec<u8>,
    }

    impl Codec for Scripted {
        fn decode(&mut self, _input: &mut Input<'_>) -> Result<CodecEvent, PipelineError> {
            Ok(self.events.pop_front().unwrap_or(CodecEvent::More))
        }

        fn pcm(&self) -> Chunk<'_> {
            Chunk::Interleaved(&self.out)
        }

        fn seek(&mut self, frame: u64) -> Result<(), PipelineError> {
            self.seeks.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn header(delay: u64) -> CodecEvent {
        CodecEvent::Header(StreamInfo {
            format: PcmFormat::new(SampleFormat::I16, 2, 1000),
            total_frames: Some(1000 + delay),
            delay,
            codec: "TEST".into(),
        })
    }

    fn scripted(events: Vec<CodecEvent>) -> (DecodeLoop<Scripted>, Arc<Mutex<Vec<u64>>>) {
        let seeks = Arc::new(Mutex::new(Vec::new()));
        let codec = Scripted {
            events: events.into(),
            seeks: seeks.clone(),
            out: vec![0; 8],
        };
        (DecodeLoop::new("decode.test", codec), seeks)
    }

    fn call<'s>(stage: &'s mut DecodeLoop<Scripted>, track: &mut Track, last: bool) -> Flow<'s> {
        let mut cx = StageContext::new(track, Input::new(Chunk::EMPTY, None, last), 0);
        stage.process(&mut cx).unwrap()
    }

    #[test]
    fn header_and_tags_reach_the_track() {
        let tags = Arc::new(Mutex::new(Vec::new()));
        let sink = tags.clone();
        let mut track = Track::new(1).with_meta_sink(move |k: &str, v: &str| {
            sink.lock().unwrap().push(format!("{k}={v}"));
        });
        let (mut stage, _) = scripted(vec![
            header(100),
            CodecEvent::Tag {
                key: "title".into(),
                value: "Song".into(),
            },
            CodecEvent::HeaderDone,
            CodecEvent::Data(2),
        ]);
        assert!(matches!(call(&mut stage, &mut track, false), Flow::Data(c) if c.len() == 8));
        assert_eq!(track.total_length, Some(1000));
        assert_eq!(track.codec.as_deref(), Some("TEST"));
        assert_eq!(track.current_position, 2);
        assert_eq!(*tags.lock().unwrap(), vec!["title=Song".to_string()]);
    }

    #[test]
    fn info_only_stops_after_header() {
        let mut track = Track::new(1);
        track.info_only = true;
        let (mut stage, _) = scripted(vec![header(0), CodecEvent::HeaderDone, CodecEvent::Data(2)]);
        assert!(matches!(call(&mut stage, &mut track, false), Flow::Done(c) if c.is_empty()));
        assert_eq!(track.source_format.map(|f| f.channels), Some(2));
    }

    #[test]
    fn truncated_input_finishes() {
        let mut track = Track::new(1);
        let (mut stage, _) = scripted(vec![header(0), CodecEvent::HeaderDone]);
        assert!(matches!(call(&mut stage, &mut track, false), Flow::NeedMore));
        assert!(matches!(call(&mut stage, &mut track, true), Flow::Done(_)));
    }

    #[test]
    fn seek_adds_codec_delay() {
        let mut track = Track::new(1);
        let (mut stage, seeks) = scripted(vec![
            header(50),
            CodecEvent::HeaderDone,
            CodecEvent::Data(2),
            CodecEvent::Data(2),
        ]);
        call(&mut stage, &mut track, false);
        track.seek_request = Some(Position::Frames(300));
        call(&mut stage, &mut track, false);
        assert_eq!(*seeks.lock().unwrap(), vec![350]);
        assert!(track.seek_request.is_none());
        assert_eq!(track.seeked_to, Some(300));
        assert_eq!(track.current_position, 302);
    }

    #[test]
    fn stop_before_header_is_done() {
        let mut track = Track::new(1);
        let (mut stage, _) = scripted(vec![header(0)]);
        track.request_stop();
        assert!(matches!(call(&mut stage, &mut track, false), Flow::Done(c) if c.is_empty()));
        assert!(track.source_format.is_none());
    }

    #[test]
    fn stop_mid_stream_decodes_nothing_more() {
        let mut track = Track::new(1);
        let (mut stage, _) = scripted(vec![
            header(0),
            CodecEvent::HeaderDone,
            CodecEvent::Data(2),
            CodecEvent::Data(2),
        ]);
        assert!(matches!(call(&mut stage, &mut track, false), Flow::Data(_)));
        track.request_stop();
        assert!(matches!(call(&mut stage, &mut track, false), Flow::Done(c) if c.is_empty()));
        assert_eq!(track.current_position, 2);
    }
}
