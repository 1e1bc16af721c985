//! `in.file`: feeds raw file bytes into the chain.

use std::path::PathBuf;

use crate::buffer::Chunk;
use crate::config::FileInputConfig;
use crate::error::PipelineError;
use crate::source::cache::{AsyncFileSource, Fetch, ReadMode};
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

pub struct FileInputFactory {
    cfg: FileInputConfig,
}

impl FileInputFactory {
    pub fn new(cfg: FileInputConfig) -> Self {
        Self { cfg }
    }
}

impl StageFactory for FileInputFactory {
    fn name(&self) -> &'static str {
        "in.file"
    }

    fn open(&self, track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        let path = track
            .input
            .clone()
            .ok_or_else(|| PipelineError::Config("in.file: track has no input path".into()))?;
        let src = AsyncFileSource::open(&path, &self.cfg, track.waker())?;
        track.input_size = src.size();
        Ok(Box::new(FileInput {
            path,
            src,
            cursor: 0,
            seek_req: false,
        }))
    }
}

struct FileInput {
    path: PathBuf,
    src: AsyncFileSource,
    cursor: u64,
    /// The last input seek has not produced data yet.
    seek_req: bool,
}

impl Stage for FileInput {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }

        if let Some(off) = cx.track.input_seek.take() {
            tracing::debug!(offset = off, "input seek");
            self.cursor = off;
            self.src.seek(off);
            self.seek_req = true;
        }

        // Right after a seek the decoder may jump again, so don't prefetch yet.
        let mode = if self.seek_req {
            ReadMode::Single
        } else {
            ReadMode::ReadAhead
        };

        match self.src.get_data(self.cursor, mode)? {
            Fetch::Pending => Ok(Flow::Pending),
            Fetch::Eof if self.seek_req => Ok(Flow::Done(Chunk::EMPTY)),
            // Give the decoder a chance to seek back before ending the stream.
            Fetch::Eof => Ok(Flow::Data(Chunk::EMPTY)),
            Fetch::Done => Ok(Flow::Done(Chunk::EMPTY)),
            Fetch::Data(d) => {
                self.cursor += d.len() as u64;
                self.seek_req = false;
                Ok(Flow::Data(Chunk::Interleaved(d)))
            }
        }
    }

    fn close(&mut self, _track: &mut Track) {
        let s = self.src.stats();
        tracing::debug!(
            path = %self.path.display(),
            direct = self.src.is_direct(),
            cache_hits = s.cache_hits,
            reads = s.reads,
            async_waits = s.async_waits,
            seeks = s.seeks,
            "file input stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Input;
    use crate::track::TrackEvent;
    use std::io::Write;
    use std::time::Duration;

    fn call<'s>(stage: &'s mut dyn Stage, track: &mut Track) -> Flow<'s> {
        let mut cx = StageContext::new(track, Input::new(Chunk::EMPTY, None, false), 0);
        stage.process(&mut cx).unwrap()
    }

    /// Call until something other than Pending comes back, returning the byte count.
    fn pull(stage: &mut dyn Stage, track: &mut Track) -> Option<usize> {
        loop {
            match call(stage, track) {
                Flow::Pending => {
                    assert_eq!(
                        track.wait_event(Some(Duration::from_secs(5))),
                        Some(TrackEvent::Resume)
                    );
                }
                Flow::Data(c) => return Some(c.len()),
                Flow::Done(_) => return None,
                other => panic!("unexpected {}", other.name()),
            }
        }
    }

    #[test]
    fn streams_whole_file_then_ends() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![1u8; 150_000]).unwrap();
        let mut track = Track::new(1).with_input(f.path());
        let factory = FileInputFactory::new(FileInputConfig::default());
        let mut stage = factory.open(&mut track).unwrap();
        assert_eq!(track.input_size, Some(150_000));

        let mut total = 0;
        let mut empty = 0;
        while let Some(n) = pull(stage.as_mut(), &mut track) {
            if n == 0 {
                empty += 1;
            }
            total += n;
        }
        assert_eq!(total, 150_000);
        assert_eq!(empty, 1);
        stage.close(&mut track);
    }

    #[test]
    fn input_seek_repositions_cursor() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 200) as u8).collect();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        let mut track = Track::new(1).with_input(f.path());
        let mut stage = FileInputFactory::new(FileInputConfig::default())
            .open(&mut track)
            .unwrap();
        track.input_seek = Some(70_000);
        assert_eq!(pull(stage.as_mut(), &mut track), Some(100_000 - 70_000));
        assert!(track.input_seek.is_none());

        // Seeking past the end finishes without an empty round.
        track.input_seek = Some(200_000);
        assert_eq!(pull(stage.as_mut(), &mut track), None);
    }

    #[test]
    fn open_without_input_is_config_error() {
        let mut track = Track::new(1);
        let err = FileInputFactory::new(FileInputConfig::default())
            .open(&mut track)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
