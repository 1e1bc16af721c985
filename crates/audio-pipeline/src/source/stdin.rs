//! `in.stdin`: feeds bytes read from standard input into the chain.
//!
//! Reads block the scheduler thread. Only forward input seeks are possible;
//! they are served by reading and discarding.

use std::io::{self, Read};

use crate::buffer::Chunk;
use crate::error::PipelineError;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::Track;

const NAME: &str = "in.stdin";

pub struct StdinInputFactory {
    buffer_size: usize,
}

impl StdinInputFactory {
    pub fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl StageFactory for StdinInputFactory {
    fn name(&self) -> &'static str {
        NAME
    }

    fn open(&self, track: &mut Track) -> Result<Box<dyn Stage>, PipelineError> {
        track.input_size = None;
        Ok(Box::new(ReaderInput::new(io::stdin(), self.buffer_size)))
    }
}

pub(crate) struct ReaderInput<R> {
    reader: R,
    buf: Vec<u8>,
    cursor: u64,
    eof: bool,
    /// The last input seek has not produced data yet.
    seek_req: bool,
}

impl<R: Read> ReaderInput<R> {
    pub(crate) fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buf: vec![0; buffer_size.max(1)],
            cursor: 0,
            eof: false,
            seek_req: false,
        }
    }

    fn skip_to(&mut self, offset: u64) -> Result<(), PipelineError> {
        if offset < self.cursor {
            return Err(PipelineError::unsupported(
                NAME,
                format!("backward seek from {} to {offset}", self.cursor),
            ));
        }
        let want = offset - self.cursor;
        let skipped = io::copy(&mut (&mut self.reader).take(want), &mut io::sink())
            .map_err(|e| PipelineError::io("skip stdin", e))?;
        self.cursor += skipped;
        if skipped < want {
            self.eof = true;
        }
        Ok(())
    }

    fn read_some(&mut self) -> Result<usize, PipelineError> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PipelineError::io("read stdin", e)),
            }
        }
    }
}

impl<R: Read> Stage for ReaderInput<R> {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError> {
        if cx.track.stop_requested() {
            return Ok(Flow::Done(Chunk::EMPTY));
        }

        if let Some(off) = cx.track.input_seek.take() {
            tracing::debug!(offset = off, "input seek");
            self.skip_to(off)?;
            self.seek_req = true;
        }
        if self.eof {
            return Ok(Flow::Done(Chunk::EMPTY));
        }

        let n = self.read_some()?;
        if n == 0 {
            self.eof = true;
            if self.seek_req {
                return Ok(Flow::Done(Chunk::EMPTY));
            }
            // Same end-of-input shape as `in.file`: one empty chunk, then Done.
            return Ok(Flow::Data(Chunk::EMPTY));
        }
        self.cursor += n as u64;
        self.seek_req = false;
        Ok(Flow::Data(Chunk::Interleaved(&self.buf[..n])))
    }

    fn close(&mut self, _track: &mut Track) {
        tracing::debug!(bytes = self.cursor, "stdin closed");
    }
}
