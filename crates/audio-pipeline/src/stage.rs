//! The contract between stages and the scheduler.

use crate::buffer::{Chunk, Input};
use crate::error::PipelineError;
use crate::format::{FormatRequest, PcmFormat};
use crate::track::Track;

/// Result of one [`Stage::process`] call.
///
/// Output chunks borrow the stage and stay valid until it is called again.
#[derive(Debug)]
pub enum Flow<'a> {
    /// Consumed what it could; call upstream for more input.
    NeedMore,
    /// Produced output; hand it downstream.
    Data(Chunk<'a>),
    /// Final output (possibly empty). The stage is finished.
    Done(Chunk<'a>),
    /// Nothing to do for this track; bypass the stage from now on.
    DonePrevious,
    /// Final truncated output; stop reading input for the whole chain.
    LastOutput(Chunk<'a>),
    /// Waiting on something asynchronous; the track will be woken.
    Pending,
}

impl Flow<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NeedMore => "need-more",
            Self::Data(_) => "data",
            Self::Done(_) => "done",
            Self::DonePrevious => "done-previous",
            Self::LastOutput(_) => "last-output",
            Self::Pending => "pending",
        }
    }
}

/// Everything a stage may touch during one call.
pub struct StageContext<'a> {
    pub track: &'a mut Track,
    pub input: Input<'a>,
    index: usize,
    output_format: Option<PcmFormat>,
}

impl<'a> StageContext<'a> {
    pub fn new(track: &'a mut Track, input: Input<'a>, index: usize) -> Self {
        Self {
            track,
            input,
            index,
            output_format: None,
        }
    }

    /// Position of the stage in the chain.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Declare the format of the data this stage emits.
    ///
    /// Stages that leave the format untouched need not call this.
    pub fn set_output_format(&mut self, fmt: PcmFormat) {
        self.output_format = Some(fmt);
    }

    pub fn output_format(&self) -> Option<PcmFormat> {
        self.output_format
    }

    /// Ask upstream converters for a different input format.
    pub fn request_format(&mut self, req: FormatRequest) {
        self.track.post_request(self.index, req);
    }

    /// Take one field of the nearest downstream request.
    pub fn take_request<T>(
        &mut self,
        field: impl Fn(&mut FormatRequest) -> &mut Option<T>,
    ) -> Option<T> {
        self.track.take_request(self.index, field)
    }
}

/// One unit of the pipeline.
pub trait Stage {
    fn process<'s>(&'s mut self, cx: &mut StageContext<'_>) -> Result<Flow<'s>, PipelineError>;

    /// Release resources. Called exactly once after a successful open.
    fn close(&mut self, _track: &mut Track) {}
}

/// Creates stage instances for a track.
pub trait StageFactory: Send + Sync {
    /// Dotted name, e.g. `decode.wav`.
    fn name(&self) -> &'static str;

    fn open(&self, track: &mut Track) -> Result<Box<dyn Stage>, PipelineError>;
}
