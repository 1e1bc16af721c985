//! Pull/push audio processing pipeline.
//!
//! A [`Track`] drives a linear chain of [`Stage`]s through a [`Scheduler`]:
//! source, decoder, converters, filters and a sink. Stages hand each other
//! borrowed [`Chunk`]s and steer the scheduler with [`Flow`] results.

pub mod buffer;
pub mod config;
pub mod convert;
pub mod decode;
pub mod error;
pub mod filter;
pub mod format;
pub mod pcm;
pub mod registry;
pub mod resample;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stage;
pub mod track;

pub use buffer::{Chunk, Input, Planes};
pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError};
pub use format::{FormatRequest, Layout, PcmFormat, SampleFormat};
pub use registry::{Category, Registry, STDIO_PATH, input_stages};
pub use scheduler::{Progress, Scheduler};
pub use stage::{Flow, Stage, StageContext, StageFactory};
pub use track::{MetaSink, Position, StopHandle, Track, TrackEvent, TrackWaker};
