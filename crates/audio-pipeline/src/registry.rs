//! Named stage factories.
//!
//! Stages are addressed as `category.name`, e.g. `decode.wav`. A registry is
//! an ordinary value; callers build one and look stages up when composing a
//! chain.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::convert::ConvertFactory;
use crate::decode::{SymphoniaDecodeFactory, WavDecodeFactory};
use crate::error::PipelineError;
use crate::filter::{GainFactory, PeaksFactory, UntilFactory};
use crate::resample::ResampleFactory;
use crate::sink::{DeviceOutputFactory, NullOutputFactory, StdoutOutputFactory, WavOutputFactory};
use crate::source::{FileInputFactory, StdinInputFactory};
use crate::stage::StageFactory;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    In,
    Decode,
    Convert,
    Filter,
    Encode,
    Out,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Decode => "decode",
            Self::Convert => "convert",
            Self::Filter => "filter",
            Self::Encode => "encode",
            Self::Out => "out",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "in" => Self::In,
            "decode" => Self::Decode,
            "convert" => Self::Convert,
            "filter" => Self::Filter,
            "encode" => Self::Encode,
            "out" => Self::Out,
            other => return Err(PipelineError::Config(format!("unknown stage category {other:?}"))),
        })
    }
}

fn split_name(dotted: &str) -> Result<(Category, &str), PipelineError> {
    let (category, name) = dotted
        .split_once('.')
        .ok_or_else(|| PipelineError::Config(format!("stage name {dotted:?} has no category")))?;
    Ok((category.parse()?, name))
}

#[derive(Default)]
pub struct Registry {
    stages: BTreeMap<(Category, String), Arc<dyn StageFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in stage, configured from `cfg`.
    pub fn with_builtins(cfg: &PipelineConfig) -> Self {
        let builtins: Vec<Arc<dyn StageFactory>> = vec![
            Arc::new(FileInputFactory::new(cfg.input.clone())),
            Arc::new(StdinInputFactory::new(cfg.input.buffer_size)),
            Arc::new(WavDecodeFactory),
            Arc::new(SymphoniaDecodeFactory),
            Arc::new(ConvertFactory::new(cfg.convert.clone())),
            Arc::new(ResampleFactory::new(cfg.resample)),
            Arc::new(GainFactory::new(cfg.filters.gain_db)),
            Arc::new(UntilFactory::new(cfg.filters.until.unwrap_or(Duration::MAX))),
            Arc::new(PeaksFactory::new()),
            Arc::new(NullOutputFactory),
            Arc::new(WavOutputFactory::new(cfg.encode.clone())),
            Arc::new(StdoutOutputFactory::new(cfg.encode.clone())),
            Arc::new(DeviceOutputFactory::new(cfg.output.clone())),
        ];
        let mut reg = Self::new();
        for factory in builtins {
            // Built-in names always carry a known category.
            if let Err(e) = reg.register(factory) {
                tracing::error!("builtin stage: {e}");
            }
        }
        reg
    }

    /// Add `factory` under its dotted name, replacing any earlier entry.
    pub fn register(&mut self, factory: Arc<dyn StageFactory>) -> Result<(), PipelineError> {
        let (category, name) = split_name(factory.name())?;
        let key = (category, name.to_string());
        if self.stages.insert(key, factory).is_some() {
            tracing::debug!(%category, name, "stage replaced");
        }
        Ok(())
    }

    pub fn lookup(&self, category: Category, name: &str) -> Result<Arc<dyn StageFactory>, PipelineError> {
        self.stages
            .get(&(category, name.to_string()))
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStage {
                category: category.to_string(),
                name: name.to_string(),
            })
    }

    /// Look a stage up by its dotted name.
    pub fn find(&self, dotted: &str) -> Result<Arc<dyn StageFactory>, PipelineError> {
        let (category, name) = split_name(dotted)?;
        self.lookup(category, name)
    }

    /// Resolve a list of dotted names into a chain.
    pub fn chain<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn StageFactory>>, PipelineError> {
        names.iter().map(|n| self.find(n.as_ref())).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.stages
            .keys()
            .map(|(c, n)| format!("{c}.{n}"))
            .collect()
    }
}

/// Path that names standard input or output.
pub const STDIO_PATH: &str = "-";

/// Source and decoder stages for `path`, picked by extension.
///
/// [`STDIO_PATH`] reads a WAV stream from standard input.
pub fn input_stages(path: &Path) -> &'static [&'static str] {
    if path == Path::new(STDIO_PATH) {
        return &["in.stdin", "decode.wav"];
    }
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"));
    if is_wav {
        &["in.file", "decode.wav"]
    } else {
        &["decode.symphonia"]
    }
}
