//! File and standard-input sources.

mod cache;
mod file;
mod io;
mod stdin;

pub use cache::{AsyncFileSource, Fetch, ReadMode, SourceStats};
pub use file::FileInputFactory;
pub use stdin::StdinInputFactory;
