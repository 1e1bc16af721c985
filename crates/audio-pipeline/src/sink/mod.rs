//! Output stages.

mod device;
mod null;
mod output;
mod queue;
mod stdout;
mod wav;

pub use device::{DeviceInfo, list_devices};
pub use null::NullOutputFactory;
pub use output::DeviceOutputFactory;
pub use stdout::StdoutOutputFactory;
pub use wav::WavOutputFactory;
