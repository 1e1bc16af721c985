//! In-chain filters that keep the sample format.

mod gain;
mod peaks;
mod until;

pub use gain::GainFactory;
pub use peaks::{ChannelPeaks, PeaksFactory, PeaksHandle};
pub use until::UntilFactory;

use crate::buffer::Chunk;
use crate::format::PcmFormat;
use crate::stage::{Flow, StageContext};

/// Format and whole-frame count of the pending input, if there is any.
pub(crate) fn frames_ready(cx: &mut StageContext<'_>, probed: &mut bool) -> Option<(PcmFormat, usize)> {
    let frames = cx.input.format().map(|f| (f, cx.input.chunk().frames(&f)));
    match frames {
        Some((fmt, n)) if n > 0 => {
            *probed = true;
            Some((fmt, n))
        }
        _ => None,
    }
}

/// Flow for a call with no whole frame to process.
///
/// The first such call forwards an empty chunk so downstream stages get to
/// post their format requests before upstream converters negotiate.
pub(crate) fn no_frames(cx: &mut StageContext<'_>, probed: &mut bool) -> Flow<'static> {
    if cx.input.is_last() {
        cx.input.consume(cx.input.remaining());
        return Flow::Done(Chunk::EMPTY);
    }
    if !*probed {
        *probed = true;
        return Flow::Data(Chunk::EMPTY);
    }
    Flow::NeedMore
}
