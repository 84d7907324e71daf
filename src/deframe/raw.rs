//! Raw deframing: every payload-carrying packet is one message

use super::{DeframeContext, DeframeOutput, Frame};
use crate::message::MessageKind;
use crate::stream::StreamView;

#[derive(Debug, Default)]
pub struct RawDeframer {
    /// Segments already emitted
    emitted: usize,
    cursor: usize,
}

impl RawDeframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn deframe(&mut self, view: StreamView<'_>, ctx: &mut DeframeContext<'_>) -> DeframeOutput {
        let mut out = DeframeOutput::default();

        for segment in view.segments.iter().skip(self.emitted) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            out.frames
                .extend(Frame::cut(view, segment.offset..segment.end(), MessageKind::Data));
            self.emitted += 1;
            self.cursor = segment.end();
        }

        out
    }
}
