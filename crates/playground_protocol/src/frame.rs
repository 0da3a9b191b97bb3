//! Frame classification.

use crate::HEARTBEAT;

/// One complete top-level JSON object taken off the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    /// The `{}` sentinel. Control only, never data.
    Heartbeat,
    /// Any other object, kept verbatim.
    Data(String),
}

impl StreamFrame {
    /// Classify a complete frame. Only the exact two-character `{}` is a
    /// heartbeat; `{ }` is data.
    pub fn classify(text: String) -> Self {
        if text == HEARTBEAT {
            StreamFrame::Heartbeat
        } else {
            StreamFrame::Data(text)
        }
    }

    /// Whether this frame is the heartbeat sentinel.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, StreamFrame::Heartbeat)
    }
}

impl From<String> for StreamFrame {
    fn from(text: String) -> Self {
        Self::classify(text)
    }
}
