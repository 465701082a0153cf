use crate::playback::{PendingMarks, PlaybackError};
use crate::protocol::OutboundMessage;
use tokio::sync::mpsc;

/// Default minimum utterance length, in characters, that counts as barge-in
pub const DEFAULT_INTERRUPT_MIN_CHARS: usize = 5;

/// Flushes queued caller-side audio when the caller talks over the agent.
///
/// Only the output path is affected; generation already in flight keeps
/// running and its later fragments are played as normal.
pub struct InterruptionMonitor {
    stream_sid: String,
    threshold: usize,
    pending: PendingMarks,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl InterruptionMonitor {
    pub fn new(
        stream_sid: impl Into<String>,
        threshold: usize,
        pending: PendingMarks,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            threshold,
            pending,
            outbound,
        }
    }

    /// Handle speech activity. Returns true if a clear was sent.
    pub fn on_activity(&self, text: &str) -> Result<bool, PlaybackError> {
        let length = text.trim().chars().count();
        if self.pending.is_empty() || length <= self.threshold {
            return Ok(false);
        }

        log::info!(
            "Interruption: caller spoke over {} pending mark(s), clearing: {}",
            self.pending.len(),
            text.trim()
        );
        self.outbound
            .send(OutboundMessage::clear(&self.stream_sid))
            .map_err(|_| PlaybackError::OutboundClosed)?;
        // Provider confirms the clear asynchronously; not awaited
        self.pending.clear();
        Ok(true)
    }
}
