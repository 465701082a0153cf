use crate::protocol::OutboundMessage;
use crate::synthesizer::{AudioFragment, PlaybackInput};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Outbound channel closed")]
    OutboundClosed,
}

/// Marks sent to the caller but not yet confirmed played.
///
/// Shared by the sequencer (inserts), the session (removes on confirmation)
/// and the interruption monitor (clears on barge-in).
#[derive(Debug, Clone, Default)]
pub struct PendingMarks {
    inner: Arc<Mutex<Vec<String>>>,
}

impl PendingMarks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // A poisoned set is still a valid list of labels
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, label: String) {
        self.lock().push(label);
    }

    /// Returns true if the label was pending
    pub fn remove(&self, label: &str) -> bool {
        let mut marks = self.lock();
        match marks.iter().position(|m| m == label) {
            Some(pos) => {
                marks.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn labels(&self) -> Vec<String> {
        self.lock().clone()
    }
}

/// How many of the most recent interactions keep ordering state. The one
/// before the newest may still be finishing its tail when the next starts.
pub const RETAINED_INTERACTIONS: u32 = 4;

#[derive(Debug)]
enum Slot {
    Audio(AudioFragment),
    Dropped,
}

/// Puts synthesized audio back into reply order before it reaches the caller.
pub struct PlaybackSequencer {
    stream_sid: String,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    pending: PendingMarks,
    cancel: CancellationToken,
    expected: HashMap<u32, u32>,
    buffered: HashMap<u32, BTreeMap<u32, Slot>>,
    retired_below: u32,
}

impl PlaybackSequencer {
    pub fn new(
        stream_sid: impl Into<String>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        pending: PendingMarks,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            outbound,
            pending,
            cancel,
            expected: HashMap::new(),
            buffered: HashMap::new(),
            retired_below: 0,
        }
    }

    /// Accept one synthesizer result and deliver whatever is now in order.
    /// Returns the number of fragments sent to the caller.
    pub fn submit(&mut self, input: PlaybackInput) -> Result<usize, PlaybackError> {
        match input {
            PlaybackInput::Audio(fragment) => match fragment.index {
                None => {
                    self.deliver(fragment)?;
                    Ok(1)
                }
                Some(index) => {
                    let interaction = fragment.interaction;
                    if self.accept(interaction, index, Slot::Audio(fragment)) {
                        self.drain(interaction)
                    } else {
                        Ok(0)
                    }
                }
            },
            PlaybackInput::Dropped { interaction, index } => {
                log::warn!(
                    "Playback: interaction {} skipping lost fragment {}",
                    interaction,
                    index
                );
                if self.accept(interaction, index, Slot::Dropped) {
                    self.drain(interaction)
                } else {
                    Ok(0)
                }
            }
        }
    }

    /// Next index this interaction is waiting for
    pub fn expected(&self, interaction: u32) -> u32 {
        self.expected.get(&interaction).copied().unwrap_or(0)
    }

    /// Number of fragments held back waiting for an earlier index
    pub fn buffered(&self, interaction: u32) -> usize {
        self.buffered.get(&interaction).map_or(0, BTreeMap::len)
    }

    /// Interactions that still hold ordering state
    pub fn tracked_interactions(&self) -> usize {
        self.expected
            .keys()
            .chain(self.buffered.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    fn retire_before(&mut self, interaction: u32) {
        let floor = interaction.saturating_sub(RETAINED_INTERACTIONS - 1);
        if floor <= self.retired_below {
            return;
        }
        self.retired_below = floor;
        self.expected.retain(|&i, _| i >= floor);
        self.buffered.retain(|&i, _| i >= floor);
    }

    fn accept(&mut self, interaction: u32, index: u32, slot: Slot) -> bool {
        if interaction < self.retired_below {
            log::warn!(
                "Playback: interaction {} is retired, ignoring fragment {}",
                interaction,
                index
            );
            return false;
        }
        self.retire_before(interaction);

        let expected = self.expected(interaction);
        if index < expected {
            log::warn!(
                "Playback: interaction {} fragment {} already played, ignoring",
                interaction,
                index
            );
            return false;
        }

        let buffer = self.buffered.entry(interaction).or_default();
        if buffer.contains_key(&index) {
            log::warn!(
                "Playback: interaction {} fragment {} already buffered, ignoring",
                interaction,
                index
            );
            return false;
        }

        buffer.insert(index, slot);
        true
    }

    fn drain(&mut self, interaction: u32) -> Result<usize, PlaybackError> {
        let mut delivered = 0;
        let mut next = self.expected(interaction);

        while let Some(slot) = self
            .buffered
            .get_mut(&interaction)
            .and_then(|buffer| buffer.remove(&next))
        {
            next += 1;
            self.expected.insert(interaction, next);
            if let Slot::Audio(fragment) = slot {
                self.deliver(fragment)?;
                delivered += 1;
            }
        }

        if self
            .buffered
            .get(&interaction)
            .is_some_and(BTreeMap::is_empty)
        {
            self.buffered.remove(&interaction);
        }

        Ok(delivered)
    }

    fn deliver(&mut self, fragment: AudioFragment) -> Result<(), PlaybackError> {
        if self.cancel.is_cancelled() {
            log::debug!("Playback: call ended, not sending '{}'", fragment.label);
            return Ok(());
        }

        let mark = Uuid::new_v4().to_string();
        // Pending before sent, so a fast confirmation always finds it
        self.pending.insert(mark.clone());

        self.outbound
            .send(OutboundMessage::media(&self.stream_sid, fragment.payload))
            .map_err(|_| PlaybackError::OutboundClosed)?;
        self.outbound
            .send(OutboundMessage::mark(&self.stream_sid, &mark))
            .map_err(|_| PlaybackError::OutboundClosed)?;

        log::info!(
            "Interaction {}: playback [{:?}] mark {}: {}",
            fragment.interaction,
            fragment.index,
            mark,
            fragment.label
        );
        Ok(())
    }

    /// Sequence synthesizer output until the call ends.
    /// An outbound failure cancels the whole call.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<PlaybackInput>) {
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                input = inputs.recv() => {
                    let Some(input) = input else { break };
                    if let Err(e) = self.submit(input) {
                        log::error!("Playback: {}, ending call", e);
                        cancel.cancel();
                        break;
                    }
                }
            }
        }

        log::debug!("Playback: sequencer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(interaction: u32, index: Option<u32>, text: &str) -> PlaybackInput {
        PlaybackInput::Audio(AudioFragment {
            interaction,
            index,
            payload: format!("audio:{}", text),
            label: text.to_string(),
        })
    }

    fn sequencer() -> (
        PlaybackSequencer,
        mpsc::UnboundedReceiver<OutboundMessage>,
        PendingMarks,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = PendingMarks::new();
        let seq = PlaybackSequencer::new("MZ1", tx, pending.clone(), CancellationToken::new());
        (seq, rx, pending)
    }

    /// Payloads of media frames sent so far, checking each is followed by its mark
    fn played(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<String> {
        let mut payloads = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                OutboundMessage::Media { stream_sid, media } => {
                    assert_eq!(stream_sid, "MZ1");
                    payloads.push(media.payload);
                    match rx.try_recv() {
                        Ok(OutboundMessage::Mark { mark, .. }) => {
                            assert!(Uuid::parse_str(&mark.name).is_ok())
                        }
                        other => panic!("expected mark after media, got {:?}", other),
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        payloads
    }

    #[test]
    fn test_out_of_order_fragments_play_in_index_order() {
        let (mut seq, mut rx, pending) = sequencer();

        assert_eq!(seq.submit(audio(0, Some(2), "c")).unwrap(), 0);
        assert_eq!(seq.submit(audio(0, Some(1), "b")).unwrap(), 0);
        assert_eq!(seq.buffered(0), 2);
        assert!(played(&mut rx).is_empty());

        assert_eq!(seq.submit(audio(0, Some(0), "a")).unwrap(), 3);
        assert_eq!(played(&mut rx), vec!["audio:a", "audio:b", "audio:c"]);
        assert_eq!(seq.expected(0), 3);
        assert_eq!(seq.buffered(0), 0);
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn test_interactions_are_sequenced_independently() {
        let (mut seq, mut rx, _) = sequencer();

        seq.submit(audio(1, Some(1), "1b")).unwrap();
        seq.submit(audio(2, Some(0), "2a")).unwrap();
        seq.submit(audio(1, Some(0), "1a")).unwrap();

        assert_eq!(played(&mut rx), vec!["audio:2a", "audio:1a", "audio:1b"]);
    }

    #[test]
    fn test_unindexed_fragment_bypasses_ordering() {
        let (mut seq, mut rx, _) = sequencer();

        seq.submit(audio(0, Some(1), "later")).unwrap();
        assert_eq!(seq.submit(audio(0, None, "ack")).unwrap(), 1);
        assert_eq!(played(&mut rx), vec!["audio:ack"]);

        // The sentinel neither consumed nor advanced the expected index
        assert_eq!(seq.expected(0), 0);
        seq.submit(audio(0, Some(0), "first")).unwrap();
        assert_eq!(played(&mut rx), vec!["audio:first", "audio:later"]);
    }

    #[test]
    fn test_duplicates_are_never_played_twice() {
        let (mut seq, mut rx, _) = sequencer();

        seq.submit(audio(0, Some(1), "b")).unwrap();
        seq.submit(audio(0, Some(1), "b-again")).unwrap();
        seq.submit(audio(0, Some(0), "a")).unwrap();
        seq.submit(audio(0, Some(0), "a-again")).unwrap();

        assert_eq!(played(&mut rx), vec!["audio:a", "audio:b"]);
    }

    #[test]
    fn test_dropped_fragment_does_not_stall_later_ones() {
        let (mut seq, mut rx, _) = sequencer();

        seq.submit(audio(0, Some(2), "c")).unwrap();
        seq.submit(audio(0, Some(0), "a")).unwrap();
        assert_eq!(played(&mut rx), vec!["audio:a"]);

        seq.submit(PlaybackInput::Dropped {
            interaction: 0,
            index: 1,
        })
        .unwrap();
        assert_eq!(played(&mut rx), vec!["audio:c"]);
        assert_eq!(seq.expected(0), 3);
    }

    #[test]
    fn test_old_interactions_are_retired() {
        let (mut seq, mut rx, _) = sequencer();

        // Every interaction leaves a tail waiting on a lost first fragment
        for interaction in 0..10 {
            seq.submit(audio(interaction, Some(1), "tail")).unwrap();
        }
        assert_eq!(seq.tracked_interactions(), RETAINED_INTERACTIONS as usize);
        assert_eq!(seq.buffered(0), 0);
        assert!(played(&mut rx).is_empty());

        seq.submit(audio(0, Some(0), "late")).unwrap();
        assert!(played(&mut rx).is_empty());

        // The previous interaction still finishes after the next one starts
        seq.submit(audio(10, Some(0), "10a")).unwrap();
        seq.submit(audio(9, Some(0), "9a")).unwrap();
        assert_eq!(
            played(&mut rx),
            vec!["audio:10a", "audio:9a", "audio:tail"]
        );
        assert!(seq.tracked_interactions() <= RETAINED_INTERACTIONS as usize);
    }

    #[test]
    fn test_nothing_sent_after_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingMarks::new();
        let cancel = CancellationToken::new();
        let mut seq = PlaybackSequencer::new("MZ1", tx, pending.clone(), cancel.clone());

        cancel.cancel();
        seq.submit(audio(0, Some(0), "a")).unwrap();
        seq.submit(audio(0, None, "ack")).unwrap();

        assert!(rx.try_recv().is_err());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_closed_outbound_is_an_error() {
        let (mut seq, rx, _) = sequencer();
        drop(rx);
        assert!(matches!(
            seq.submit(audio(0, Some(0), "a")),
            Err(PlaybackError::OutboundClosed)
        ));
    }

    #[test]
    fn test_pending_marks() {
        let pending = PendingMarks::new();
        let shared = pending.clone();

        pending.insert("m1".to_string());
        pending.insert("m2".to_string());
        assert_eq!(shared.len(), 2);

        assert!(shared.remove("m1"));
        assert!(!shared.remove("m1"));
        assert_eq!(pending.labels(), vec!["m2".to_string()]);

        shared.clear();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_run_sequences_channel_input() {
        let (seq, mut rx, pending) = sequencer();
        let (tx, inputs) = mpsc::unbounded_channel();

        tx.send(audio(3, Some(1), "second")).unwrap();
        tx.send(audio(3, Some(0), "first")).unwrap();
        drop(tx);
        seq.run(inputs).await;

        assert_eq!(played(&mut rx), vec!["audio:first", "audio:second"]);
        assert_eq!(pending.len(), 2);
    }
}
