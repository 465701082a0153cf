use crate::llm::prompts::SPLIT_MARKER;
use crate::llm::segmenter::ReplyFragment;
use crate::tts::SpeechEngine;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Synthesized audio for one reply fragment
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFragment {
    pub interaction: u32,
    pub index: Option<u32>,
    /// base64-encoded audio, ready for a media frame
    pub payload: String,
    /// The spoken text, for logs
    pub label: String,
}

/// What the synthesizer hands to playback
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackInput {
    Audio(AudioFragment),
    /// Synthesis of an indexed fragment failed; playback must not wait for it
    Dropped { interaction: u32, index: u32 },
}

/// Turns reply fragments into audio fragments.
///
/// Every fragment is synthesized on its own task as soon as it arrives, so
/// results come back in completion order, not index order.
pub struct SpeechSynthesizer {
    engine: Arc<dyn SpeechEngine>,
    output: mpsc::UnboundedSender<PlaybackInput>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl SpeechSynthesizer {
    pub fn new(
        engine: Arc<dyn SpeechEngine>,
        output: mpsc::UnboundedSender<PlaybackInput>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            output,
            cancel,
            tasks: JoinSet::new(),
        }
    }

    /// Start synthesizing a fragment without waiting for earlier ones
    pub fn enqueue(&mut self, fragment: ReplyFragment) {
        let engine = Arc::clone(&self.engine);
        let output = self.output.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let spoken = fragment.text.replace(SPLIT_MARKER, "");

            let result = if spoken.trim().is_empty() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    result = engine.synthesize(spoken.trim()) => Some(result),
                }
            };

            let input = match result {
                Some(Ok(audio)) => {
                    log::info!(
                        "Interaction {}: TTS -> playback [{:?}]: {}",
                        fragment.interaction,
                        fragment.index,
                        spoken.trim()
                    );
                    PlaybackInput::Audio(AudioFragment {
                        interaction: fragment.interaction,
                        index: fragment.index,
                        payload: STANDARD.encode(audio),
                        label: fragment.text,
                    })
                }
                failed => {
                    if let Some(Err(e)) = failed {
                        log::error!(
                            "Interaction {}: TTS failed for fragment {:?}, dropping: {}",
                            fragment.interaction,
                            fragment.index,
                            e
                        );
                    }
                    match fragment.index {
                        Some(index) => PlaybackInput::Dropped {
                            interaction: fragment.interaction,
                            index,
                        },
                        None => return,
                    }
                }
            };

            if output.send(input).is_err() {
                log::debug!("TTS: playback closed, discarding fragment");
            }
        });
    }

    /// Number of syntheses still in flight
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Synthesize fragments until the call ends or the fragment channel closes
    pub async fn run(mut self, mut fragments: mpsc::UnboundedReceiver<ReplyFragment>) {
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                fragment = fragments.recv() => match fragment {
                    Some(fragment) => self.enqueue(fragment),
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            log::error!("TTS: synthesis task panicked: {}", e);
                        }
                    }
                }
            }
        }

        // Let in-flight syntheses land unless the call is over
        while !cancel.is_cancelled() && self.tasks.join_next().await.is_some() {}
        self.tasks.shutdown().await;
        log::debug!("TTS: synthesizer stopped");
    }
}
