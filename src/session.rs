//! One phone call, from the media stream's `start` to its `stop`.
//!
//! The session reads provider frames in order and owns the per-call pipeline:
//! transcription relay, completion segmenter, speech synthesizer and playback
//! sequencer, each on its own task and joined by channels. Everything the
//! pipeline writes to the caller goes through a single outbound writer task.

use crate::interruption::{InterruptionMonitor, DEFAULT_INTERRUPT_MIN_CHARS};
use crate::llm::client::CompletionClient;
use crate::llm::context::Transcript;
use crate::llm::prompts::{ConversationTemplates, SystemPrompts, SPLIT_MARKER};
use crate::llm::segmenter::{CompletionSegmenter, ReplyFragment, SegmenterConfig, TurnRequest};
use crate::llm::tools::ToolRegistry;
use crate::playback::{PendingMarks, PlaybackError, PlaybackSequencer};
use crate::protocol::{InboundEvent, OutboundMessage, ProtocolError, StartMetadata};
use crate::stt::{TranscriptionEngine, TranscriptionEvent, TranscriptionRelay};
use crate::synthesizer::SpeechSynthesizer;
use crate::tts::SpeechEngine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Interaction number of the scripted greeting; never used by a caller turn
pub const GREETING_INTERACTION: u32 = u32::MAX;

const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Outbound channel failed: {0}")]
    Outbound(String),
}

impl From<PlaybackError> for SessionError {
    fn from(e: PlaybackError) -> Self {
        SessionError::Outbound(e.to_string())
    }
}

/// External engines shared by every call
#[derive(Clone)]
pub struct Engines {
    pub transcription: Arc<dyn TranscriptionEngine>,
    pub completion: Arc<dyn CompletionClient>,
    pub speech: Arc<dyn SpeechEngine>,
    pub tools: Arc<ToolRegistry>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed system turns at the head of every transcript
    pub instructions: Vec<String>,
    /// First thing the agent says, before the caller speaks
    pub greeting: String,
    pub interrupt_min_chars: usize,
    pub max_tool_chain: usize,
    pub split_marker: char,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: vec![
                SystemPrompts::call_agent().to_string(),
                SystemPrompts::speech_segmentation(),
            ],
            greeting: ConversationTemplates::greeting().to_string(),
            interrupt_min_chars: DEFAULT_INTERRUPT_MIN_CHARS,
            max_tool_chain: SegmenterConfig::default().max_tool_chain,
            split_marker: SPLIT_MARKER,
        }
    }
}

/// Components of a call that has started
struct Pipeline {
    stream_sid: String,
    audio: mpsc::UnboundedSender<Vec<u8>>,
    turns: mpsc::UnboundedSender<TurnRequest>,
    transcription: mpsc::UnboundedReceiver<TranscriptionEvent>,
    monitor: InterruptionMonitor,
    pending: PendingMarks,
    interaction: u32,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    async fn shutdown(mut self) {
        self.cancel.cancel();
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                log::warn!("Session {}: task did not stop, aborting", self.stream_sid);
                task.abort();
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Session {
    engines: Engines,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(engines: Engines, config: SessionConfig, cancel: CancellationToken) -> Self {
        Self {
            engines,
            config,
            cancel,
        }
    }

    /// Serve one media stream until the provider stops it, the socket closes
    /// or the server shuts down.
    pub async fn run<S>(self, ws: WebSocketStream<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut writer = tokio::spawn(write_outbound(sink, outbound_rx, self.cancel.clone()));
        let mut writer_done = false;
        let mut pipeline: Option<Pipeline> = None;

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                written = &mut writer => {
                    writer_done = true;
                    break match written {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(SessionError::Outbound(e.to_string())),
                    };
                }
                Some(event) = next_transcription(&mut pipeline) => {
                    if let Some(p) = pipeline.as_mut() {
                        if let Err(e) = on_transcription(p, event) {
                            break Err(e);
                        }
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match InboundEvent::parse(text.as_str()) {
                        Ok(event) => {
                            if let Flow::Stop = self.on_event(event, &mut pipeline, &outbound_tx) {
                                break Ok(());
                            }
                        }
                        Err(e) => log::warn!("Session: ignoring malformed frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Session: provider closed the socket: {:?}", frame);
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
            }
        };

        // Stops the writer and every pipeline task before waiting on any of them
        self.cancel.cancel();
        if let Some(p) = pipeline.take() {
            log::info!("Session {}: tearing down", p.stream_sid);
            p.shutdown().await;
        }
        if !writer_done {
            match writer.await {
                Ok(Err(e)) => log::debug!("Session: writer ended with: {}", e),
                Err(e) => log::debug!("Session: writer task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        result
    }

    fn on_event(
        &self,
        event: InboundEvent,
        pipeline: &mut Option<Pipeline>,
        outbound: &mpsc::UnboundedSender<OutboundMessage>,
    ) -> Flow {
        match event {
            InboundEvent::Connected { protocol } => {
                log::info!("Session: media stream connected ({:?})", protocol);
            }
            InboundEvent::Start { start, .. } => {
                if pipeline.is_some() {
                    log::warn!("Session: duplicate start for {}, ignoring", start.stream_sid);
                } else {
                    *pipeline = Some(self.start_pipeline(start, outbound.clone()));
                }
            }
            InboundEvent::Media { media, .. } => match (pipeline.as_ref(), media.decode()) {
                (Some(p), Ok(bytes)) => {
                    if p.audio.send(bytes).is_err() {
                        log::debug!("Session {}: transcription closed, dropping audio", p.stream_sid);
                    }
                }
                (Some(_), Err(e)) => log::warn!("Session: undecodable media payload: {}", e),
                (None, _) => log::debug!("Session: media before start, dropping"),
            },
            InboundEvent::Mark {
                sequence_number,
                mark,
            } => {
                if let Some(p) = pipeline.as_ref() {
                    let was_pending = p.pending.remove(&mark.name);
                    log::info!(
                        "Session {}: mark {} played (seq {}, pending: {})",
                        p.stream_sid,
                        mark.name,
                        sequence_number.as_deref().unwrap_or("-"),
                        was_pending
                    );
                }
            }
            InboundEvent::Stop { .. } => {
                log::info!("Session: media stream stopped");
                return Flow::Stop;
            }
            InboundEvent::Unknown => {
                log::warn!("Session: ignoring unrecognized event");
            }
        }
        Flow::Continue
    }

    fn start_pipeline(
        &self,
        start: StartMetadata,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Pipeline {
        let StartMetadata {
            stream_sid,
            call_sid,
        } = start;
        log::info!("Session: starting media stream {} for call {}", stream_sid, call_sid);

        let cancel = self.cancel.child_token();
        let pending = PendingMarks::new();

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (turns_tx, turns_rx) = mpsc::unbounded_channel();
        let (fragments_tx, fragments_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let relay = TranscriptionRelay::spawn(
            Arc::clone(&self.engines.transcription),
            audio_rx,
            events_tx,
            cancel.clone(),
        );

        let instructions: Vec<&str> = self.config.instructions.iter().map(String::as_str).collect();
        let transcript = Transcript::with_instructions(&instructions, &self.config.greeting);
        let mut segmenter = CompletionSegmenter::new(
            Arc::clone(&self.engines.completion),
            Arc::clone(&self.engines.tools),
            transcript,
            SegmenterConfig {
                split_marker: self.config.split_marker,
                max_tool_chain: self.config.max_tool_chain,
            },
            fragments_tx.clone(),
        );
        segmenter.add_call_metadata(&call_sid);

        let synthesizer =
            SpeechSynthesizer::new(Arc::clone(&self.engines.speech), playback_tx, cancel.clone());
        let sequencer =
            PlaybackSequencer::new(stream_sid.clone(), outbound.clone(), pending.clone(), cancel.clone());
        let monitor = InterruptionMonitor::new(
            stream_sid.clone(),
            self.config.interrupt_min_chars,
            pending.clone(),
            outbound,
        );

        let tasks = vec![
            relay,
            tokio::spawn(segmenter.run(turns_rx, cancel.clone())),
            tokio::spawn(synthesizer.run(fragments_rx)),
            tokio::spawn(sequencer.run(playback_rx)),
        ];

        let greeting = ReplyFragment {
            interaction: GREETING_INTERACTION,
            index: None,
            text: self.config.greeting.clone(),
        };
        if fragments_tx.send(greeting).is_err() {
            log::warn!("Session {}: synthesizer gone before greeting", stream_sid);
        }

        Pipeline {
            stream_sid,
            audio: audio_tx,
            turns: turns_tx,
            transcription: events_rx,
            monitor,
            pending,
            interaction: 0,
            cancel,
            tasks,
        }
    }
}

fn on_transcription(p: &mut Pipeline, event: TranscriptionEvent) -> Result<(), SessionError> {
    match event {
        TranscriptionEvent::Activity { text } => {
            p.monitor.on_activity(&text)?;
        }
        TranscriptionEvent::Transcript { text } => {
            log::info!("Interaction {}: STT -> LLM: {}", p.interaction, text);
            if p.turns.send(TurnRequest::user(text, p.interaction)).is_err() {
                log::warn!("Session {}: segmenter stopped, turn dropped", p.stream_sid);
            }
            p.interaction += 1;
        }
    }
    Ok(())
}

async fn next_transcription(pipeline: &mut Option<Pipeline>) -> Option<TranscriptionEvent> {
    match pipeline {
        Some(p) => p.transcription.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_outbound<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let json = message.to_json()?;
        sink.send(Message::Text(json.into())).await?;
    }

    let _ = sink.close().await;
    Ok(())
}
