#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use phone_agent_rs::llm::{
    create_default_registry, CompletionChunk, CompletionClient, CompletionStream, FinishReason,
    LlmError, Message,
};
use phone_agent_rs::protocol::OutboundMessage;
use phone_agent_rs::session::{Engines, SessionError};
use phone_agent_rs::stt::{SttError, SttResult, TranscriptionEngine};
use phone_agent_rs::tts::{SpeechEngine, TtsError};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

/// Transcription engine driven by the test through a channel
pub struct FakeTranscription {
    script: Mutex<Option<mpsc::UnboundedReceiver<SttResult>>>,
    pub audio_bytes: AtomicUsize,
    /// Set once the stream has returned
    pub stopped: AtomicBool,
}

impl FakeTranscription {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<SttResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            script: Mutex::new(Some(rx)),
            audio_bytes: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        (engine, tx)
    }
}

#[async_trait]
impl TranscriptionEngine for FakeTranscription {
    async fn stream(
        &self,
        mut audio: mpsc::UnboundedReceiver<Vec<u8>>,
        results: mpsc::UnboundedSender<SttResult>,
        cancel: CancellationToken,
    ) -> Result<(), SttError> {
        let script = self.script.lock().unwrap().take();
        let Some(mut script) = script else {
            return Ok(());
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                chunk = audio.recv() => match chunk {
                    Some(bytes) => {
                        self.audio_bytes.fetch_add(bytes.len(), Ordering::SeqCst);
                    }
                    None => break,
                },
                result = script.recv() => match result {
                    Some(result) => {
                        let _ = results.send(result);
                    }
                    None => break,
                },
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transcription engine that never notices cancellation
pub struct StalledTranscription;

#[async_trait]
impl TranscriptionEngine for StalledTranscription {
    async fn stream(
        &self,
        _audio: mpsc::UnboundedReceiver<Vec<u8>>,
        _results: mpsc::UnboundedSender<SttResult>,
        _cancel: CancellationToken,
    ) -> Result<(), SttError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Completion client that replays one script per request
pub struct FakeCompletion {
    scripts: Mutex<VecDeque<Vec<CompletionChunk>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl FakeCompletion {
    pub fn new(scripts: Vec<Vec<CompletionChunk>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for FakeCompletion {
    async fn stream_completion(
        &self,
        messages: &[Message],
        _tools: &[Value],
    ) -> Result<CompletionStream, LlmError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let chunks = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![CompletionChunk::finish(FinishReason::Stop)]);
        Ok(Box::pin(tokio_stream::iter(chunks.into_iter().map(Ok))))
    }
}

/// "Synthesizes" text as its own bytes; anything mentioning `slow` or
/// Ontario takes a while
pub struct FakeSpeech;

#[async_trait]
impl SpeechEngine for FakeSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        if text.contains("slow") {
            tokio::time::sleep(Duration::from_millis(400)).await;
        } else if text.contains("Ontario") {
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        Ok(text.as_bytes().to_vec())
    }
}

pub fn engines(
    transcription: Arc<FakeTranscription>,
    completion: Arc<FakeCompletion>,
) -> Engines {
    Engines {
        transcription,
        completion,
        speech: Arc::new(FakeSpeech),
        tools: Arc::new(create_default_registry()),
    }
}

pub fn start_event(stream_sid: &str, call_sid: &str) -> Value {
    json!({
        "event": "start",
        "sequenceNumber": "1",
        "start": {
            "streamSid": stream_sid,
            "callSid": call_sid,
            "tracks": ["inbound"],
            "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
        },
        "streamSid": stream_sid
    })
}

pub fn media_event(stream_sid: &str, audio: &[u8]) -> Value {
    json!({
        "event": "media",
        "sequenceNumber": "2",
        "media": {"track": "inbound", "chunk": "1", "timestamp": "5", "payload": STANDARD.encode(audio)},
        "streamSid": stream_sid
    })
}

pub fn mark_event(stream_sid: &str, name: &str) -> Value {
    json!({
        "event": "mark",
        "sequenceNumber": "3",
        "streamSid": stream_sid,
        "mark": {"name": name}
    })
}

pub fn stop_event(stream_sid: &str) -> Value {
    json!({
        "event": "stop",
        "sequenceNumber": "4",
        "streamSid": stream_sid,
        "stop": {"accountSid": "AC1", "callSid": "CA1"}
    })
}

pub fn final_transcript(text: &str) -> SttResult {
    SttResult::Final {
        text: text.to_string(),
        speech_final: true,
    }
}

pub fn interim(text: &str) -> SttResult {
    SttResult::Interim {
        text: text.to_string(),
    }
}

/// In-memory socket whose writes can be made to fail
pub struct BreakableIo {
    inner: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl BreakableIo {
    pub fn new(inner: DuplexStream) -> (Self, Arc<AtomicBool>) {
        let broken = Arc::new(AtomicBool::new(false));
        let io = Self {
            inner,
            broken: Arc::clone(&broken),
        };
        (io, broken)
    }

    fn check(&self) -> io::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket broken"))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for BreakableIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BreakableIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = self.check() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Provider side of a media stream
pub struct ProviderSocket<S> {
    pub ws: WebSocketStream<S>,
}

impl<S> ProviderSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn send(&mut self, event: Value) {
        self.ws
            .send(WsMessage::Text(event.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(WsMessage::Text(text.into())).await.unwrap();
    }

    /// Next frame from the agent, or None once the socket closes
    pub async fn next_frame(&mut self) -> Option<OutboundMessage> {
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    return Some(serde_json::from_str(text.as_str()).expect("agent sent invalid JSON"))
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next spoken fragment as (text, mark label)
    pub async fn next_spoken(&mut self) -> (String, String) {
        let text = match self.next_frame().await {
            Some(OutboundMessage::Media { media, .. }) => {
                String::from_utf8(STANDARD.decode(media.payload).unwrap()).unwrap()
            }
            other => panic!("expected media, got {:?}", other),
        };
        let label = match self.next_frame().await {
            Some(OutboundMessage::Mark { mark, .. }) => mark.name,
            other => panic!("expected mark, got {:?}", other),
        };
        (text, label)
    }

    /// Every frame until the agent closes the socket
    pub async fn remaining_frames(&mut self) -> Vec<OutboundMessage> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            frames.push(frame);
        }
        frames
    }
}

pub async fn join_session(handle: JoinHandle<Result<(), SessionError>>) {
    tokio::time::timeout(FRAME_TIMEOUT, handle)
        .await
        .expect("session did not end")
        .expect("session panicked")
        .expect("session failed");
}
