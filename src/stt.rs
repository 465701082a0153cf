use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Error, Debug)]
pub enum SttError {
    #[error("WebSocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Invalid auth header: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error("Response parsing error: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub model: String,
    pub base_url: String,
    pub encoding: String,
    pub sample_rate: u32,
    /// Silence (ms) after which the engine marks speech final
    pub endpointing_ms: u32,
    /// Gap (ms) after which the engine reports the utterance over
    pub utterance_end_ms: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            base_url: "wss://api.deepgram.com/v1/listen".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            endpointing_ms: 200,
            utterance_end_ms: 1000,
        }
    }
}

/// One result from the transcription engine
#[derive(Debug, Clone, PartialEq)]
pub enum SttResult {
    Interim { text: String },
    Final { text: String, speech_final: bool },
    UtteranceEnd,
}

/// What the relay publishes to the session
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    /// Caller is speaking; carries the in-progress text
    Activity { text: String },
    /// One finished caller utterance
    Transcript { text: String },
}

/// Transcription boundary: raw caller audio in, engine results out.
/// Returns when the audio channel closes, the call is cancelled or the
/// engine hangs up.
#[async_trait::async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn stream(
        &self,
        audio: mpsc::UnboundedReceiver<Vec<u8>>,
        results: mpsc::UnboundedSender<SttResult>,
        cancel: CancellationToken,
    ) -> Result<(), SttError>;
}

/// Folds finalized segments into whole utterances.
///
/// Final segments accumulate until the engine flags the end of speech, or
/// until an utterance-end message arrives for text that was never flagged.
#[derive(Debug, Default)]
pub struct UtteranceAssembler {
    finals: Vec<String>,
}

impl UtteranceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: SttResult) -> Option<TranscriptionEvent> {
        match result {
            SttResult::Interim { text } => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                Some(TranscriptionEvent::Activity {
                    text: text.to_string(),
                })
            }
            SttResult::Final { text, speech_final } => {
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                self.finals.push(text.to_string());
                if speech_final {
                    self.take()
                } else {
                    None
                }
            }
            SttResult::UtteranceEnd => self.take(),
        }
    }

    fn take(&mut self) -> Option<TranscriptionEvent> {
        if self.finals.is_empty() {
            return None;
        }
        let text = self.finals.join(" ");
        self.finals.clear();
        Some(TranscriptionEvent::Transcript { text })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results {
        channel: DeepgramChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
}

fn parse_message(text: &str) -> Result<Option<SttResult>, SttError> {
    let message: DeepgramMessage =
        serde_json::from_str(text).map_err(|e| SttError::ParseError(e.to_string()))?;

    Ok(match message {
        DeepgramMessage::Results {
            channel,
            is_final,
            speech_final,
        } => {
            let text = channel
                .alternatives
                .into_iter()
                .next()
                .map(|alt| alt.transcript)
                .unwrap_or_default();
            if is_final {
                Some(SttResult::Final { text, speech_final })
            } else {
                Some(SttResult::Interim { text })
            }
        }
        DeepgramMessage::UtteranceEnd => Some(SttResult::UtteranceEnd),
        DeepgramMessage::Other => None,
    })
}

/// Deepgram live transcription over a WebSocket
pub struct DeepgramStt {
    api_key: String,
    config: SttConfig,
}

impl DeepgramStt {
    pub fn new(api_key: String) -> Self {
        Self::with_config(api_key, SttConfig::default())
    }

    pub fn with_config(api_key: String, config: SttConfig) -> Self {
        Self { api_key, config }
    }

    fn listen_url(&self) -> Result<Url, SttError> {
        let mut url = Url::parse(&self.config.base_url)?;
        url.query_pairs_mut()
            .append_pair("encoding", &self.config.encoding)
            .append_pair("sample_rate", &self.config.sample_rate.to_string())
            .append_pair("model", &self.config.model)
            .append_pair("punctuate", "true")
            .append_pair("interim_results", "true")
            .append_pair("endpointing", &self.config.endpointing_ms.to_string())
            .append_pair("utterance_end_ms", &self.config.utterance_end_ms.to_string());
        Ok(url)
    }
}

#[async_trait::async_trait]
impl TranscriptionEngine for DeepgramStt {
    async fn stream(
        &self,
        mut audio: mpsc::UnboundedReceiver<Vec<u8>>,
        results: mpsc::UnboundedSender<SttResult>,
        cancel: CancellationToken,
    ) -> Result<(), SttError> {
        let mut request = self.listen_url()?.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))?,
        );

        let (ws_stream, _) = connect_async(request).await?;
        log::info!("STT: connected to {}", self.config.base_url);
        let (mut write, mut read) = ws_stream.split();

        let close_stream = json!({ "type": "CloseStream" }).to_string();
        let mut audio_open = true;
        let mut chunk_count = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("STT: call ended, closing stream");
                    let _ = write.send(Message::Text(close_stream.clone().into())).await;
                    let _ = write.close().await;
                    break;
                }
                chunk = audio.recv(), if audio_open => match chunk {
                    Some(bytes) => {
                        chunk_count += 1;
                        write.send(Message::Binary(bytes.into())).await?;
                    }
                    None => {
                        // Ask the engine to flush, then keep reading until it hangs up
                        log::info!("STT: audio ended after {} chunks", chunk_count);
                        audio_open = false;
                        write.send(Message::Text(close_stream.clone().into())).await?;
                    }
                },
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match parse_message(text.as_str()) {
                        Ok(Some(result)) => {
                            if results.send(result).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("STT: ignoring unparseable message: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("STT: server closed connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                },
            }
        }

        Ok(())
    }
}

/// Runs a transcription engine for one call and republishes its results
/// as activity and transcript events.
pub struct TranscriptionRelay;

impl TranscriptionRelay {
    pub fn spawn(
        engine: Arc<dyn TranscriptionEngine>,
        audio: mpsc::UnboundedReceiver<Vec<u8>>,
        events: mpsc::UnboundedSender<TranscriptionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (results_tx, mut results_rx) = mpsc::unbounded_channel();

            let engine_task = async {
                if let Err(e) = engine.stream(audio, results_tx, cancel.clone()).await {
                    log::error!("STT: transcription stream failed: {}", e);
                }
            };

            let publish_task = async {
                let mut assembler = UtteranceAssembler::new();
                while let Some(result) = results_rx.recv().await {
                    let Some(event) = assembler.push(result) else {
                        continue;
                    };
                    if let TranscriptionEvent::Transcript { text } = &event {
                        log::info!("STT -> LLM: {}", text);
                    }
                    if events.send(event).is_err() {
                        break;
                    }
                }
            };

            tokio::join!(engine_task, publish_task);
            log::debug!("STT: relay stopped");
        })
    }
}
