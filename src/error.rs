use thiserror::Error;

use crate::config::ConfigError;
use crate::llm::client::LlmError;
use crate::llm::segmenter::SegmenterError;
use crate::llm::tools::ToolError;
use crate::playback::PlaybackError;
use crate::protocol::ProtocolError;
use crate::session::SessionError;
use crate::stt::SttError;
use crate::tts::TtsError;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("STT error: {0}")]
    Stt(#[from] SttError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Segmenter error: {0}")]
    Segmenter(#[from] SegmenterError),

    #[error("TTS error: {0}")]
    Tts(#[from] TtsError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
