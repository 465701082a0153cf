pub mod config;
pub mod error;
pub mod interruption;
pub mod llm;
pub mod playback;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stt;
pub mod synthesizer;
pub mod tts;

pub use error::{RelayError, Result};
