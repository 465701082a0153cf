use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("Synthesis returned no audio")]
    EmptyAudio,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub model: String,
    pub base_url: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: "aura-asteria-en".to_string(),
            base_url: "https://api.deepgram.com/v1/speak".to_string(),
            // Raw 8 kHz mulaw is what the media stream plays back
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Speech synthesis boundary: text in, encoded audio out
#[async_trait::async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError>;
}

pub struct DeepgramTts {
    client: Client,
    api_key: String,
    config: TtsConfig,
}

impl DeepgramTts {
    pub fn new(api_key: String) -> Result<Self, TtsError> {
        Self::with_config(api_key, TtsConfig::default())
    }

    pub fn with_config(api_key: String, config: TtsConfig) -> Result<Self, TtsError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn speak_url(&self) -> Result<Url, TtsError> {
        let mut url = Url::parse(&self.config.base_url)?;
        url.query_pairs_mut()
            .append_pair("model", &self.config.model)
            .append_pair("encoding", &self.config.encoding)
            .append_pair("sample_rate", &self.config.sample_rate.to_string())
            .append_pair("container", "none");
        Ok(url)
    }
}

#[async_trait::async_trait]
impl SpeechEngine for DeepgramTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let url = self.speak_url()?;

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&json!({ "text": text }))
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TtsError::ApiError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let audio = response.bytes().await?.to_vec();
        if audio.is_empty() {
            return Err(TtsError::EmptyAudio);
        }
        Ok(audio)
    }
}
