use super::context::Message;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Response parsing error: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4-1106-preview".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// One shard of a streamed side-effect call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    /// Which call of a parallel batch this shard belongs to
    pub index: u32,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One streamed delta event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionChunk {
    pub content: Option<String>,
    pub tool_call: Option<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
}

impl CompletionChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(name: Option<&str>, arguments: Option<&str>) -> Self {
        Self::indexed_tool_call(0, name, arguments)
    }

    pub fn indexed_tool_call(index: u32, name: Option<&str>, arguments: Option<&str>) -> Self {
        Self {
            tool_call: Some(ToolCallDelta {
                index,
                name: name.map(str::to_string),
                arguments: arguments.map(str::to_string),
            }),
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk, LlmError>> + Send>>;

/// Language-model boundary: a transcript plus declared tools in, deltas out
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[Value],
    ) -> Result<CompletionStream, LlmError>;
}

/// Streaming client for OpenAI-compatible chat-completions endpoints
pub struct OpenAiLlm {
    client: Client,
    api_key: String,
    config: LlmConfig,
}

impl OpenAiLlm {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        Self::with_config(api_key, LlmConfig::default())
    }

    pub fn with_config(api_key: String, config: LlmConfig) -> Result<Self, LlmError> {
        // No overall timeout: a streamed reply can legitimately run long
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    fn build_payload(&self, messages: &[Message], tools: &[Value]) -> Value {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true
        });

        if let Some(temperature) = self.config.temperature {
            payload["temperature"] = json!(temperature);
        }

        if !tools.is_empty() {
            payload["tools"] = json!(tools);
            // The segmenter runs one side effect per finish
            payload["parallel_tool_calls"] = json!(false);
        }

        payload
    }
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiLlm {
    async fn stream_completion(
        &self,
        messages: &[Message],
        tools: &[Value],
    ) -> Result<CompletionStream, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let payload = self.build_payload(messages, tools);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::ApiError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let mut bytes = Box::pin(response.bytes_stream());

        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::default();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(LlmError::from)?;
                for event in decoder.push(&chunk) {
                    match event {
                        SseEvent::Done => break 'read,
                        SseEvent::Data(data) => {
                            if let Some(parsed) = parse_chunk(&data)? {
                                yield parsed;
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a server-sent-events byte stream into `data:` payloads.
/// Network chunks do not respect line boundaries, so partial lines are held
/// until their newline arrives.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else if !data.is_empty() {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
        }
        events
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u32,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Parse one `data:` payload. Only the first choice and the first tool call
/// of a delta are considered.
fn parse_chunk(data: &str) -> Result<Option<CompletionChunk>, LlmError> {
    let response: StreamResponse = serde_json::from_str(data)
        .map_err(|e| LlmError::ParseError(format!("Invalid stream chunk: {}", e)))?;

    let Some(choice) = response.choices.into_iter().next() else {
        return Ok(None);
    };

    let tool_call = choice
        .delta
        .tool_calls
        .and_then(|calls| calls.into_iter().next())
        .and_then(|call| {
            let index = call.index;
            call.function.map(|function| (index, function))
        })
        .map(|(index, function)| ToolCallDelta {
            index,
            name: function.name.filter(|n| !n.is_empty()),
            arguments: function.arguments.filter(|a| !a.is_empty()),
        });

    Ok(Some(CompletionChunk {
        content: choice.delta.content,
        tool_call,
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_wire),
    }))
}
