//! Streams agent replies and slices them into speakable fragments.
//!
//! The segmenter owns the call transcript. Each submitted turn opens one
//! streaming completion; generated text is cut at the split marker and every
//! slice is emitted immediately with the next fragment index of its
//! interaction. A `tool_calls` finish runs the declared side effect, folds its
//! result back into the transcript and streams again for the same interaction.

use super::client::{CompletionClient, FinishReason, LlmError};
use super::context::{Role, Transcript};
use super::prompts::SPLIT_MARKER;
use super::tools::{recover_arguments, ToolRegistry};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SegmenterError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("Model called undeclared tool '{0}'")]
    UnknownTool(String),
    #[error("Fragment channel closed")]
    ChannelClosed,
    #[error("Operation was cancelled")]
    Cancelled,
}

/// A speakable slice of one agent reply
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFragment {
    pub interaction: u32,
    /// Position within the reply; `None` means speak as soon as ready
    pub index: Option<u32>,
    pub text: String,
}

/// A transcript turn waiting to be answered
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub text: String,
    pub interaction: u32,
    pub role: Role,
    pub name: Option<String>,
}

impl TurnRequest {
    pub fn user(text: impl Into<String>, interaction: u32) -> Self {
        Self {
            text: text.into(),
            interaction,
            role: Role::User,
            name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub split_marker: char,
    /// Side-effect calls allowed within one submitted turn
    pub max_tool_chain: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            split_marker: SPLIT_MARKER,
            max_tool_chain: 5,
        }
    }
}

enum StreamOutcome {
    Finished,
    ToolCall { name: String, arguments: String },
}

pub struct CompletionSegmenter {
    client: Arc<dyn CompletionClient>,
    tools: Arc<ToolRegistry>,
    transcript: Transcript,
    config: SegmenterConfig,
    fragments: mpsc::UnboundedSender<ReplyFragment>,
    // (interaction, next fragment index)
    counter: Option<(u32, u32)>,
}

impl CompletionSegmenter {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        tools: Arc<ToolRegistry>,
        transcript: Transcript,
        config: SegmenterConfig,
        fragments: mpsc::UnboundedSender<ReplyFragment>,
    ) -> Self {
        Self {
            client,
            tools,
            transcript,
            config,
            fragments,
            counter: None,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn add_call_metadata(&mut self, call_sid: &str) {
        self.transcript.add_call_metadata(call_sid);
    }

    /// Answer turns in arrival order until the channel closes or the call ends
    pub async fn run(
        mut self,
        mut turns: mpsc::UnboundedReceiver<TurnRequest>,
        cancel: CancellationToken,
    ) {
        loop {
            let turn = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                turn = turns.recv() => match turn {
                    Some(turn) => turn,
                    None => break,
                },
            };

            let result = self
                .submit_turn(
                    &turn.text,
                    turn.interaction,
                    turn.role,
                    turn.name.as_deref(),
                    &cancel,
                )
                .await;

            match result {
                Ok(()) => {
                    log::info!("LLM -> transcript length: {}", self.transcript.len());
                }
                Err(SegmenterError::Cancelled) | Err(SegmenterError::ChannelClosed) => break,
                Err(e @ SegmenterError::UnknownTool(_)) => {
                    log::error!(
                        "Interaction {}: {}; no further turns will be answered",
                        turn.interaction,
                        e
                    );
                    break;
                }
                Err(e) => {
                    log::error!("Interaction {}: turn failed: {}", turn.interaction, e);
                }
            }
        }
        log::debug!("LLM: segmenter stopped");
    }

    /// Append a turn and stream the agent's answer as reply fragments
    pub async fn submit_turn(
        &mut self,
        text: &str,
        interaction: u32,
        role: Role,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), SegmenterError> {
        self.transcript.push_turn(role, name, text);

        let tool_definitions = self.tools.get_tool_definitions();
        let mut full_reply = String::new();
        let mut chain = 0usize;

        loop {
            let outcome = self
                .stream_once(interaction, &tool_definitions, &mut full_reply, cancel)
                .await?;

            let (tool_name, raw_arguments) = match outcome {
                StreamOutcome::Finished => break,
                StreamOutcome::ToolCall { name, arguments } => (name, arguments),
            };

            chain += 1;
            if chain > self.config.max_tool_chain {
                log::warn!(
                    "Interaction {}: tool chain limit ({}) reached, dropping call to {}",
                    interaction,
                    self.config.max_tool_chain,
                    tool_name
                );
                break;
            }

            let tool = self
                .tools
                .find_tool(&tool_name)
                .cloned()
                .ok_or_else(|| SegmenterError::UnknownTool(tool_name.clone()))?;

            self.emit(ReplyFragment {
                interaction,
                index: None,
                text: tool.say.clone(),
            })?;

            let arguments = match recover_arguments(&raw_arguments) {
                Ok(arguments) => arguments,
                Err(e) => {
                    log::warn!(
                        "Interaction {}: skipping {} call: {}",
                        interaction,
                        tool_name,
                        e
                    );
                    break;
                }
            };

            log::info!("Interaction {}: LLM -> {}({})", interaction, tool_name, arguments);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SegmenterError::Cancelled),
                result = (tool.handler)(arguments) => result,
            };
            // A failed handler is reported back so the agent can recover with the caller
            let result = result.unwrap_or_else(|e| {
                log::warn!("Interaction {}: {} failed: {}", interaction, tool_name, e);
                serde_json::json!({ "error": e.to_string() }).to_string()
            });

            self.transcript
                .push_turn(Role::Function, Some(&tool_name), result);
        }

        if !full_reply.is_empty() {
            self.transcript.push_turn(Role::Assistant, None, full_reply);
        }
        Ok(())
    }

    async fn stream_once(
        &mut self,
        interaction: u32,
        tools: &[Value],
        full_reply: &mut String,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, SegmenterError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SegmenterError::Cancelled),
            result = self.client.stream_completion(self.transcript.messages(), tools) => result?,
        };

        let mut partial = String::new();
        let mut function_name = String::new();
        let mut function_args = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SegmenterError::Cancelled),
                next = stream.next() => next,
            };

            let Some(chunk) = next else {
                log::warn!("Interaction {}: LLM stream ended without finish reason", interaction);
                self.flush(interaction, &mut partial)?;
                return Ok(StreamOutcome::Finished);
            };
            let chunk = chunk?;

            if let Some(delta) = chunk.tool_call {
                if delta.index != 0 {
                    // Only the first call of a parallel batch is run
                    log::warn!(
                        "Interaction {}: ignoring parallel tool call #{} {:?}",
                        interaction,
                        delta.index,
                        delta.name
                    );
                } else {
                    if let Some(name) = delta.name {
                        function_name = name;
                    }
                    if let Some(arguments) = delta.arguments {
                        // Arguments stream as shards of one JSON document
                        function_args.push_str(&arguments);
                    }
                }
            }

            if chunk.finish_reason == Some(FinishReason::ToolCalls) {
                self.flush(interaction, &mut partial)?;
                return Ok(StreamOutcome::ToolCall {
                    name: function_name,
                    arguments: function_args,
                });
            }

            if let Some(content) = chunk.content {
                full_reply.push_str(&content);
                partial.push_str(&content);
            }

            let finished = chunk.finish_reason.is_some();
            if finished || partial.trim_end().ends_with(self.config.split_marker) {
                self.flush(interaction, &mut partial)?;
            }
            if finished {
                return Ok(StreamOutcome::Finished);
            }
        }
    }

    fn flush(&mut self, interaction: u32, partial: &mut String) -> Result<(), SegmenterError> {
        if partial.trim().is_empty() {
            partial.clear();
            return Ok(());
        }

        let index = self.next_index(interaction);
        let text = std::mem::take(partial);
        self.emit(ReplyFragment {
            interaction,
            index: Some(index),
            text,
        })
    }

    fn next_index(&mut self, interaction: u32) -> u32 {
        match &mut self.counter {
            Some((current, next)) if *current == interaction => {
                let index = *next;
                *next += 1;
                index
            }
            _ => {
                self.counter = Some((interaction, 1));
                0
            }
        }
    }

    fn emit(&self, fragment: ReplyFragment) -> Result<(), SegmenterError> {
        log::info!(
            "Interaction {}: LLM -> TTS [{:?}]: {}",
            fragment.interaction,
            fragment.index,
            fragment.text
        );
        self.fragments
            .send(fragment)
            .map_err(|_| SegmenterError::ChannelClosed)
    }
}
