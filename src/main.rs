use anyhow::Context;
use clap::Parser;
use phone_agent_rs::{
    config::{load_config, ServerConfig},
    llm::{create_default_registry, LlmConfig, OpenAiLlm},
    server::MediaStreamServer,
    session::{Engines, SessionConfig},
    stt::DeepgramStt,
    tts::{DeepgramTts, TtsConfig},
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("🚀 Initializing phone-agent-rs");

    let server_config = ServerConfig::parse();
    server_config.validate()?;
    let api_config = load_config()?;

    let completion = OpenAiLlm::with_config(
        api_config.openai_key().to_string(),
        LlmConfig {
            model: server_config.model.clone(),
            ..LlmConfig::default()
        },
    )
    .context("building LLM client")?;
    log::info!("🤖 LLM client ready ({})", server_config.model);

    let speech = DeepgramTts::with_config(
        api_config.deepgram_key().to_string(),
        TtsConfig {
            model: server_config.voice.clone(),
            ..TtsConfig::default()
        },
    )
    .context("building TTS client")?;
    log::info!("🔊 TTS client ready ({})", server_config.voice);

    let engines = Engines {
        transcription: Arc::new(DeepgramStt::new(api_config.deepgram_key().to_string())),
        completion: Arc::new(completion),
        speech: Arc::new(speech),
        tools: Arc::new(create_default_registry()),
    };

    let session_config = SessionConfig {
        interrupt_min_chars: server_config.interrupt_min_chars,
        max_tool_chain: server_config.max_tool_chain,
        ..SessionConfig::default()
    };

    let server = MediaStreamServer::bind(
        &server_config.bind,
        server_config.path.clone(),
        engines,
        session_config,
    )
    .await
    .with_context(|| format!("binding {}", server_config.bind))?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 Received Ctrl+C, ending all calls");
            shutdown.cancel();
        }
    });

    server.run().await?;
    log::info!("👋 Server stopped");
    Ok(())
}
