use clap::Parser;
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
    #[error("Failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

/// API keys for the external engines
#[derive(Debug)]
pub struct ApiConfig {
    pub deepgram_key: SecretBox<String>,
    pub openai_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is fine, real deployments set the environment directly
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load API configuration from a specific env file, then the environment
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::from_path(path)?;
        Self::from_env()
    }

    fn from_env() -> Result<Self, ConfigError> {
        let deepgram_key = Self::load_api_key("DEEPGRAM_API_KEY", "Deepgram")?;
        let openai_key = Self::load_api_key("OPENAI_API_KEY", "OpenAI")?;

        Ok(Self {
            deepgram_key,
            openai_key,
        })
    }

    /// Load and validate a single API key from environment
    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;

        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service_name.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }

        Self::validate_key_format(&key, service_name)?;

        Ok(SecretBox::new(Box::new(key)))
    }

    /// Validate API key format for each service
    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        match service {
            "OpenAI" => {
                if !key.starts_with("sk-") {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: "OpenAI keys should start with 'sk-'".to_string(),
                    });
                }
            }
            "Deepgram" => {
                // Deepgram keys are 40 hex characters
                if key.len() < 32 {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: "Deepgram keys should be at least 32 characters".to_string(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Get Deepgram API key (use only when making API calls)
    pub fn deepgram_key(&self) -> &str {
        self.deepgram_key.expose_secret()
    }

    /// Get OpenAI API key (use only when making API calls)
    pub fn openai_key(&self) -> &str {
        self.openai_key.expose_secret()
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Command line / environment settings for the media-stream server
#[derive(Parser, Debug, Clone)]
#[command(name = "phone-agent", about = "Media-stream voice agent for inbound calls")]
pub struct ServerConfig {
    /// Address the WebSocket server binds to
    #[arg(long, env = "SERVER_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Path the telephony provider connects its media stream to
    #[arg(long, env = "SERVER_API_CONNECTION", default_value = "/connection")]
    pub path: String,

    /// Chat-completions model
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4-1106-preview")]
    pub model: String,

    /// Speech synthesis voice model
    #[arg(long, env = "VOICE_MODEL", default_value = "aura-asteria-en")]
    pub voice: String,

    /// Minimum interim utterance length (chars) that counts as an interruption
    #[arg(long, env = "INTERRUPT_MIN_CHARS", default_value_t = 5)]
    pub interrupt_min_chars: usize,

    /// Maximum side-effect calls chained within one interaction
    #[arg(long, env = "MAX_TOOL_CHAIN", default_value_t = 5)]
    pub max_tool_chain: usize,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidSetting {
                name: "path".to_string(),
                reason: format!("'{}' must start with '/'", self.path),
            });
        }
        if self.max_tool_chain == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_tool_chain".to_string(),
                reason: "must allow at least one side-effect call".to_string(),
            });
        }
        Ok(())
    }
}
