use callbridge_core::{AudioFormat, negotiator::DEFAULT_VAPI_BASE_URL};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// How agent audio is framed on its way to the call leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallFraming {
    /// Raw PCM in a binary WebSocket frame.
    Binary,
    /// A TeleCMI `streamAudio` JSON text frame with base64 PCM.
    PlayStream,
}

impl FromStr for CallFraming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "binary" => Ok(CallFraming::Binary),
            "play_stream" | "playstream" => Ok(CallFraming::PlayStream),
            other => Err(format!("'{}' is not one of binary, play_stream", other)),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub vapi_api_key: String,
    pub vapi_assistant_id: String,
    pub vapi_base_url: String,
    pub call_format: AudioFormat,
    pub agent_format: AudioFormat,
    pub call_framing: CallFraming,
    pub convert_call_audio: bool,
    pub negotiation_timeout: Duration,
    pub handshake_timeout: Duration,
    pub close_grace: Duration,
    pub shutdown_grace: Duration,
    pub max_sessions: usize,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn parsed_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn millis_or(name: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    parsed_or::<u64>(name, default_ms).map(Duration::from_millis)
}

fn sample_rate_or(name: &str, default: u32) -> Result<AudioFormat, ConfigError> {
    let rate = parsed_or::<u32>(name, default)?;
    if rate == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "sample rate must be greater than zero".to_string(),
        ));
    }
    Ok(AudioFormat::pcm16(rate))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8766".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let vapi_api_key = required("VAPI_API_KEY")?;
        let vapi_assistant_id = required("VAPI_ASSISTANT_ID")?;
        let vapi_base_url =
            std::env::var("VAPI_BASE_URL").unwrap_or_else(|_| DEFAULT_VAPI_BASE_URL.to_string());

        let call_format = sample_rate_or("CALL_SAMPLE_RATE", AudioFormat::TELEPHONY.sample_rate)?;
        let agent_format =
            sample_rate_or("AGENT_SAMPLE_RATE", AudioFormat::AGENT_DEFAULT.sample_rate)?;
        let call_framing = parsed_or("CALL_FRAMING", CallFraming::Binary)?;
        let convert_call_audio = parsed_or("CONVERT_CALL_AUDIO", false)?;

        let negotiation_timeout = millis_or("NEGOTIATION_TIMEOUT_MS", 10_000)?;
        let handshake_timeout = millis_or("HANDSHAKE_TIMEOUT_MS", 10_000)?;
        let close_grace = millis_or("CLOSE_GRACE_MS", 2_000)?;
        let shutdown_grace = millis_or("SHUTDOWN_GRACE_MS", 5_000)?;

        let max_sessions = parsed_or::<usize>("MAX_SESSIONS", 64)?;
        if max_sessions == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_SESSIONS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            vapi_api_key,
            vapi_assistant_id,
            vapi_base_url,
            call_format,
            agent_format,
            call_framing,
            convert_call_audio,
            negotiation_timeout,
            handshake_timeout,
            close_grace,
            shutdown_grace,
            max_sessions,
            log_level,
        })
    }
}
