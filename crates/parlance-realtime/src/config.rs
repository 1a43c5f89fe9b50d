//! Client configuration, loadable from the environment.

use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::time::Duration;

use crate::error::ClientError;

/// Tunable settings for a [`VoiceClient`](crate::client::VoiceClient).
///
/// Only the API key has no default. Everything else ships with values that
/// match the hosted Parlance service and can be overridden per client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Credential presented during the websocket handshake. Never logged.
    pub api_key: SecretString,
    /// Websocket endpoint of the voice service.
    pub endpoint: String,
    /// Conversation model to request in the setup frame.
    pub model: String,
    /// Synthesized voice to request in the setup frame.
    pub voice: String,
    /// BCP-47 language tag, e.g. `en-US`.
    pub language: String,
    /// Capture and playback sample rate in hertz.
    pub sample_rate_hz: u32,
    /// Length of one outbound audio window.
    pub capture_window: Duration,
    /// Outbound frame queue capacity; sends above this fail fast.
    pub send_queue_capacity: usize,
    /// How long to wait for the service's `ready` acknowledgment.
    pub handshake_timeout: Duration,
    /// Interval between keep-alive pings on an open connection.
    pub ping_interval: Duration,
    /// Automatic reconnect behavior after an unexpected drop.
    pub reconnect: ReconnectPolicy,
}

/// Exponential backoff schedule for automatic reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt; doubles each attempt after that.
    pub base_delay: Duration,
    /// Ceiling on the per-attempt delay.
    pub max_delay: Duration,
    /// Attempts before the session is declared failed. Zero disables
    /// reconnection entirely.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ClientConfig {
    pub const DEFAULT_ENDPOINT: &str = "wss://live.parlance.app/v1/converse";
    pub const DEFAULT_MODEL: &str = "parlance-live-1";
    pub const DEFAULT_VOICE: &str = "aria";
    pub const DEFAULT_LANGUAGE: &str = "en-US";
    pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;

    /// A configuration with service defaults and the given credential.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            voice: Self::DEFAULT_VOICE.to_string(),
            language: Self::DEFAULT_LANGUAGE.to_string(),
            sample_rate_hz: Self::DEFAULT_SAMPLE_RATE_HZ,
            capture_window: Duration::from_millis(20),
            send_queue_capacity: 32,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Loads configuration from `PARLANCE_*` environment variables.
    ///
    /// `PARLANCE_API_KEY` is required; `PARLANCE_ENDPOINT`, `PARLANCE_MODEL`,
    /// `PARLANCE_VOICE`, `PARLANCE_LANGUAGE` and `PARLANCE_SAMPLE_RATE_HZ`
    /// override their defaults when set.
    pub fn from_env() -> Result<Self, ClientError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_key = env::var("PARLANCE_API_KEY")
            .map_err(|_| ClientError::Configuration("PARLANCE_API_KEY is not set".to_string()))?;
        let mut config = Self::new(api_key);

        if let Ok(endpoint) = env::var("PARLANCE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(model) = env::var("PARLANCE_MODEL") {
            config.model = model;
        }
        if let Ok(voice) = env::var("PARLANCE_VOICE") {
            config.voice = voice;
        }
        if let Ok(language) = env::var("PARLANCE_LANGUAGE") {
            config.language = language;
        }
        if let Ok(rate) = env::var("PARLANCE_SAMPLE_RATE_HZ") {
            config.sample_rate_hz = rate.parse().map_err(|_| {
                ClientError::Configuration(format!(
                    "PARLANCE_SAMPLE_RATE_HZ must be an integer, got {rate:?}"
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration without touching the network.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(ClientError::Configuration(
                "api_key must not be empty".to_string(),
            ));
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ClientError::Configuration(format!(
                "endpoint must be a ws:// or wss:// URL, got {:?}",
                self.endpoint
            )));
        }
        let host = self
            .endpoint
            .splitn(2, "://")
            .nth(1)
            .map(|rest| rest.split('/').next().unwrap_or(""))
            .unwrap_or("");
        if host.is_empty() {
            return Err(ClientError::Configuration(format!(
                "endpoint has no host: {:?}",
                self.endpoint
            )));
        }
        if !is_language_tag(&self.language) {
            return Err(ClientError::Configuration(format!(
                "language must be a BCP-47 tag like en-US, got {:?}",
                self.language
            )));
        }
        if !(8_000..=48_000).contains(&self.sample_rate_hz) {
            return Err(ClientError::Configuration(format!(
                "sample_rate_hz must be within 8000..=48000, got {}",
                self.sample_rate_hz
            )));
        }
        if self.capture_window.is_zero() {
            return Err(ClientError::Configuration(
                "capture_window must not be zero".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(ClientError::Configuration(
                "send_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() || self.ping_interval.is_zero() {
            return Err(ClientError::Configuration(
                "handshake_timeout and ping_interval must not be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Samples per capture window at the configured rate, never zero.
    pub(crate) fn window_samples(&self) -> usize {
        let samples =
            self.sample_rate_hz as u128 * self.capture_window.as_millis() / 1_000;
        (samples as usize).max(1)
    }
}

/// Light shape check for BCP-47: alphanumeric subtags joined by `-`,
/// starting with an alphabetic primary subtag.
fn is_language_tag(tag: &str) -> bool {
    let mut subtags = tag.split('-');
    let Some(primary) = subtags.next() else {
        return false;
    };
    if primary.is_empty()
        || primary.len() > 8
        || !primary.chars().all(|c| c.is_ascii_alphabetic())
    {
        return false;
    }
    subtags.all(|sub| {
        !sub.is_empty() && sub.len() <= 8 && sub.chars().all(|c| c.is_ascii_alphanumeric())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "PARLANCE_API_KEY",
            "PARLANCE_ENDPOINT",
            "PARLANCE_MODEL",
            "PARLANCE_VOICE",
            "PARLANCE_LANGUAGE",
            "PARLANCE_SAMPLE_RATE_HZ",
        ] {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::new("test-key");
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint, ClientConfig::DEFAULT_ENDPOINT);
        assert_eq!(config.sample_rate_hz, 16_000);
        assert_eq!(config.window_samples(), 320);
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let config = ClientConfig::new("   ");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[test]
    fn non_websocket_endpoint_is_rejected() {
        let mut config = ClientConfig::new("test-key");
        config.endpoint = "https://live.parlance.app".to_string();
        assert!(config.validate().is_err());

        config.endpoint = "wss://".to_string();
        assert!(config.validate().is_err());

        config.endpoint = "ws://localhost:9030/v1/converse".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn language_tags_are_shape_checked() {
        let mut config = ClientConfig::new("test-key");
        for good in ["en", "en-US", "pt-BR", "zh-Hant-TW"] {
            config.language = good.to_string();
            assert!(config.validate().is_ok(), "rejected {good}");
        }
        for bad in ["", "-US", "en--US", "en_US", "123-US"] {
            config.language = bad.to_string();
            assert!(config.validate().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn out_of_range_sample_rate_is_rejected() {
        let mut config = ClientConfig::new("test-key");
        config.sample_rate_hz = 4_000;
        assert!(config.validate().is_err());
        config.sample_rate_hz = 96_000;
        assert!(config.validate().is_err());
        config.sample_rate_hz = 24_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn window_samples_never_rounds_to_zero() {
        let mut config = ClientConfig::new("test-key");
        config.sample_rate_hz = 8_000;
        config.capture_window = Duration::from_micros(50);
        assert_eq!(config.window_samples(), 1);
    }

    #[test]
    #[serial]
    fn from_env_requires_api_key() {
        clear_env();
        let err = ClientConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PARLANCE_API_KEY"));
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        clear_env();
        unsafe {
            env::set_var("PARLANCE_API_KEY", "k-123");
            env::set_var("PARLANCE_ENDPOINT", "ws://localhost:9030/v1/converse");
            env::set_var("PARLANCE_VOICE", "juniper");
            env::set_var("PARLANCE_SAMPLE_RATE_HZ", "24000");
        }

        let config = ClientConfig::from_env().expect("config");
        assert_eq!(config.endpoint, "ws://localhost:9030/v1/converse");
        assert_eq!(config.voice, "juniper");
        assert_eq!(config.sample_rate_hz, 24_000);
        assert_eq!(config.model, ClientConfig::DEFAULT_MODEL);

        clear_env();
    }

    #[test]
    #[serial]
    fn from_env_rejects_non_numeric_sample_rate() {
        clear_env();
        unsafe {
            env::set_var("PARLANCE_API_KEY", "k-123");
            env::set_var("PARLANCE_SAMPLE_RATE_HZ", "fast");
        }

        let err = ClientConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PARLANCE_SAMPLE_RATE_HZ"));

        clear_env();
    }

    #[test]
    fn debug_output_redacts_the_api_key() {
        let config = ClientConfig::new("super-secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
