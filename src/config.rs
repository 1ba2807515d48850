use crate::llm::LlmConfig;
use crate::preview::{DEFAULT_FALLBACK_TEMPLATE, OpenGraphConfig, PreviewConfig};
use crate::sessions::SessionConfig;
use crate::stylist::StylistConfig;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PREVIEW_FALLBACK_TEMPLATE must contain `{{query}}`, got `{0}`")]
    FallbackTemplate(String),
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            body_limit: 10 * 1024 * 1024,
        }
    }
}

/// Process configuration, read once at startup and handed to each client
/// constructor. Nothing below reads the environment on its own.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub opengraph: OpenGraphConfig,
    pub preview: PreviewConfig,
    pub http: HttpConfig,
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub stylist: StylistConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| text(key).and_then(|value| value.parse::<u64>().ok());

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            base_url: text("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(llm_defaults.base_url),
            api_key: text("OPENAI_API_KEY"),
            model: text("OPENAI_MODEL").unwrap_or(llm_defaults.model),
            max_tokens: number("OPENAI_MAX_TOKENS")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(llm_defaults.max_tokens),
        };

        let og_defaults = OpenGraphConfig::default();
        let opengraph = OpenGraphConfig {
            base_url: text("OPENGRAPH_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(og_defaults.base_url),
            app_id: text("OPENGRAPH_APP_ID"),
        };

        let fallback_template =
            text("PREVIEW_FALLBACK_TEMPLATE").unwrap_or_else(|| DEFAULT_FALLBACK_TEMPLATE.into());
        if !fallback_template.contains("{query}") {
            return Err(ConfigError::FallbackTemplate(fallback_template));
        }
        let preview_defaults = PreviewConfig::default();
        let preview = PreviewConfig {
            timeout: number("PREVIEW_TIMEOUT_MS")
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(preview_defaults.timeout),
            concurrency: number("PREVIEW_CONCURRENCY")
                .map(|v| usize::try_from(v).unwrap_or(usize::MAX).max(1))
                .unwrap_or(preview_defaults.concurrency),
            fallback_template,
        };

        let http_defaults = HttpConfig::default();
        let http = HttpConfig {
            timeout_secs: number("HTTP_TIMEOUT_SECS").unwrap_or(http_defaults.timeout_secs),
            connect_timeout_secs: number("HTTP_CONNECT_TIMEOUT_SECS")
                .unwrap_or(http_defaults.connect_timeout_secs),
        };

        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            port: text("PORT")
                .and_then(|value| value.parse().ok())
                .unwrap_or(server_defaults.port),
            body_limit: number("REQUEST_MAX_BYTES")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(server_defaults.body_limit),
        };

        let sessions = SessionConfig {
            idle_ttl: number("SESSION_IDLE_TTL_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(SessionConfig::default().idle_ttl),
        };

        let stylist_defaults = StylistConfig::default();
        let stylist = StylistConfig {
            model: text("OPENAI_STYLIST_MODEL").unwrap_or(stylist_defaults.model),
            temperature: text("OPENAI_STYLIST_TEMPERATURE")
                .and_then(|value| value.parse::<f32>().ok())
                .filter(|v| (0.0..=2.0).contains(v))
                .unwrap_or(stylist_defaults.temperature),
        };

        Ok(Self {
            llm,
            opengraph,
            preview,
            http,
            server,
            sessions,
            stylist,
        })
    }
}
