// Environment-driven configuration. The gateway has no CLI surface; every
// knob is an environment variable with a documented default.

use std::env;

/// Checkpointing knobs for draft assistant messages.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Minimum buffered bytes since the last checkpoint before writing again.
    pub min_characters: usize,
    /// Maximum time between checkpoints, milliseconds.
    pub interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_characters: 512,
            interval_ms: 2_000,
        }
    }
}

/// Per-provider credential/endpoint settings pulled from the environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub api_key: String,
    /// Empty string means "use the provider's static default".
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// SQLite URI; `file::memory:` runs fully in memory.
    pub db_url: String,
    pub persist_transcripts: bool,
    /// Advertised transcript retention, surfaced on /healthz.
    pub retention_days: u32,
    pub port: u16,
    pub jwt_secret: String,

    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub gemini: ProviderSettings,

    pub rate_max: u32,
    pub rate_window_secs: u64,

    pub checkpoint: CheckpointConfig,
    pub tool_concurrency: usize,
    pub max_tool_iterations: u32,

    /// Upstream timeout for chat paths, seconds.
    pub request_timeout_secs: u64,
    /// Upstream timeout for model listing, seconds.
    pub models_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            db_url: "file::memory:".to_string(),
            persist_transcripts: true,
            retention_days: 30,
            port: 8080,
            jwt_secret: String::new(),
            openai: ProviderSettings::default(),
            anthropic: ProviderSettings::default(),
            gemini: ProviderSettings::default(),
            rate_max: 120,
            rate_window_secs: 60,
            checkpoint: CheckpointConfig::default(),
            tool_concurrency: 4,
            max_tool_iterations: 10,
            request_timeout_secs: 300,
            models_timeout_secs: 30,
        }
    }
}

impl GatewayConfig {
    /// Load from the process environment, falling back to defaults (with a
    /// warning) on unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_url: env_string("DB_URL", &defaults.db_url),
            persist_transcripts: env_bool("PERSIST_TRANSCRIPTS", defaults.persist_transcripts),
            retention_days: env_parse("PERSIST_RETENTION_DAYS", defaults.retention_days),
            port: env_parse("PORT", defaults.port),
            jwt_secret: env_string("JWT_SECRET", ""),
            openai: ProviderSettings {
                api_key: env_string("OPENAI_API_KEY", ""),
                base_url: env_string("OPENAI_BASE_URL", ""),
            },
            anthropic: ProviderSettings {
                api_key: env_string("ANTHROPIC_API_KEY", ""),
                base_url: env_string("ANTHROPIC_BASE_URL", ""),
            },
            gemini: ProviderSettings {
                api_key: env_string("GEMINI_API_KEY", ""),
                base_url: env_string("GEMINI_BASE_URL", ""),
            },
            rate_max: env_parse("RATE_MAX", defaults.rate_max),
            rate_window_secs: env_parse("RATE_WINDOW_SEC", defaults.rate_window_secs),
            checkpoint: CheckpointConfig {
                enabled: env_bool("CHECKPOINT_ENABLED", defaults.checkpoint.enabled),
                min_characters: env_parse("CHECKPOINT_MIN_CHARS", defaults.checkpoint.min_characters),
                interval_ms: env_parse("CHECKPOINT_INTERVAL_MS", defaults.checkpoint.interval_ms),
            },
            tool_concurrency: env_parse("TOOL_CONCURRENCY", defaults.tool_concurrency).max(1),
            max_tool_iterations: env_parse("MAX_TOOL_ITERATIONS", defaults.max_tool_iterations),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            models_timeout_secs: env_parse("MODELS_TIMEOUT_SECS", defaults.models_timeout_secs),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                log::warn!("{}={:?} is not a boolean, using default {}", key, other, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("{}={:?} failed to parse, using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.db_url, "file::memory:");
        assert!(config.persist_transcripts);
        assert_eq!(config.max_tool_iterations, 10);
        assert!(config.checkpoint.enabled);
        assert_eq!(config.checkpoint.min_characters, 512);
    }

    #[test]
    fn test_env_bool_parsing() {
        assert!(super::env_bool("GATEWAY_TEST_MISSING_BOOL", true));
        std::env::set_var("GATEWAY_TEST_BOOL", "off");
        assert!(!super::env_bool("GATEWAY_TEST_BOOL", true));
        std::env::set_var("GATEWAY_TEST_BOOL", "junk");
        assert!(super::env_bool("GATEWAY_TEST_BOOL", true));
        std::env::remove_var("GATEWAY_TEST_BOOL");
    }

    #[test]
    fn test_env_parse_fallback() {
        std::env::set_var("GATEWAY_TEST_PORT", "not-a-number");
        assert_eq!(super::env_parse("GATEWAY_TEST_PORT", 8080u16), 8080);
        std::env::set_var("GATEWAY_TEST_PORT", "9001");
        assert_eq!(super::env_parse("GATEWAY_TEST_PORT", 8080u16), 9001);
        std::env::remove_var("GATEWAY_TEST_PORT");
    }
}
