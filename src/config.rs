use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub push: PushConfig,
    pub dispatch: DispatchConfig,
    pub reminder: ReminderConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Path to the push platform service account key JSON. The project id,
    /// signing key and token endpoint are read from this file.
    pub service_account_key_path: String,
    /// Base URL of the push platform send API. Overridable so tests can
    /// point the client at a local mock server.
    pub api_base_url: String,
    /// Override for the OAuth token endpoint. When `None`, the `token_uri`
    /// from the service account key file is used.
    pub token_url: Option<String>,
    /// Public key credential handed to the push platform when acquiring
    /// device tokens. Read from env var `PUSH_PUBLIC_KEY`.
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of in-flight deliveries during a fan-out.
    pub concurrency: usize,
    /// How many times a transient delivery failure is retried.
    pub retry_max_attempts: u32,
    /// Base delay for retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    /// Local hour of day (0-23) at which the daily reminder fires.
    pub hour: u32,
    /// Whether this instance also runs the server-side daily batch worker.
    /// Off by default; the /api/send-daily-notifications endpoint remains
    /// the primary trigger.
    pub batch_enabled: bool,
    /// How long the registrar waits for the delivery worker to activate.
    pub activation_timeout_seconds: u64,
    /// Where tokens are cached when the store is unreachable during save.
    pub fallback_cache_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the send endpoints (e.g. /api/send-notifications)
    pub send_per_second: u32,
    /// Burst size for the send endpoints
    pub send_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let reminder_hour: u32 = env::var("REMINDER_HOUR")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("REMINDER_HOUR".to_string()))?;
        if reminder_hour > 23 {
            return Err(ConfigError::InvalidValue("REMINDER_HOUR".to_string()));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/app.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            push: PushConfig {
                service_account_key_path: env::var("FCM_SERVICE_ACCOUNT_KEY_PATH")
                    .unwrap_or_else(|_| "serviceAccountKey.json".to_string()),
                api_base_url: env::var("FCM_API_BASE_URL")
                    .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
                token_url: env::var("FCM_TOKEN_URL").ok(),
                public_key: env::var("PUSH_PUBLIC_KEY").ok(),
            },
            dispatch: DispatchConfig {
                concurrency: env::var("DISPATCH_CONCURRENCY")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20),
                retry_max_attempts: env::var("DISPATCH_RETRY_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                retry_base_delay_ms: env::var("DISPATCH_RETRY_BASE_DELAY_MS")
                    .unwrap_or_else(|_| "250".to_string())
                    .parse()
                    .unwrap_or(250),
            },
            reminder: ReminderConfig {
                hour: reminder_hour,
                batch_enabled: matches!(
                    env::var("REMINDER_BATCH_ENABLED").as_deref(),
                    Ok("true") | Ok("1")
                ),
                activation_timeout_seconds: env::var("WORKER_ACTIVATION_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                fallback_cache_path: env::var("TOKEN_FALLBACK_CACHE_PATH")
                    .unwrap_or_else(|_| "data/pending_tokens.json".to_string()),
            },
            rate_limit: RateLimitConfig {
                send_per_second: env::var("RATE_LIMIT_SEND_PER_SECOND")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                send_burst: env::var("RATE_LIMIT_SEND_BURST")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/app.db".to_string(),
                max_connections: 5,
            },
            push: PushConfig {
                service_account_key_path: "serviceAccountKey.json".to_string(),
                api_base_url: "https://fcm.googleapis.com".to_string(),
                token_url: None,
                public_key: None,
            },
            dispatch: DispatchConfig {
                concurrency: 20,
                retry_max_attempts: 2,
                retry_base_delay_ms: 250,
            },
            reminder: ReminderConfig {
                hour: 8,
                batch_enabled: false,
                activation_timeout_seconds: 5,
                fallback_cache_path: "data/pending_tokens.json".to_string(),
            },
            rate_limit: RateLimitConfig {
                send_per_second: 10,
                send_burst: 30,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reminder.hour, 8);
        assert_eq!(config.dispatch.concurrency, 20);
        assert_eq!(config.reminder.activation_timeout_seconds, 5);
    }

    #[test]
    fn reminder_hour_out_of_range_is_rejected() {
        // from_env reads the process environment, so isolate the variable.
        std::env::set_var("REMINDER_HOUR", "24");
        let result = Config::from_env();
        std::env::remove_var("REMINDER_HOUR");
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
