use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 1048576 = 1MB)
    pub request_body_limit: usize,

    /// Request timeout in seconds, not applied to WebSocket connections
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Server port
    /// Env: PORT (default: 4200)
    pub port: u16,

    /// Database file path
    /// Env: DATABASE_PATH (default: "tilerace.db")
    pub database_path: String,

    /// Allows POST /auth/impersonate to hand out tickets for any player id.
    /// Never enable this outside of local development.
    /// Env: ALLOW_INSECURE_IMPERSONATION (default: 0)
    pub allow_impersonation: bool,

    /// Rate limit for /auth endpoints (requests per minute)
    /// Env: RATE_LIMIT_AUTH_PER_MIN (default: 30)
    pub rate_limit_auth_per_min: u64,

    /// Burst size for /auth endpoints
    /// Env: RATE_LIMIT_AUTH_BURST (default: 10)
    pub rate_limit_auth_burst: u32,

    /// Rate limit for track endpoints (requests per second)
    /// Env: RATE_LIMIT_GENERAL_PER_SEC (default: 20)
    pub rate_limit_general_per_sec: u64,

    /// Burst size for track endpoints
    /// Env: RATE_LIMIT_GENERAL_BURST (default: 40)
    pub rate_limit_general_burst: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv(); //for debugging mostly
        let defaults = Self::default();
        Self {
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", defaults.request_body_limit),
            request_timeout: Duration::from_secs(env_or_default(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            port: env_or_default("PORT", defaults.port),
            database_path: env_or_default_string("DATABASE_PATH", &defaults.database_path),
            allow_impersonation: env_flag("ALLOW_INSECURE_IMPERSONATION"),
            rate_limit_auth_per_min: env_or_default(
                "RATE_LIMIT_AUTH_PER_MIN",
                defaults.rate_limit_auth_per_min,
            ),
            rate_limit_auth_burst: env_or_default(
                "RATE_LIMIT_AUTH_BURST",
                defaults.rate_limit_auth_burst,
            ),
            rate_limit_general_per_sec: env_or_default(
                "RATE_LIMIT_GENERAL_PER_SEC",
                defaults.rate_limit_general_per_sec,
            ),
            rate_limit_general_burst: env_or_default(
                "RATE_LIMIT_GENERAL_BURST",
                defaults.rate_limit_general_burst,
            ),
        }
    }
}

impl Default for Config {
    /// Create configuration with all default values
    fn default() -> Self {
        Self {
            request_body_limit: 1024 * 1024, // 1 MB
            request_timeout: Duration::from_secs(30),
            port: 4200,
            database_path: "tilerace.db".to_string(),
            allow_impersonation: false,
            rate_limit_auth_per_min: 30,
            rate_limit_auth_burst: 10,
            rate_limit_general_per_sec: 20,
            rate_limit_general_burst: 40,
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}

/// "1" or "true" switch a flag on, anything else leaves it off
fn env_flag(key: &str) -> bool {
    matches!(var(key).as_deref(), Ok("1") | Ok("true"))
}
