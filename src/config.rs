// =============================================================================
// CONFIGURATION MODULE
// =============================================================================
// Loads configuration from environment variables into a typed Config.
// Configuration errors surface at startup, not on the first request.
// =============================================================================

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_GATEWAY_URL: &str = "https://api.razorpay.com";

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 8002)
    pub port: u16,

    /// PostgreSQL connection URL. When unset the service runs on the
    /// in-process memory store (local development only).
    pub database_url: Option<String>,

    /// Redis connection URL for the catalog read cache (optional)
    pub redis_url: Option<String>,

    /// Payment gateway settings
    pub payment: PaymentConfig,
}

#[derive(Clone)]
pub struct PaymentConfig {
    pub base_url: String,
    pub key_id: String,
    /// Shared secret for both gateway auth and callback signatures
    pub key_secret: String,
    pub timeout: Duration,
    /// ISO currency code for checkout orders
    pub currency: String,
}

// Keep the secret out of logs.
impl std::fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentConfig")
            .field("base_url", &self.base_url)
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("currency", &self.currency)
            .finish()
    }
}

impl Config {
    /// Creates a Config by reading environment variables.
    ///
    /// # Returns
    /// - `Ok(Config)` if all required variables are set and parse
    /// - `Err` naming the offending variable otherwise
    pub fn from_env() -> Result<Self> {
        let timeout_secs: u64 = env::var("PAYMENT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("Failed to parse PAYMENT_TIMEOUT_SECS as a number")?;

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8002".to_string())
                .parse()
                .context("Failed to parse PORT as a number")?,

            database_url: optional_var("DATABASE_URL"),

            redis_url: optional_var("REDIS_URL"),

            payment: PaymentConfig {
                base_url: optional_var("PAYMENT_GATEWAY_URL")
                    .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
                key_id: env::var("PAYMENT_KEY_ID")
                    .context("PAYMENT_KEY_ID environment variable is required")?,
                key_secret: env::var("PAYMENT_KEY_SECRET")
                    .context("PAYMENT_KEY_SECRET environment variable is required")?,
                timeout: Duration::from_secs(timeout_secs),
                currency: optional_var("CURRENCY").unwrap_or_else(|| "INR".to_string()),
            },
        })
    }
}

/// Unset and empty are treated the same.
fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
