use serde::Deserialize;
use time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

/// Master key for the credential vault. `key_hex` must be 64 hex chars
/// (AES-256). When absent outside production an ephemeral key is generated
/// at startup with a warning; in production a missing key refuses to boot.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub key_hex: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Timeout for Moodle authentication round-trips.
    pub timeout_secs: u64,
    pub google_tokeninfo_url: String,
    /// Base URL of the scraping/analysis service the sync pipeline delegates to.
    pub scraper_base_url: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window_minutes: i64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::minutes(self.window_minutes)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Authenticated "test my credentials" calls, keyed by user.
    pub credential_test: RateLimitPolicy,
    /// Pre-session credential checks, keyed by client IP.
    pub anonymous_credential_test: RateLimitPolicy,
    /// Sync trigger calls, keyed by user.
    pub sync_trigger: RateLimitPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub production: bool,
    pub jwt: JwtConfig,
    pub vault: VaultConfig,
    pub provider: ProviderConfig,
    pub limits: RateLimitConfig,
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let production = std::env::var("APP_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);

        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "unisync".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "unisync-students".into()),
            ttl_minutes: env_i64("JWT_TTL_MINUTES", 60 * 24),
        };

        let vault = VaultConfig {
            key_hex: std::env::var("CREDENTIAL_ENCRYPTION_KEY").ok(),
        };
        if production && vault.key_hex.is_none() {
            anyhow::bail!("CREDENTIAL_ENCRYPTION_KEY must be set in production");
        }

        let provider = ProviderConfig {
            timeout_secs: env_i64("PROVIDER_TIMEOUT_SECS", 15) as u64,
            google_tokeninfo_url: std::env::var("GOOGLE_TOKENINFO_URL")
                .unwrap_or_else(|_| "https://oauth2.googleapis.com/tokeninfo".into()),
            scraper_base_url: std::env::var("SCRAPER_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8002".into()),
        };

        let limits = RateLimitConfig {
            credential_test: RateLimitPolicy {
                max_attempts: env_u32("CREDENTIAL_TEST_MAX_ATTEMPTS", 10),
                window_minutes: env_i64("CREDENTIAL_TEST_WINDOW_MINUTES", 15),
            },
            anonymous_credential_test: RateLimitPolicy {
                max_attempts: env_u32("ANON_CREDENTIAL_TEST_MAX_ATTEMPTS", 3),
                window_minutes: env_i64("ANON_CREDENTIAL_TEST_WINDOW_MINUTES", 15),
            },
            sync_trigger: RateLimitPolicy {
                max_attempts: env_u32("SYNC_TRIGGER_MAX_ATTEMPTS", 2),
                window_minutes: env_i64("SYNC_TRIGGER_WINDOW_MINUTES", 10),
            },
        };

        Ok(Self {
            database_url,
            production,
            jwt,
            vault,
            provider,
            limits,
        })
    }
}
