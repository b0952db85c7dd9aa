use anyhow::Result;
use chrono_tz::Tz;
use std::env;

/// Options for the page cache middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCacheConfig {
    /// Bypass caching for every request
    pub skip: bool,
    /// Honour `skipcache=1` on individual requests
    pub allow_skip: bool,
    /// Honour `flushcache=1` (evicts the whole cache tag)
    pub allow_flush: bool,
    /// Honour `clearcache=1` (evicts the entry for the request's key)
    pub allow_clear: bool,
    /// TTL used when a route has no override, and the floor when it does
    pub default_minutes: u32,
    /// Timezone used to render `X-Cache-Expires`
    pub timezone: Tz,
    /// Maximum number of entries held by the in-memory store
    pub max_capacity: u64,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            skip: false,
            allow_skip: false,
            allow_flush: false,
            allow_clear: false,
            default_minutes: 10,
            timezone: Tz::UTC,
            max_capacity: 10_000,
        }
    }
}

impl PageCacheConfig {
    /// Read `PAGECACHE_*` variables, falling back to defaults for missing or bad values.
    pub fn from_env_vars() -> Self {
        let defaults = Self::default();

        PageCacheConfig {
            skip: env_flag("PAGECACHE_SKIP", defaults.skip),
            allow_skip: env_flag("PAGECACHE_ALLOW_SKIP", defaults.allow_skip),
            allow_flush: env_flag("PAGECACHE_ALLOW_FLUSH", defaults.allow_flush),
            allow_clear: env_flag("PAGECACHE_ALLOW_CLEAR", defaults.allow_clear),
            default_minutes: env::var("PAGECACHE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_minutes),
            timezone: env::var("PAGECACHE_TIMEZONE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timezone),
            max_capacity: env::var("PAGECACHE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_capacity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub page_cache: PageCacheConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_env_only()
    }

    /// Load configuration from environment variables only (without loading .env files)
    /// This is useful for testing where you want to control the environment directly
    pub fn from_env_only() -> Result<Self> {
        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            page_cache: PageCacheConfig::from_env_vars(),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => parse_flag(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" TRUE "), Some(true));
        assert_eq!(parse_flag("on"), Some(true));
        assert_eq!(parse_flag("no"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn default_page_cache_config() {
        let config = PageCacheConfig::default();
        assert!(!config.skip);
        assert!(!config.allow_skip);
        assert!(!config.allow_flush);
        assert!(!config.allow_clear);
        assert_eq!(config.default_minutes, 10);
        assert_eq!(config.timezone, Tz::UTC);
    }
}
