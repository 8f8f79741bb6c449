use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Connection settings for [`HttpAuthority`](super::HttpAuthority).
///
/// The first host is a constructor parameter; no runtime "missing host" errors.
///
/// ```rust,ignore
/// use session_guard::AuthorityConfig;
///
/// let config = AuthorityConfig::new("http://localhost:3567".parse()?)
///     .with_additional_host("http://localhost:3568".parse()?)
///     .with_timeout(std::time::Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorityConfig {
    pub(crate) hosts: Vec<Url>,
    pub(crate) base_path: String,
    pub(crate) timeout: Duration,
    pub(crate) api_key: Option<String>,
}

impl AuthorityConfig {
    /// Create a configuration for a single authority host.
    #[must_use]
    pub fn new(host: Url) -> Self {
        Self {
            hosts: vec![host],
            base_path: String::new(),
            timeout: Duration::from_secs(10),
            api_key: None,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Required env vars
    /// - `SESSION_AUTHORITY_URLS`: `;`-separated hosts, e.g. `localhost:3567;https://auth.internal`.
    ///   Hosts without a scheme default to `http://`.
    ///
    /// # Optional env vars
    /// - `SESSION_AUTHORITY_TIMEOUT_MS`: per-request timeout (default 10000)
    /// - `SESSION_AUTHORITY_API_KEY`: sent as the `api-key` header
    /// - `SESSION_AUTHORITY_BASE_PATH`: path prefix for every endpoint
    ///
    /// # Errors
    ///
    /// Returns [`Error::General`] if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let urls = std::env::var("SESSION_AUTHORITY_URLS")
            .map_err(|_| Error::General("SESSION_AUTHORITY_URLS is required".into()))?;
        let mut config = Self::parse_hosts(&urls)?;

        if let Ok(ms) = std::env::var("SESSION_AUTHORITY_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .map_err(|e| Error::General(format!("SESSION_AUTHORITY_TIMEOUT_MS: {e}")))?;
            config = config.with_timeout(Duration::from_millis(ms));
        }
        if let Ok(key) = std::env::var("SESSION_AUTHORITY_API_KEY") {
            config = config.with_api_key(key);
        }
        if let Ok(path) = std::env::var("SESSION_AUTHORITY_BASE_PATH") {
            config = config.with_base_path(path);
        }
        Ok(config)
    }

    /// Parses a `;`-separated host list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::General`] if the list is empty or a host is not a valid URL.
    pub fn parse_hosts(hosts: &str) -> Result<Self, Error> {
        let mut parsed = hosts
            .split(';')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| {
                let with_scheme = if h.contains("://") {
                    h.to_string()
                } else {
                    format!("http://{h}")
                };
                with_scheme
                    .parse::<Url>()
                    .map_err(|e| Error::General(format!("authority host {h}: {e}")))
            });

        let first = parsed
            .next()
            .ok_or_else(|| Error::General("at least one authority host is required".into()))??;
        let mut config = Self::new(first);
        for host in parsed {
            config = config.with_additional_host(host?);
        }
        Ok(config)
    }

    /// Add a failover host, tried after the ones already configured.
    #[must_use]
    pub fn with_additional_host(mut self, host: Url) -> Self {
        self.hosts.push(host);
        self
    }

    /// Per-request timeout. Expiry surfaces as an authority error.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Path prefix for every endpoint, e.g. `/auth`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn hosts(&self) -> &[Url] {
        &self.hosts
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hosts_defaults_scheme() {
        let config = AuthorityConfig::parse_hosts("localhost:3567; https://auth.example.com").unwrap();
        let hosts: Vec<&str> = config.hosts().iter().map(Url::as_str).collect();
        assert_eq!(hosts, vec!["http://localhost:3567/", "https://auth.example.com/"]);
    }

    #[test]
    fn parse_hosts_rejects_empty() {
        assert!(AuthorityConfig::parse_hosts("").is_err());
        assert!(AuthorityConfig::parse_hosts(" ; ").is_err());
    }

    #[test]
    fn builder_overrides() {
        let config = AuthorityConfig::new("http://localhost:3567".parse().unwrap())
            .with_timeout(Duration::from_millis(250))
            .with_base_path("/auth/")
            .with_api_key("secret");

        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.base_path(), "/auth");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }
}
