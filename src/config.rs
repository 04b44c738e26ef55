use crate::reputation::AgeThreshold;
use crate::resolver::{DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT_SECONDS, DEFAULT_USER_AGENT};
use crate::score::ScoringPolicy;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Upper bound for `reputation.min_domain_age_years`.
pub const MAX_DOMAIN_AGE_YEARS: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub resolver: ResolverConfig,
    pub blacklist: BlacklistConfig,
    pub reputation: ReputationConfig,
    pub cache: CacheConfig,
    pub scoring: ScoringPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub max_redirects: usize,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub domains: Vec<String>,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            domains: vec![
                "phishing.com".to_string(),
                "scam-site.org".to_string(),
                "malicious.site".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Domains that are always `good` (compared without a leading `www.`).
    pub trusted_domains: Vec<String>,
    /// Domains registered more than this many years ago are `good`.
    pub min_domain_age_years: u32,
    /// Pin the cutoff to a calendar year instead of counting back from now.
    pub threshold_year: Option<i32>,
    pub lookup_timeout_seconds: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            trusted_domains: [
                "youtube.com",
                "google.com",
                "openai.com",
                "github.com",
                "microsoft.com",
                "apple.com",
                "linkedin.com",
                "stackoverflow.com",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
            min_domain_age_years: 3,
            threshold_year: None,
            lookup_timeout_seconds: 10,
        }
    }
}

impl ReputationConfig {
    pub fn age_threshold(&self) -> AgeThreshold {
        match self.threshold_year {
            Some(year) => AgeThreshold::Year(year),
            None => AgeThreshold::YearsBeforeNow(self.min_domain_age_years),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: "data/urls.json".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))
    }

    /// Check values that would otherwise only fail at request time.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;

        if self.resolver.max_redirects == 0 {
            bail!("resolver.max_redirects must be greater than 0");
        }
        if self.resolver.timeout_seconds == 0 {
            bail!("resolver.timeout_seconds must be greater than 0");
        }
        if self.resolver.user_agent.trim().is_empty() {
            bail!("resolver.user_agent must not be empty");
        }
        if self.reputation.min_domain_age_years > MAX_DOMAIN_AGE_YEARS {
            bail!(
                "reputation.min_domain_age_years must be at most {MAX_DOMAIN_AGE_YEARS}, got {}",
                self.reputation.min_domain_age_years
            );
        }
        if self.reputation.lookup_timeout_seconds == 0 {
            bail!("reputation.lookup_timeout_seconds must be greater than 0");
        }
        if let Some(domain) = self
            .blacklist
            .domains
            .iter()
            .chain(&self.reputation.trusted_domains)
            .find(|d| d.trim().is_empty())
        {
            bail!("empty domain entry in configuration: {domain:?}");
        }
        if self.cache.path.trim().is_empty() {
            bail!("cache.path must not be empty");
        }

        Ok(())
    }
}
