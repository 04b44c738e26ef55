use crate::whois::RegistrationLookup;
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Two-valued domain reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reputation {
    Good,
    Unknown,
}

impl fmt::Display for Reputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reputation::Good => write!(f, "good"),
            Reputation::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a single reputation check. Not cached on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationRecord {
    pub reputation: Reputation,
}

/// Where the registration-age cutoff comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeThreshold {
    /// Domains registered more than this many years before the current year.
    YearsBeforeNow(u32),
    /// Domains registered before this calendar year.
    Year(i32),
}

impl AgeThreshold {
    pub fn cutoff_year(&self) -> i32 {
        match *self {
            AgeThreshold::YearsBeforeNow(years) => Utc::now()
                .year()
                .saturating_sub(i32::try_from(years).unwrap_or(i32::MAX)),
            AgeThreshold::Year(year) => year,
        }
    }
}

/// Lowercase and drop one leading `www.` label.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

/// Classifies hosts as `good` (allow-listed or old enough) or `unknown`.
pub struct ReputationEngine {
    trusted_domains: HashSet<String>,
    threshold: AgeThreshold,
    lookup: Arc<dyn RegistrationLookup>,
    lookup_timeout: Duration,
}

impl ReputationEngine {
    pub fn new<I, S>(
        trusted_domains: I,
        threshold: AgeThreshold,
        lookup: Arc<dyn RegistrationLookup>,
        lookup_timeout: Duration,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            trusted_domains: trusted_domains
                .into_iter()
                .map(|d| normalize_host(d.as_ref()))
                .collect(),
            threshold,
            lookup,
            lookup_timeout,
        }
    }

    pub fn is_trusted(&self, host: &str) -> bool {
        self.trusted_domains.contains(&normalize_host(host))
    }

    /// Classify `host`. Lookup failures of any kind yield `Unknown`.
    pub async fn check(&self, host: &str) -> ReputationRecord {
        let domain = normalize_host(host);

        if self.trusted_domains.contains(&domain) {
            log::debug!("{domain} is allow-listed");
            return ReputationRecord {
                reputation: Reputation::Good,
            };
        }

        let reputation = match self.registration_year(&domain).await {
            Some(year) => {
                let cutoff = self.threshold.cutoff_year();
                log::debug!("{domain} registered in {year} (cutoff: before {cutoff})");
                if year < cutoff {
                    Reputation::Good
                } else {
                    Reputation::Unknown
                }
            }
            None => Reputation::Unknown,
        };

        ReputationRecord { reputation }
    }

    pub async fn reputation(&self, host: &str) -> Reputation {
        self.check(host).await.reputation
    }

    async fn registration_year(&self, domain: &str) -> Option<i32> {
        if domain.is_empty() {
            return None;
        }

        match tokio::time::timeout(self.lookup_timeout, self.lookup.creation_date(domain)).await
        {
            Ok(Ok(source)) => {
                let year = source.year();
                if year.is_none() {
                    log::warn!("Registration lookup for {domain} returned no parseable date");
                }
                year
            }
            Ok(Err(e)) => {
                log::warn!("Registration lookup failed for {domain}: {e}");
                None
            }
            Err(_) => {
                log::warn!(
                    "Registration lookup for {domain} timed out after {:?}",
                    self.lookup_timeout
                );
                None
            }
        }
    }
}
