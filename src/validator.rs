use crate::blacklist::BlacklistFilter;
use crate::cache::{JsonFileStore, ValidationCache};
use crate::config::Config;
use crate::reputation::{Reputation, ReputationEngine};
use crate::resolver::{extract_host, Resolution, Resolve, ResolveError, UrlResolver};
use crate::score::ScoringPolicy;
use crate::whois::WhoisClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of validating one submitted URL. This is also the cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub original_url: String,
    pub final_url: String,
    #[serde(default)]
    pub redirect_chain: Vec<String>,
    pub blacklisted: bool,
    pub reputation: Reputation,
    pub confidence_score: u8,
    /// Set only on responses served from the cache; never persisted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

impl ValidationResult {
    fn served_from_cache(self) -> Self {
        Self {
            cached: true,
            ..self
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("No URL provided")]
    MissingUrl,
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("unexpected failure: {0}")]
    Internal(String),
}

impl ExpandError {
    /// HTTP status the front end answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            ExpandError::MissingUrl => 400,
            ExpandError::Resolve(ResolveError::Timeout(_)) => 504,
            ExpandError::Resolve(ResolveError::TooManyRedirects { .. }) => 400,
            ExpandError::Resolve(ResolveError::Unreachable(_)) => 502,
            ExpandError::Resolve(ResolveError::Request(_)) => 500,
            ExpandError::Internal(_) => 500,
        }
    }

    /// Process exit code for one-shot validation from the command line.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExpandError::MissingUrl => 2,
            ExpandError::Resolve(ResolveError::Timeout(_)) => 3,
            ExpandError::Resolve(ResolveError::TooManyRedirects { .. }) => 4,
            ExpandError::Resolve(ResolveError::Unreachable(_)) => 5,
            ExpandError::Resolve(ResolveError::Request(_)) | ExpandError::Internal(_) => 1,
        }
    }

    /// Message shown to the person who submitted the link.
    pub fn user_message(&self) -> &'static str {
        match self {
            ExpandError::MissingUrl => "No URL provided",
            ExpandError::Resolve(ResolveError::Timeout(_)) => {
                "The link took too long to load. It may be unsafe or broken."
            }
            ExpandError::Resolve(ResolveError::TooManyRedirects { .. }) => {
                "This link redirects too many times. It may be trying to hide something dangerous."
            }
            ExpandError::Resolve(ResolveError::Unreachable(_)) => {
                "The destination website could not be reached. This link may be fake, expired, or malicious."
            }
            ExpandError::Resolve(ResolveError::Request(_)) => {
                "URL expansion failed. We could not validate this link. It may be unsafe."
            }
            ExpandError::Internal(_) => "An unexpected error occurred while validating the link.",
        }
    }

    /// Diagnostic detail, absent for input errors.
    pub fn details(&self) -> Option<String> {
        match self {
            ExpandError::MissingUrl => None,
            ExpandError::Resolve(e) => Some(e.to_string()),
            ExpandError::Internal(detail) => Some(detail.clone()),
        }
    }
}

/// Resolve, classify, score and memoize submitted URLs.
pub struct Validator {
    resolver: Arc<dyn Resolve>,
    blacklist: BlacklistFilter,
    reputation: ReputationEngine,
    scoring: ScoringPolicy,
    cache: Arc<ValidationCache>,
}

impl Validator {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        blacklist: BlacklistFilter,
        reputation: ReputationEngine,
        scoring: ScoringPolicy,
        cache: Arc<ValidationCache>,
    ) -> Self {
        Self {
            resolver,
            blacklist,
            reputation,
            scoring,
            cache,
        }
    }

    /// Wire up the network resolver, WHOIS lookup and JSON file cache.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resolver = UrlResolver::new(
            config.resolver.max_redirects,
            Duration::from_secs(config.resolver.timeout_seconds),
            &config.resolver.user_agent,
        )?;

        let lookup_timeout = Duration::from_secs(config.reputation.lookup_timeout_seconds);
        let reputation = ReputationEngine::new(
            &config.reputation.trusted_domains,
            config.reputation.age_threshold(),
            Arc::new(WhoisClient::new(config.reputation.lookup_timeout_seconds)),
            lookup_timeout,
        );

        let store = Arc::new(JsonFileStore::open(&config.cache.path));
        log::info!("Using validation cache at {}", store.path().display());
        let cache = Arc::new(ValidationCache::open(store));

        Ok(Self::new(
            Arc::new(resolver),
            BlacklistFilter::new(&config.blacklist.domains),
            reputation,
            config.scoring,
            cache,
        ))
    }

    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }

    /// Validate a submitted URL. Cache hits skip all network work.
    pub async fn expand(&self, url: Option<&str>) -> Result<ValidationResult, ExpandError> {
        let key = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ExpandError::MissingUrl)?;

        if let Some(hit) = self.cache.get(key).await {
            log::debug!("Cache hit for {key}");
            return Ok(hit.served_from_cache());
        }

        let _guard = self.cache.lock_key(key).await;
        if let Some(hit) = self.cache.get(key).await {
            log::debug!("Cache filled for {key} while waiting");
            return Ok(hit.served_from_cache());
        }

        log::debug!("Cache miss for {key}, resolving");
        let resolution = self.resolver.resolve(key).await.map_err(|e| {
            log::info!("Could not resolve {key}: {e}");
            ExpandError::from(e)
        })?;

        let result = self.evaluate(key, resolution).await;
        self.cache.put(key, result.clone()).await;

        log::info!(
            "Validated {key} -> {} (blacklisted: {}, reputation: {}, score: {})",
            result.final_url,
            result.blacklisted,
            result.reputation,
            result.confidence_score
        );
        Ok(result)
    }

    /// Classify and score an already-resolved URL.
    pub async fn evaluate(&self, original_url: &str, resolution: Resolution) -> ValidationResult {
        let blacklisted = self.blacklist.check(&resolution.final_url);
        let reputation = match extract_host(&resolution.final_url) {
            Some(host) => self.reputation.reputation(&host).await,
            None => Reputation::Unknown,
        };

        ValidationResult {
            original_url: original_url.to_string(),
            final_url: resolution.final_url,
            redirect_chain: resolution.redirect_chain,
            blacklisted,
            reputation,
            confidence_score: self.scoring.score(blacklisted, reputation),
            cached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntries, CacheStore, MemoryStore};
    use crate::reputation::AgeThreshold;
    use crate::whois::{DateSource, RegistrationLookup};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockResolver {
        routes: HashMap<String, Result<Resolution, fn() -> ResolveError>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl MockResolver {
        fn new() -> Self {
            Self {
                routes: HashMap::new(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn route(mut self, url: &str, final_url: &str, chain: &[&str]) -> Self {
            self.routes.insert(
                url.to_string(),
                Ok(Resolution {
                    final_url: final_url.to_string(),
                    redirect_chain: chain.iter().map(|s| s.to_string()).collect(),
                }),
            );
            self
        }

        fn failing(mut self, url: &str, error: fn() -> ResolveError) -> Self {
            self.routes.insert(url.to_string(), Err(error));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolve for MockResolver {
        async fn resolve(&self, url: &str) -> Result<Resolution, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.routes.get(url) {
                Some(Ok(resolution)) => Ok(resolution.clone()),
                Some(Err(make)) => Err(make()),
                None => Err(ResolveError::Request(format!("no route for {url}"))),
            }
        }
    }

    struct MockLookup {
        years: HashMap<String, i32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegistrationLookup for MockLookup {
        async fn creation_date(&self, domain: &str) -> anyhow::Result<DateSource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let year = self
                .years
                .get(domain)
                .ok_or_else(|| anyhow!("whois server refused connection"))?;
            Ok(DateSource::Single(NaiveDate::from_ymd_opt(*year, 1, 1).unwrap()))
        }
    }

    struct Fixture {
        validator: Arc<Validator>,
        resolver: Arc<MockResolver>,
        lookup: Arc<MockLookup>,
        store: Arc<MemoryStore>,
    }

    fn fixture(resolver: MockResolver) -> Fixture {
        let resolver = Arc::new(resolver);
        let lookup = Arc::new(MockLookup {
            years: HashMap::from([("old-news.example".to_string(), 1998)]),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let validator = build(resolver.clone(), lookup.clone(), store.clone());

        Fixture {
            validator: Arc::new(validator),
            resolver,
            lookup,
            store,
        }
    }

    fn build(
        resolver: Arc<MockResolver>,
        lookup: Arc<MockLookup>,
        store: Arc<dyn CacheStore>,
    ) -> Validator {
        let reputation = ReputationEngine::new(
            ["youtube.com", "google.com", "github.com"],
            AgeThreshold::Year(2022),
            lookup,
            Duration::from_secs(1),
        );
        Validator::new(
            resolver,
            BlacklistFilter::new(["phishing.com", "scam-site.org", "malicious.site"]),
            reputation,
            ScoringPolicy::Additive,
            Arc::new(ValidationCache::open(store)),
        )
    }

    #[tokio::test]
    async fn test_unknown_host_with_two_hops() {
        let f = fixture(MockResolver::new().route(
            "https://bit.ly/abc",
            "https://example.com/page",
            &["https://bit.ly/abc", "https://t.co/xyz"],
        ));

        let result = f.validator.expand(Some("https://bit.ly/abc")).await.unwrap();

        assert_eq!(result.original_url, "https://bit.ly/abc");
        assert_eq!(result.final_url, "https://example.com/page");
        assert_eq!(result.redirect_chain.len(), 2);
        assert!(!result.blacklisted);
        assert_eq!(result.reputation, Reputation::Unknown);
        assert_eq!(result.confidence_score, 80);
        assert!(!result.cached);
        assert_eq!(f.lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_destination() {
        let f = fixture(MockResolver::new().route(
            "http://short.phish",
            "http://phishing.com/fake-login",
            &["http://short.phish"],
        ));

        let result = f.validator.expand(Some("http://short.phish")).await.unwrap();

        assert!(result.blacklisted);
        assert_eq!(result.reputation, Reputation::Unknown);
        assert_eq!(result.confidence_score, 30);
    }

    #[tokio::test]
    async fn test_trusted_destination() {
        let f = fixture(MockResolver::new().route(
            "https://bit.ly/4lepK9e",
            "https://youtube.com/watch",
            &["https://bit.ly/4lepK9e"],
        ));

        let result = f.validator.expand(Some("https://bit.ly/4lepK9e")).await.unwrap();

        assert!(!result.blacklisted);
        assert_eq!(result.reputation, Reputation::Good);
        assert_eq!(result.confidence_score, 100);
        assert_eq!(f.lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_old_domain_from_lookup() {
        let f = fixture(MockResolver::new().route(
            "https://tinyurl.com/n",
            "https://www.old-news.example/story",
            &[],
        ));

        let result = f.validator.expand(Some("https://tinyurl.com/n")).await.unwrap();
        assert_eq!(result.reputation, Reputation::Good);
        assert_eq!(result.confidence_score, 100);
        assert!(result.redirect_chain.is_empty());
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let f = fixture(MockResolver::new().route(
            "https://bit.ly/abc",
            "https://example.com/page",
            &["https://bit.ly/abc"],
        ));

        let first = f.validator.expand(Some("https://bit.ly/abc")).await.unwrap();
        let second = f.validator.expand(Some("  https://bit.ly/abc\n")).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(
            ValidationResult {
                cached: false,
                ..second.clone()
            },
            first
        );
        assert_eq!(f.resolver.calls(), 1);
        assert_eq!(f.lookup.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.save_count(), 1);
        assert!(!f.store.snapshot()["https://bit.ly/abc"].cached);
    }

    #[tokio::test]
    async fn test_missing_url() {
        let f = fixture(MockResolver::new());

        for input in [None, Some(""), Some("   ")] {
            let err = f.validator.expand(input).await.unwrap_err();
            assert!(matches!(err, ExpandError::MissingUrl));
            assert_eq!(err.status_code(), 400);
            assert_eq!(err.to_string(), "No URL provided");
            assert_eq!(err.details(), None);
        }
        assert_eq!(f.resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolution_errors_map_to_status_codes() {
        let f = fixture(
            MockResolver::new()
                .failing("https://slow.example", || {
                    ResolveError::Timeout(Duration::from_secs(10))
                })
                .failing("https://loop.example", || ResolveError::TooManyRedirects {
                    limit: 20,
                })
                .failing("https://gone.example", || {
                    ResolveError::Unreachable("dns error".to_string())
                })
                .failing("https://odd.example", || {
                    ResolveError::Request("invalid header".to_string())
                }),
        );

        let cases = [
            ("https://slow.example", 504, 3),
            ("https://loop.example", 400, 4),
            ("https://gone.example", 502, 5),
            ("https://odd.example", 500, 1),
        ];
        for (url, status, exit) in cases {
            let err = f.validator.expand(Some(url)).await.unwrap_err();
            assert_eq!(err.status_code(), status, "{url}");
            assert_eq!(err.exit_code(), exit, "{url}");
            assert!(err.details().is_some());
        }

        assert!(f.validator.cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_resolution_is_not_cached() {
        let f = fixture(MockResolver::new().failing("https://gone.example", || {
            ResolveError::Unreachable("refused".to_string())
        }));

        assert!(f.validator.expand(Some("https://gone.example")).await.is_err());
        assert!(f.validator.expand(Some("https://gone.example")).await.is_err());
        assert_eq!(f.resolver.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_url_resolves_once() {
        let mut resolver = MockResolver::new().route(
            "https://bit.ly/hot",
            "https://example.com/page",
            &["https://bit.ly/hot"],
        );
        resolver.delay = Duration::from_millis(50);
        let f = fixture(resolver);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let validator = f.validator.clone();
            handles.push(tokio::spawn(async move {
                validator.expand(Some("https://bit.ly/hot")).await.unwrap()
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.confidence_score, 80);
            if !result.cached {
                fresh += 1;
            }
        }

        assert_eq!(fresh, 1);
        assert_eq!(f.resolver.calls(), 1);
        assert_eq!(f.store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_key_locks_released_after_each_request() {
        let mut resolver = MockResolver::new().route(
            "https://bit.ly/ok",
            "https://example.com/page",
            &["https://bit.ly/ok"],
        );
        for i in 0..100 {
            resolver = resolver.failing(&format!("https://gone.example/{i}"), || {
                ResolveError::Unreachable("refused".to_string())
            });
        }
        let f = fixture(resolver);

        for i in 0..100 {
            let url = format!("https://gone.example/{i}");
            assert!(f.validator.expand(Some(&url)).await.is_err());
        }
        for i in 0..100 {
            let url = format!("https://never-routed.example/{i}");
            assert!(f.validator.expand(Some(&url)).await.is_err());
        }
        f.validator.expand(Some("https://bit.ly/ok")).await.unwrap();
        f.validator.expand(Some("https://bit.ly/ok")).await.unwrap();

        assert_eq!(f.validator.cache().locked_keys(), 0);
        assert_eq!(f.validator.cache().len().await, 1);
    }

    struct ReadOnlyStore;

    impl CacheStore for ReadOnlyStore {
        fn load(&self) -> anyhow::Result<CacheEntries> {
            Ok(CacheEntries::new())
        }

        fn save(&self, _entries: &CacheEntries) -> anyhow::Result<()> {
            Err(anyhow!("read-only file system"))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_still_succeeds() {
        let resolver = Arc::new(MockResolver::new().route(
            "https://bit.ly/abc",
            "https://example.com/page",
            &["https://bit.ly/abc"],
        ));
        let lookup = Arc::new(MockLookup {
            years: HashMap::new(),
            calls: AtomicUsize::new(0),
        });
        let validator = build(resolver.clone(), lookup, Arc::new(ReadOnlyStore));

        let first = validator.expand(Some("https://bit.ly/abc")).await.unwrap();
        let second = validator.expand(Some("https://bit.ly/abc")).await.unwrap();

        assert!(!first.cached);
        assert_eq!(first.confidence_score, 80);
        assert!(second.cached);
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_entries_loaded_from_store_skip_resolution() {
        let resolver = Arc::new(MockResolver::new());
        let lookup = Arc::new(MockLookup {
            years: HashMap::new(),
            calls: AtomicUsize::new(0),
        });
        let seeded = ValidationResult {
            original_url: "https://bit.ly/old".to_string(),
            final_url: "https://github.com/".to_string(),
            redirect_chain: vec!["https://bit.ly/old".to_string()],
            blacklisted: false,
            reputation: Reputation::Good,
            confidence_score: 100,
            cached: false,
        };
        let store = Arc::new(MemoryStore::with_entries(CacheEntries::from([(
            "https://bit.ly/old".to_string(),
            seeded.clone(),
        )])));
        let validator = build(resolver.clone(), lookup.clone(), store);

        let hit = validator.expand(Some("https://bit.ly/old")).await.unwrap();

        assert!(hit.cached);
        assert_eq!(ValidationResult { cached: false, ..hit }, seeded);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_result_serialization() {
        let result = ValidationResult {
            original_url: "https://bit.ly/a".to_string(),
            final_url: "https://example.com/".to_string(),
            redirect_chain: vec!["https://bit.ly/a".to_string()],
            blacklisted: false,
            reputation: Reputation::Unknown,
            confidence_score: 80,
            cached: false,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["reputation"], "unknown");
        assert_eq!(json["confidence_score"], 80);
        assert!(json.get("cached").is_none());

        let cached = serde_json::to_value(result.served_from_cache()).unwrap();
        assert_eq!(cached["cached"], true);
    }
}
