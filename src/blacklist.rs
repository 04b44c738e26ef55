use url::Url;

/// Matches the host of a URL against a fixed set of known-bad domains.
#[derive(Debug, Clone)]
pub struct BlacklistFilter {
    domains: Vec<String>,
}

impl BlacklistFilter {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| canonical_host(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();

        Self { domains }
    }

    /// Check whether the host of `url` is blacklisted.
    /// URLs without a parseable host are never blacklisted.
    pub fn check(&self, url: &str) -> bool {
        match Url::parse(url.trim()) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => self.check_host(host),
                None => false,
            },
            Err(e) => {
                log::debug!("Blacklist check skipped, unparseable URL {url}: {e}");
                false
            }
        }
    }

    /// Check a bare host. Matches the domain itself and any of its sub-domains.
    pub fn check_host(&self, host: &str) -> bool {
        let host = canonical_host(host);
        if host.is_empty() {
            return false;
        }

        let matched = matches_domain_list(&host, &self.domains);
        if matched {
            log::info!("Host {host} matches blacklist");
        }
        matched
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }
}

/// Lowercase and strip the trailing root dot.
fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

/// Label-boundary match: `a.example.com` matches `example.com`,
/// `notexample.com` does not.
pub fn matches_domain_list(host: &str, domain_list: &[String]) -> bool {
    domain_list.iter().any(|domain| {
        host == domain
            || host
                .strip_suffix(domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    })
}
