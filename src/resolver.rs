use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::Client;
use std::error::Error as StdError;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MAX_REDIRECTS: usize = 20;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; URLValidator/1.0)";

/// Final destination of a URL and the hops taken to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub final_url: String,
    /// URLs that answered with a redirect, in traversal order.
    pub redirect_chain: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("exceeded {limit} redirects")]
    TooManyRedirects { limit: usize },
    #[error("destination unreachable: {0}")]
    Unreachable(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Follows redirects for a submitted URL.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Resolution, ResolveError>;
}

pub struct UrlResolver {
    client: Client,
    max_redirects: usize,
    timeout: Duration,
}

impl UrlResolver {
    pub fn new(
        max_redirects: usize,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            max_redirects,
            timeout,
        })
    }

    /// Resolve a (possibly shortened) URL to its final destination.
    /// The whole traversal shares one time budget and is never retried.
    pub async fn resolve_url(&self, url: &str) -> Result<Resolution, ResolveError> {
        match tokio::time::timeout(self.timeout, self.follow(url)).await {
            Ok(result) => result,
            Err(_) => Err(ResolveError::Timeout(self.timeout)),
        }
    }

    async fn follow(&self, url: &str) -> Result<Resolution, ResolveError> {
        let mut current = Url::parse(url.trim())
            .map_err(|e| ResolveError::Request(format!("invalid URL '{url}': {e}")))?;
        if !matches!(current.scheme(), "http" | "https") {
            return Err(ResolveError::Request(format!(
                "unsupported URL scheme '{}'",
                current.scheme()
            )));
        }

        let mut redirect_chain = Vec::new();

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| self.classify(e))?;

            let status = response.status();
            if !status.is_redirection() {
                log::debug!("Resolved {url} -> {current} ({status})");
                return Ok(Resolution {
                    final_url: current.to_string(),
                    redirect_chain,
                });
            }

            let next = match next_location(&current, response.headers().get(LOCATION)) {
                Some(next) => next,
                None => {
                    log::debug!("{status} from {current} without usable Location, stopping");
                    return Ok(Resolution {
                        final_url: current.to_string(),
                        redirect_chain,
                    });
                }
            };

            if redirect_chain.len() >= self.max_redirects {
                log::warn!("Redirect limit {} exceeded for {url}", self.max_redirects);
                return Err(ResolveError::TooManyRedirects {
                    limit: self.max_redirects,
                });
            }

            log::debug!(
                "Following redirect {}: {current} -> {next}",
                redirect_chain.len() + 1
            );
            redirect_chain.push(current.to_string());
            current = next;
        }
    }

    fn classify(&self, error: reqwest::Error) -> ResolveError {
        if error.is_timeout() {
            ResolveError::Timeout(self.timeout)
        } else if error.is_redirect() {
            ResolveError::TooManyRedirects {
                limit: self.max_redirects,
            }
        } else if error.is_connect() {
            ResolveError::Unreachable(error_chain(&error))
        } else {
            ResolveError::Request(error_chain(&error))
        }
    }
}

#[async_trait]
impl Resolve for UrlResolver {
    async fn resolve(&self, url: &str) -> Result<Resolution, ResolveError> {
        self.resolve_url(url).await
    }
}

/// Resolve a Location header against the URL that returned it.
fn next_location(current: &Url, location: Option<&reqwest::header::HeaderValue>) -> Option<Url> {
    let location = location?.to_str().ok()?.trim();
    if location.is_empty() {
        return None;
    }
    current.join(location).ok()
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Lowercase host of a URL.
pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()?
        .host_str()
        .map(|h| h.trim_end_matches('.').to_lowercase())
}
