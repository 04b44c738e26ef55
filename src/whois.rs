use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WHOIS_PORT: u16 = 43;
const FALLBACK_SERVERS: [&str; 2] = ["whois.iana.org", "whois.internic.net"];
const MAX_RESPONSE_BYTES: u64 = 64 * 1024;

/// Creation date as reported by a registration lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateSource {
    Single(NaiveDate),
    /// Several candidate dates; the earliest parseable one wins.
    Candidates(Vec<DateSource>),
    /// Unparsed text straight from the registry.
    Raw(String),
}

impl DateSource {
    /// Earliest date this source yields, if any.
    pub fn earliest(&self) -> Option<NaiveDate> {
        match self {
            DateSource::Single(date) => Some(*date),
            DateSource::Candidates(candidates) => {
                candidates.iter().filter_map(DateSource::earliest).min()
            }
            DateSource::Raw(text) => parse_date(text),
        }
    }

    pub fn year(&self) -> Option<i32> {
        self.earliest().map(|date| date.year())
    }
}

/// Anything that can report when a domain was registered.
#[async_trait]
pub trait RegistrationLookup: Send + Sync {
    async fn creation_date(&self, domain: &str) -> Result<DateSource>;
}

/// Parse the date formats seen in WHOIS creation-date fields.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.date_naive());
    }
    if let Ok(parsed) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(parsed.date_naive());
    }

    const DATETIME_FORMATS: [&str; 3] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.date());
        }
    }

    const DATE_FORMATS: [&str; 8] = [
        "%Y-%m-%d", // 2024-10-10
        "%d-%b-%Y", // 10-oct-2024
        "%d-%m-%Y", // 10-10-2024
        "%d.%m.%Y", // 10.10.2024
        "%Y.%m.%d", // 2024.10.10
        "%Y/%m/%d", // 2024/10/10
        "%m/%d/%Y", // 10/10/2024
        "%d/%m/%Y", // 31/10/2024
    ];
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }

    // "1997-09-15 (registry time)" and similar trailing noise
    let first_token = text.split_whitespace().next()?;
    if first_token != text {
        return parse_date(first_token);
    }

    None
}

/// WHOIS client speaking the plain-text protocol on port 43.
#[derive(Debug, Clone)]
pub struct WhoisClient {
    timeout: Duration,
}

impl WhoisClient {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    /// Query the registry for `domain` and collect every creation-date line.
    pub async fn lookup(&self, domain: &str) -> Result<DateSource> {
        let bare = domain.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<IpAddr>().is_ok() {
            bail!("IP address {domain} has no registration record");
        }

        let root_domain = registrable_domain(&domain.to_lowercase());
        if !is_queryable(&root_domain) {
            bail!("Invalid domain format: {root_domain} (from: {domain})");
        }

        let server = whois_server(&root_domain);
        log::debug!("Using WHOIS server: {server} for domain: {root_domain}");

        match self.query_with_referral(server, &root_domain).await {
            Ok(text) => match creation_dates(&text) {
                Some(source) => return Ok(source),
                None => log::debug!(
                    "No creation date from {server} for {root_domain}: {}",
                    preview(&text)
                ),
            },
            Err(e) => log::debug!("WHOIS query to {server} failed: {e}"),
        }

        for fallback in FALLBACK_SERVERS {
            if fallback == server {
                continue;
            }
            log::debug!("Trying fallback WHOIS server: {fallback}");
            match self.query_with_referral(fallback, &root_domain).await {
                Ok(text) => {
                    if let Some(source) = creation_dates(&text) {
                        return Ok(source);
                    }
                }
                Err(e) => log::debug!("Fallback server {fallback} failed: {e}"),
            }
        }

        Err(anyhow!("No creation date found for {root_domain}"))
    }

    /// Query `server`, following a single `refer:` hop if the answer has no date.
    async fn query_with_referral(&self, server: &str, domain: &str) -> Result<String> {
        let text = self.query_server(server, domain).await?;
        if creation_dates(&text).is_some() {
            return Ok(text);
        }

        match referral(&text) {
            Some(next) if !next.eq_ignore_ascii_case(server) => {
                log::debug!("WHOIS server {server} refers {domain} to {next}");
                self.query_server(&next, domain).await
            }
            _ => Ok(text),
        }
    }

    async fn query_server(&self, server: &str, domain: &str) -> Result<String> {
        log::debug!("Connecting to WHOIS server: {server}:{WHOIS_PORT}");

        let mut stream =
            timeout(self.timeout, TcpStream::connect((server, WHOIS_PORT))).await??;

        stream
            .write_all(format!("{domain}\r\n").as_bytes())
            .await?;

        timeout(self.timeout, read_response(stream))
            .await?
            .map_err(|e| anyhow!("{e} from {server}"))
    }
}

/// Read a WHOIS answer, keeping at most `MAX_RESPONSE_BYTES`.
async fn read_response<R: AsyncRead + Unpin>(reader: R) -> Result<String> {
    let mut response = Vec::new();
    reader
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut response)
        .await?;

    if response.is_empty() {
        bail!("Empty WHOIS response");
    }

    Ok(String::from_utf8_lossy(&response).into_owned())
}

#[async_trait]
impl RegistrationLookup for WhoisClient {
    async fn creation_date(&self, domain: &str) -> Result<DateSource> {
        self.lookup(domain).await
    }
}

/// Strip sub-domains, keeping common two-label public suffixes intact.
/// e.g. "email.nationalgeographic.com" -> "nationalgeographic.com"
pub fn registrable_domain(domain: &str) -> String {
    const TWO_PART_SUFFIXES: [&str; 17] = [
        "co.uk", "com.au", "co.jp", "co.kr", "com.br", "co.za", "com.mx", "co.in", "com.sg",
        "co.nz", "com.ar", "co.il", "org.uk", "net.au", "gov.uk", "ac.uk", "edu.au",
    ];

    let domain = domain.trim_end_matches('.');
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return domain.to_string();
    }

    let suffix = labels[labels.len() - 2..].join(".");
    if labels.len() >= 3 && TWO_PART_SUFFIXES.contains(&suffix.as_str()) {
        return labels[labels.len() - 3..].join(".");
    }

    suffix
}

fn is_queryable(domain: &str) -> bool {
    !domain.is_empty()
        && domain.contains('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

fn whois_server(domain: &str) -> &'static str {
    let tld = domain.rsplit('.').next().unwrap_or(domain);
    match tld {
        "com" | "net" => "whois.verisign-grs.com",
        "org" => "whois.pir.org",
        "info" => "whois.afilias.net",
        "biz" => "whois.neulevel.biz",
        "us" => "whois.nic.us",
        "uk" => "whois.nic.uk",
        "de" => "whois.denic.de",
        "fr" => "whois.afnic.fr",
        "it" => "whois.nic.it",
        "nl" => "whois.domain-registry.nl",
        "au" => "whois.auda.org.au",
        "ca" => "whois.cira.ca",
        "jp" => "whois.jprs.jp",
        "cn" => "whois.cnnic.cn",
        "ru" => "whois.tcinet.ru",
        "br" => "whois.registro.br",
        "mx" => "whois.mx",
        "io" => "whois.nic.io",
        "site" => "whois.nic.site",
        _ => "whois.iana.org",
    }
}

fn creation_date_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?im)^[ \t]*(?:creation[ \t]*date|created(?:[ \t]*on)?|registered(?:[ \t]*on)?|domain[ \t]*created|registration[ \t]*(?:date|time)|domain_date_created|create_date|created_date|fecha[ \t]*de[ \t]*creaci[oó]n|date[ \t]*de[ \t]*cr[eé]ation|erstellt[ \t]*am)[ \t]*[:.]+[ \t]*([^\r\n]+)",
        )
        .expect("creation date pattern is valid")
    })
}

/// Collect every creation-date value in a WHOIS response.
pub fn creation_dates(text: &str) -> Option<DateSource> {
    let mut candidates: Vec<DateSource> = creation_date_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|value| DateSource::Raw(value.as_str().trim().to_string()))
        .collect();

    match candidates.len() {
        0 => None,
        1 => candidates.pop(),
        _ => Some(DateSource::Candidates(candidates)),
    }
}

fn referral(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim().to_lowercase();
        if key == "refer" || key == "whois" || key == "registrar whois server" {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_lowercase())
        } else {
            None
        }
    })
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(300) {
        Some((pos, _)) => format!("{}...", &text[..pos]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("1997-09-15"), Some(date(1997, 9, 15)));
        assert_eq!(parse_date("1997-09-15T04:00:00Z"), Some(date(1997, 9, 15)));
        assert_eq!(
            parse_date("2001-01-02T03:04:05.123456"),
            Some(date(2001, 1, 2))
        );
        assert_eq!(
            parse_date("2015-03-20T10:00:00+0000"),
            Some(date(2015, 3, 20))
        );
        assert_eq!(parse_date("2010-05-06 11:22:33"), Some(date(2010, 5, 6)));
        assert_eq!(parse_date("15-sep-1997"), Some(date(1997, 9, 15)));
        assert_eq!(parse_date("10.10.2024"), Some(date(2024, 10, 10)));
        assert_eq!(parse_date("2008/07/01"), Some(date(2008, 7, 1)));
        assert_eq!(parse_date("1999-12-31 (UTC)"), Some(date(1999, 12, 31)));
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("yes"), None);
        assert_eq!(parse_date("before 1995"), None);
        assert_eq!(parse_date("2024-13-45"), None);
    }

    #[test]
    fn test_date_source_earliest() {
        let single = DateSource::Single(date(2003, 4, 5));
        assert_eq!(single.year(), Some(2003));

        let candidates = DateSource::Candidates(vec![
            DateSource::Raw("garbage".to_string()),
            DateSource::Raw("2019-01-01T00:00:00Z".to_string()),
            DateSource::Single(date(2011, 6, 1)),
        ]);
        assert_eq!(candidates.earliest(), Some(date(2011, 6, 1)));

        let nothing = DateSource::Candidates(vec![DateSource::Raw("n/a".to_string())]);
        assert_eq!(nothing.year(), None);
        assert_eq!(DateSource::Candidates(Vec::new()).year(), None);
    }

    #[test]
    fn test_creation_dates_from_whois_text() {
        let text = "   Domain Name: EXAMPLE.COM\r\n\
                    \x20  Registry Domain ID: 2336799_DOMAIN_COM-VRSN\r\n\
                    \x20  Updated Date: 2024-08-14T07:01:34Z\r\n\
                    \x20  Creation Date: 1995-08-14T04:00:00Z\r\n\
                    \x20  Registry Expiry Date: 2025-08-13T04:00:00Z\r\n";

        let source = creation_dates(text).unwrap();
        assert_eq!(source, DateSource::Raw("1995-08-14T04:00:00Z".to_string()));
        assert_eq!(source.year(), Some(1995));
    }

    #[test]
    fn test_creation_dates_multiple_candidates() {
        let text = "created: 2012-01-01\nRegistrar Registration Expiration Date: 2030-01-01\ncreated: 2005-05-05\n";

        let source = creation_dates(text).unwrap();
        assert!(matches!(source, DateSource::Candidates(ref c) if c.len() == 2));
        assert_eq!(source.year(), Some(2005));
    }

    #[test]
    fn test_creation_dates_missing() {
        assert_eq!(creation_dates("No match for \"NOPE.COM\".\r\n"), None);
    }

    #[test]
    fn test_referral() {
        let iana = "% IANA WHOIS server\n\nrefer:        whois.nic.io\n\ndomain:       IO\n";
        assert_eq!(referral(iana), Some("whois.nic.io".to_string()));
        assert_eq!(referral("domain: example.com\n"), None);
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("example.com"), "example.com");
        assert_eq!(
            registrable_domain("email.nationalgeographic.com"),
            "nationalgeographic.com"
        );
        assert_eq!(registrable_domain("mail.example.co.uk"), "example.co.uk");
        assert_eq!(registrable_domain("test.company.com.au"), "company.com.au");
        assert_eq!(registrable_domain("example.com."), "example.com");
        assert_eq!(registrable_domain("single"), "single");
    }

    #[test]
    fn test_whois_server_selection() {
        assert_eq!(whois_server("example.com"), "whois.verisign-grs.com");
        assert_eq!(whois_server("example.org"), "whois.pir.org");
        assert_eq!(whois_server("example.zz"), "whois.iana.org");
    }

    #[tokio::test]
    async fn test_invalid_domain_fails_without_network() {
        let client = WhoisClient::new(1);

        assert!(client.lookup("localhost").await.is_err());
        assert!(client.lookup("bad_domain!.com").await.is_err());
    }

    #[tokio::test]
    async fn test_ip_literals_are_not_queried() {
        let client = WhoisClient::new(1);

        for host in ["93.184.216.34", "[::1]", "2001:db8::1", "10.0.0.1"] {
            let err = client.lookup(host).await.unwrap_err();
            assert!(err.to_string().contains("IP address"), "{host}: {err}");
        }
    }

    #[tokio::test]
    async fn test_read_response_is_capped() {
        let oversized = vec![b'x'; 200 * 1024];
        let text = read_response(oversized.as_slice()).await.unwrap();
        assert_eq!(text.len(), MAX_RESPONSE_BYTES as usize);

        let short = b"Creation Date: 1995-08-14\r\n".as_slice();
        assert_eq!(
            read_response(short).await.unwrap(),
            "Creation Date: 1995-08-14\r\n"
        );

        assert!(read_response(&b""[..]).await.is_err());
    }
}
