#![allow(clippy::uninlined_format_args)]

use shorturl_validator::config::Config;
use shorturl_validator::whois::{registrable_domain, WhoisClient};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("Testing REAL WHOIS lookups (not mock data)...");

    let config = Config::default();
    let client = WhoisClient::new(config.reputation.lookup_timeout_seconds);
    let cutoff = config.reputation.age_threshold().cutoff_year();

    let mut domains: Vec<String> = std::env::args().skip(1).collect();
    if domains.is_empty() {
        domains = ["example.com", "wikipedia.org", "mail.example.co.uk", "bit.ly"]
            .iter()
            .map(|d| d.to_string())
            .collect();
    }

    for domain in domains {
        println!(
            "\n=== {} (root: {}, cutoff: before {}) ===",
            domain,
            registrable_domain(&domain),
            cutoff
        );

        let started = std::time::Instant::now();
        let lookup = tokio::time::timeout(Duration::from_secs(30), client.lookup(&domain)).await;
        match lookup {
            Ok(Ok(source)) => {
                println!("✅ Lookup succeeded in {:?}", started.elapsed());
                println!("  Raw: {:?}", source);
                match source.year() {
                    Some(year) if year < cutoff => println!("  Registered {} → good", year),
                    Some(year) => println!("  Registered {} → unknown", year),
                    None => println!("  No parseable creation date → unknown"),
                }
            }
            Ok(Err(e)) => {
                println!("❌ Lookup failed: {}", e);
                println!("  This could be due to:");
                println!("    - WHOIS server rate limits");
                println!("    - Network connectivity issues");
                println!("    - Domain doesn't exist");
            }
            Err(_) => println!("❌ Lookup timed out"),
        }
    }

    Ok(())
}
