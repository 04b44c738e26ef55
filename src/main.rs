use clap::{Arg, Command};
use log::LevelFilter;
use shorturl_validator::config::Config;
use shorturl_validator::server;
use shorturl_validator::validator::Validator;
use std::process;
use std::sync::Arc;
use tokio::sync::Notify;

#[tokio::main]
async fn main() {
    let matches = Command::new("shorturl-validator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Expand shortened URLs and score their final destination")
        .long_about(
            "Follows redirects of a submitted URL to its final destination, checks the \
             destination host against a blacklist and a domain reputation heuristic \
             (allow-list plus WHOIS registration age) and reports a 0-100 confidence score.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (built-in defaults when omitted)"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write the default configuration to FILE and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .value_name("URL")
                .help("Validate a single URL, print the result as JSON and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("forget")
                .long("forget")
                .value_name("URL")
                .help("Remove a URL from the result cache and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Address for the HTTP server, overrides server.listen")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        match Config::default().to_file(generate_path) {
            Ok(()) => println!("Default configuration written to: {generate_path}"),
            Err(e) => {
                eprintln!("Error writing configuration: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {e:#}");
                process::exit(1);
            }
        },
        None => {
            log::info!("No configuration file given, using defaults");
            Config::default()
        }
    };

    if let Some(listen) = matches.get_one::<String>("listen") {
        config.server.listen = listen.clone();
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        println!("Configuration is valid");
        println!("  Listen address: {}", config.server.listen);
        println!(
            "  Resolver: max {} redirects, {}s timeout",
            config.resolver.max_redirects, config.resolver.timeout_seconds
        );
        println!("  Blacklisted domains: {}", config.blacklist.domains.len());
        println!(
            "  Trusted domains: {}",
            config.reputation.trusted_domains.len()
        );
        println!(
            "  Registration cutoff: before {}",
            config.reputation.age_threshold().cutoff_year()
        );
        println!("  Scoring: {:?}", config.scoring);
        println!("  Cache file: {}", config.cache.path);
        return;
    }

    let validator = match Validator::from_config(&config) {
        Ok(validator) => Arc::new(validator),
        Err(e) => {
            eprintln!("Error initializing validator: {e:#}");
            process::exit(1);
        }
    };

    if let Some(url) = matches.get_one::<String>("forget") {
        let key = url.trim();
        if validator.cache().forget(key).await {
            println!("Removed cached result for {key}");
        } else {
            println!("No cached result for {key}");
        }
        return;
    }

    if let Some(url) = matches.get_one::<String>("check") {
        process::exit(check_url(&validator, url).await);
    }

    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{e:#}");
            process::exit(1);
        }
    };

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, stopping...");
        signal.notify_one();
    }) {
        log::warn!("Failed to install signal handler: {e}");
    }

    log::info!("Starting Shortened URL Validator");
    let result = server::serve(validator.clone(), addr, async move {
        shutdown.notified().await;
    })
    .await;

    if let Err(e) = validator.cache().close().await {
        log::error!("Failed to flush validation cache on shutdown: {e:#}");
    }

    if let Err(e) = result {
        log::error!("Server error: {e:#}");
        process::exit(1);
    }
}

async fn check_url(validator: &Validator, url: &str) -> i32 {
    match validator.expand(Some(url)).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => {
                eprintln!("Failed to serialize result: {e}");
                1
            }
        },
        Err(e) => {
            let body = serde_json::json!({
                "error": e.user_message(),
                "details": e.details(),
            });
            eprintln!("{body:#}");
            e.exit_code()
        }
    }
}
