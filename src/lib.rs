pub mod blacklist;
pub mod cache;
pub mod config;
pub mod reputation;
pub mod resolver;
pub mod score;
pub mod server;
pub mod validator;
pub mod whois;

pub use blacklist::BlacklistFilter;
pub use cache::{CacheStore, JsonFileStore, MemoryStore, ValidationCache};
pub use config::Config;
pub use reputation::{Reputation, ReputationEngine};
pub use resolver::{Resolution, Resolve, ResolveError, UrlResolver};
pub use score::ScoringPolicy;
pub use validator::{ExpandError, ValidationResult, Validator};
pub use whois::{DateSource, RegistrationLookup, WhoisClient};
