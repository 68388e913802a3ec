pub mod domain;
pub mod ingest;
pub mod recommend;
pub mod service;
pub mod storage;

pub mod config {
    use anyhow::Context;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub ratings_api_base_url: Option<String>,
        pub ratings_api_token: Option<String>,
        pub enrichment_api_base_url: Option<String>,
        pub enrichment_api_token: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                ratings_api_base_url: std::env::var("RATINGS_API_BASE_URL").ok(),
                ratings_api_token: std::env::var("RATINGS_API_TOKEN").ok(),
                enrichment_api_base_url: std::env::var("ENRICHMENT_API_BASE_URL").ok(),
                enrichment_api_token: std::env::var("ENRICHMENT_API_TOKEN").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_ratings_api_base_url(&self) -> anyhow::Result<&str> {
            self.ratings_api_base_url
                .as_deref()
                .context("RATINGS_API_BASE_URL is required")
        }

        pub fn require_ratings_api_token(&self) -> anyhow::Result<&str> {
            self.ratings_api_token
                .as_deref()
                .context("RATINGS_API_TOKEN is required")
        }

        pub fn require_enrichment_api_base_url(&self) -> anyhow::Result<&str> {
            self.enrichment_api_base_url
                .as_deref()
                .context("ENRICHMENT_API_BASE_URL is required")
        }
    }

    /// Reads a numeric tunable, falling back to `default` when unset or unparsable.
    pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }

    pub fn env_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
        std::env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
    }
}
