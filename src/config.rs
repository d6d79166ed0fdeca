use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::str::FromStr;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub hot_dir: String,
    pub archive_dir: String,
    pub database_url: String,
    pub ingest_timeout_secs: u64,
    pub replication_timeout_secs: u64,
    pub replication_max_attempts: u32,
    pub replication_backoff_ms: u64,
    pub auto_replicate: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Dual-tier digital preservation store")]
pub struct Args {
    /// Host to bind to (overrides PRESERVE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PRESERVE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Hot-tier storage directory (overrides PRESERVE_HOT_DIR)
    #[arg(long)]
    pub hot_dir: Option<String>,

    /// Archive-tier storage directory (overrides PRESERVE_ARCHIVE_DIR)
    #[arg(long)]
    pub archive_dir: Option<String>,

    /// Database URL (overrides PRESERVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Replicate automatically once an artifact reaches Stored
    #[arg(long)]
    pub auto_replicate: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn parse_env_value<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("parsing {} value `{}`", name, value))
}

/// Read a numeric environment variable, parsed at its target width so an
/// out-of-range value is a startup error rather than a silent wrap.
fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => parse_env_value(name, &value),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("PRESERVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("PRESERVE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing PRESERVE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading PRESERVE_PORT"),
        };
        let env_hot = env::var("PRESERVE_HOT_DIR").unwrap_or_else(|_| "./data/hot".into());
        let env_archive =
            env::var("PRESERVE_ARCHIVE_DIR").unwrap_or_else(|_| "./data/archive".into());
        let env_db = env::var("PRESERVE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/preservation.db".into());
        let auto_replicate = args.auto_replicate
            || env::var("PRESERVE_AUTO_REPLICATE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            hot_dir: args.hot_dir.unwrap_or(env_hot),
            archive_dir: args.archive_dir.unwrap_or(env_archive),
            database_url: args.database_url.unwrap_or(env_db),
            ingest_timeout_secs: env_parsed("PRESERVE_INGEST_TIMEOUT_SECS", 3600u64)?,
            replication_timeout_secs: env_parsed("PRESERVE_REPLICATION_TIMEOUT_SECS", 3600u64)?,
            replication_max_attempts: env_parsed("PRESERVE_REPLICATION_MAX_ATTEMPTS", 5u32)?,
            replication_backoff_ms: env_parsed("PRESERVE_REPLICATION_BACKOFF_MS", 500u64)?,
            auto_replicate,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_parse_at_their_target_width() {
        assert_eq!(
            parse_env_value::<u32>("PRESERVE_REPLICATION_MAX_ATTEMPTS", "7").unwrap(),
            7
        );
        assert_eq!(
            parse_env_value::<u64>("PRESERVE_INGEST_TIMEOUT_SECS", "3600").unwrap(),
            3600
        );
    }

    #[test]
    fn out_of_range_max_attempts_is_an_error_not_a_wrap() {
        // 2^32 would silently truncate under an `as u32` cast.
        let err = parse_env_value::<u32>("PRESERVE_REPLICATION_MAX_ATTEMPTS", "4294967296")
            .unwrap_err();
        assert!(err.to_string().contains("PRESERVE_REPLICATION_MAX_ATTEMPTS"));
    }

    #[test]
    fn garbage_numeric_value_is_an_error() {
        assert!(parse_env_value::<u64>("PRESERVE_REPLICATION_BACKOFF_MS", "soon").is_err());
    }
}
