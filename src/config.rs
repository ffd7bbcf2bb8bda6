use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::cache::{blobstore::S3Settings, drain::DrainSettings, eviction::EvictionSettings};

/// Centralized application configuration.
/// Environment variables (`OD_*`) with CLI flags layered on top.
///
/// Holds the master key, so log [`AppConfig::summary`] rather than `Debug`.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub cache_root: PathBuf,
    pub cache_partition: String,
    pub eviction: EvictionSettings,
    pub drain_workers: usize,
    /// `None` keeps ciphertext in an in-process store.
    pub s3: Option<S3Settings>,
    pub aac_url: String,
    pub aac_timeout: Duration,
    pub aac_retries: u32,
    pub aac_snippet_cache: bool,
    pub master_key: String,
    pub standalone: bool,
}

/// Command-line configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Encrypted multi-tenant object drive")]
pub struct Args {
    /// Host to bind to (overrides OD_SERVER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OD_SERVER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides OD_DB_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Cache root directory (overrides OD_CACHE_ROOT)
    #[arg(long)]
    pub cache_root: Option<PathBuf>,

    /// Use the built-in authorization service (overrides OD_STANDALONE)
    #[arg(long)]
    pub standalone: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{value}`")),
        _ => Ok(default),
    }
}

fn text<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over values returned by `lookup`.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let standalone = args.standalone || parsed(&lookup, "OD_STANDALONE", false)?;

        let defaults = EvictionSettings::default();
        let eviction = EvictionSettings {
            low_watermark: parsed(&lookup, "OD_CACHE_LOWWATERMARK", defaults.low_watermark)?,
            high_watermark: parsed(&lookup, "OD_CACHE_HIGHWATERMARK", defaults.high_watermark)?,
            age_eligible: Duration::from_secs(parsed(
                &lookup,
                "OD_CACHE_EVICTAGE",
                defaults.age_eligible.as_secs(),
            )?),
            walk_sleep: Duration::from_secs(parsed(
                &lookup,
                "OD_CACHE_WALKSLEEP",
                defaults.walk_sleep.as_secs(),
            )?),
        };
        if !(0.0..=1.0).contains(&eviction.low_watermark)
            || !(0.0..=1.0).contains(&eviction.high_watermark)
            || eviction.low_watermark > eviction.high_watermark
        {
            bail!(
                "cache watermarks must satisfy 0 <= low ({}) <= high ({}) <= 1",
                eviction.low_watermark,
                eviction.high_watermark
            );
        }

        let s3 = optional(&lookup, "OD_AWS_S3_BUCKET").map(|bucket| S3Settings {
            endpoint: optional(&lookup, "OD_AWS_S3_ENDPOINT"),
            region: text(&lookup, "OD_AWS_REGION", "us-east-1"),
            bucket,
            access_key_id: optional(&lookup, "OD_AWS_ACCESS_KEY_ID"),
            secret_access_key: optional(&lookup, "OD_AWS_SECRET_ACCESS_KEY"),
        });

        let aac_url = text(&lookup, "OD_AAC_URL", "");
        if !standalone && aac_url.is_empty() {
            bail!("OD_AAC_URL is required unless OD_STANDALONE=true");
        }

        let master_key = optional(&lookup, "OD_ENCRYPT_MASTERKEY")
            .context("OD_ENCRYPT_MASTERKEY is required")?;

        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| text(&lookup, "OD_SERVER_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => parsed(&lookup, "OD_SERVER_PORT", 4430)?,
            },
            database_url: args
                .database_url
                .unwrap_or_else(|| text(&lookup, "OD_DB_URL", "sqlite://./data/meta/object_drive.db")),
            db_max_connections: parsed(&lookup, "OD_DB_MAXCONNECTIONS", 10)?,
            cache_root: args
                .cache_root
                .unwrap_or_else(|| PathBuf::from(text(&lookup, "OD_CACHE_ROOT", "./data/cache"))),
            cache_partition: text(&lookup, "OD_CACHE_PARTITION", "cache"),
            eviction,
            drain_workers: parsed(&lookup, "OD_DRAIN_WORKERS", DrainSettings::default().workers)?,
            s3,
            aac_url,
            aac_timeout: Duration::from_secs(parsed(&lookup, "OD_AAC_TIMEOUT", 10)?),
            aac_retries: parsed(&lookup, "OD_AAC_RETRIES", 3)?,
            aac_snippet_cache: parsed(&lookup, "OD_AAC_SNIPPET_CACHE", true)?,
            master_key,
            standalone,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directory holding ciphertext files.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root.join(&self.cache_partition)
    }

    pub fn drain_settings(&self) -> DrainSettings {
        DrainSettings {
            workers: self.drain_workers,
            ..DrainSettings::default()
        }
    }

    /// One-line summary for the startup log, without secrets.
    pub fn summary(&self) -> String {
        format!(
            "addr={} db={} cache={} blobstore={} aac={} standalone={}",
            self.addr(),
            self.database_url,
            self.cache_dir().display(),
            self.s3.as_ref().map_or("memory", |s| s.bucket.as_str()),
            if self.standalone { "builtin" } else { self.aac_url.as_str() },
            self.standalone,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)], args: Args) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_sources(args, move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_in_standalone_mode() {
        let cfg = from(
            &[("OD_STANDALONE", "true"), ("OD_ENCRYPT_MASTERKEY", "otterpaws")],
            Args::default(),
        )
        .unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:4430");
        assert!(cfg.s3.is_none());
        assert!(cfg.aac_snippet_cache);
        assert_eq!(cfg.aac_retries, 3);
        assert_eq!(cfg.cache_dir(), PathBuf::from("./data/cache/cache"));
        assert!(!cfg.summary().contains("otterpaws"));
    }

    #[test]
    fn test_args_override_env() {
        let args = Args {
            port: Some(9000),
            host: Some("127.0.0.1".into()),
            ..Args::default()
        };
        let cfg = from(
            &[
                ("OD_SERVER_PORT", "8080"),
                ("OD_AAC_URL", "http://aac:9093"),
                ("OD_ENCRYPT_MASTERKEY", "k"),
                ("OD_AWS_S3_BUCKET", "drive"),
                ("OD_AAC_SNIPPET_CACHE", "false"),
            ],
            args,
        )
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.s3.as_ref().unwrap().bucket, "drive");
        assert_eq!(cfg.s3.as_ref().unwrap().region, "us-east-1");
        assert!(!cfg.aac_snippet_cache);
        assert!(!cfg.standalone);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = from(
            &[("OD_STANDALONE", "true"), ("OD_ENCRYPT_MASTERKEY", "k"), ("OD_SERVER_PORT", "http")],
            Args::default(),
        )
        .err().unwrap();
        assert!(err.to_string().contains("OD_SERVER_PORT"));

        assert!(from(&[("OD_STANDALONE", "true")], Args::default()).is_err());
        assert!(from(&[("OD_ENCRYPT_MASTERKEY", "k")], Args::default()).is_err());
        assert!(
            from(
                &[
                    ("OD_STANDALONE", "true"),
                    ("OD_ENCRYPT_MASTERKEY", "k"),
                    ("OD_CACHE_LOWWATERMARK", "0.9"),
                    ("OD_CACHE_HIGHWATERMARK", "0.5"),
                ],
                Args::default(),
            )
            .is_err()
        );
    }
}
