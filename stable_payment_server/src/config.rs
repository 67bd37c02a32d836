//! Server configuration.
//!
//! Everything is read from `SPG_*` environment variables (with `.env`
//! support via `dotenvy` in `main`). Unset optional values fall back to the
//! defaults below; per-chain values use one variable per chain, e.g.
//! `SPG_CONFIRMATIONS_ARBITRUM=6` and
//! `SPG_PROVIDER_RPC_URL_ARBITRUM=https://arb1.example/rpc`.

use std::{collections::HashMap, env, time::Duration};

use log::*;
use spg_common::Secret;
use stable_payment_engine::db_types::Chain;

const DEFAULT_SPG_HOST: &str = "127.0.0.1";
const DEFAULT_SPG_PORT: u16 = 8360;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/spg_store.db";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8360";

const DEFAULT_EXPIRY_SECONDS: i64 = 900;
const DEFAULT_SWEEPER_BATCH_SIZE: u32 = 100;
const DEFAULT_SWEEPER_INTERVAL_SECS: u64 = 30;
const DEFAULT_SWEEPER_LEASE_SECS: i64 = 90;

const DEFAULT_CALLBACK_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_CALLBACK_MAX_ATTEMPTS: u32 = 12;
const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 3_600_000;

const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_DISPATCH_BATCH_SIZE: u32 = 25;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: i64 = 120;
const DEFAULT_CONFIRMATION_POLL_SECS: i64 = 15;

const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PROVIDER_RETRIES: u32 = 3;

const DEFAULT_IDEMPOTENCY_TTL_HOURS: i64 = 24;

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Base URL used to assemble buyer-facing pay links.
    pub public_base_url: String,
    /// Required confirmation depth per chain.
    pub confirmations: HashMap<Chain, i64>,
    pub invoice: InvoiceConfig,
    pub callback: CallbackConfig,
    pub sweeper: SweeperConfig,
    pub dispatcher: DispatcherConfig,
    pub provider: ProviderConfig,
}

#[derive(Clone)]
pub struct InvoiceConfig {
    pub default_expiry: Duration,
    pub idempotency_ttl_hours: i64,
}

#[derive(Clone)]
pub struct CallbackConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

#[derive(Clone)]
pub struct SweeperConfig {
    pub batch_size: u32,
    pub interval: Duration,
    pub lease_secs: i64,
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub visibility_timeout_secs: i64,
    pub confirmation_poll_secs: i64,
}

#[derive(Clone)]
pub struct ProviderConfig {
    /// Shared secret authenticating inbound provider webhooks.
    pub webhook_secret: Secret<String>,
    /// JSON-RPC endpoint per chain, for reading the chain tip.
    pub rpc_urls: HashMap<Chain, String>,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SPG_HOST.to_string(),
            port: DEFAULT_SPG_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            confirmations: HashMap::new(),
            invoice: InvoiceConfig {
                default_expiry: Duration::from_secs(DEFAULT_EXPIRY_SECONDS as u64),
                idempotency_ttl_hours: DEFAULT_IDEMPOTENCY_TTL_HOURS,
            },
            callback: CallbackConfig {
                connect_timeout: Duration::from_millis(DEFAULT_CALLBACK_CONNECT_TIMEOUT_MS),
                timeout: Duration::from_millis(DEFAULT_CALLBACK_TIMEOUT_MS),
                max_attempts: DEFAULT_CALLBACK_MAX_ATTEMPTS,
                backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
                backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            },
            sweeper: SweeperConfig {
                batch_size: DEFAULT_SWEEPER_BATCH_SIZE,
                interval: Duration::from_secs(DEFAULT_SWEEPER_INTERVAL_SECS),
                lease_secs: DEFAULT_SWEEPER_LEASE_SECS,
            },
            dispatcher: DispatcherConfig {
                interval: Duration::from_millis(DEFAULT_DISPATCH_INTERVAL_MS),
                batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
                visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
                confirmation_poll_secs: DEFAULT_CONFIRMATION_POLL_SECS,
            },
            provider: ProviderConfig {
                webhook_secret: Secret::default(),
                rpc_urls: HashMap::new(),
                timeout: Duration::from_millis(DEFAULT_PROVIDER_TIMEOUT_MS),
                retries: DEFAULT_PROVIDER_RETRIES,
            },
        }
    }
}

impl ServerConfig {
    pub fn from_env_or_default() -> Self {
        let mut config = ServerConfig {
            host: env::var("SPG_HOST").ok().unwrap_or_else(|| DEFAULT_SPG_HOST.into()),
            port: env_parse("SPG_PORT", DEFAULT_SPG_PORT),
            database_url: env::var("SPG_DATABASE_URL").ok().unwrap_or_else(|| {
                info!("SPG_DATABASE_URL is not set. Using the default, {DEFAULT_DATABASE_URL}");
                DEFAULT_DATABASE_URL.into()
            }),
            public_base_url: env::var("SPG_PUBLIC_BASE_URL")
                .ok()
                .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.into()),
            confirmations: env_per_chain("SPG_CONFIRMATIONS_"),
            ..Default::default()
        };
        config.invoice.default_expiry =
            Duration::from_secs(env_parse("SPG_DEFAULT_EXPIRY_SECONDS", DEFAULT_EXPIRY_SECONDS) as u64);
        config.invoice.idempotency_ttl_hours =
            env_parse("SPG_IDEMPOTENCY_TTL_HOURS", DEFAULT_IDEMPOTENCY_TTL_HOURS);
        config.callback.connect_timeout =
            Duration::from_millis(env_parse("SPG_CALLBACK_CONNECT_TIMEOUT_MS", DEFAULT_CALLBACK_CONNECT_TIMEOUT_MS));
        config.callback.timeout =
            Duration::from_millis(env_parse("SPG_CALLBACK_TIMEOUT_MS", DEFAULT_CALLBACK_TIMEOUT_MS));
        config.callback.max_attempts = env_parse("SPG_CALLBACK_MAX_ATTEMPTS", DEFAULT_CALLBACK_MAX_ATTEMPTS);
        config.callback.backoff_base =
            Duration::from_millis(env_parse("SPG_CALLBACK_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS));
        config.callback.backoff_cap =
            Duration::from_millis(env_parse("SPG_CALLBACK_BACKOFF_CAP_MS", DEFAULT_BACKOFF_CAP_MS));
        config.sweeper.batch_size = env_parse("SPG_SWEEPER_BATCH_SIZE", DEFAULT_SWEEPER_BATCH_SIZE);
        config.sweeper.interval =
            Duration::from_secs(env_parse("SPG_SWEEPER_INTERVAL_SECS", DEFAULT_SWEEPER_INTERVAL_SECS));
        config.sweeper.lease_secs = env_parse("SPG_SWEEPER_LEASE_SECS", DEFAULT_SWEEPER_LEASE_SECS);
        config.dispatcher.interval =
            Duration::from_millis(env_parse("SPG_DISPATCH_INTERVAL_MS", DEFAULT_DISPATCH_INTERVAL_MS));
        config.dispatcher.batch_size = env_parse("SPG_DISPATCH_BATCH_SIZE", DEFAULT_DISPATCH_BATCH_SIZE);
        config.dispatcher.visibility_timeout_secs =
            env_parse("SPG_DISPATCH_VISIBILITY_TIMEOUT_SECS", DEFAULT_VISIBILITY_TIMEOUT_SECS);
        config.dispatcher.confirmation_poll_secs =
            env_parse("SPG_CONFIRMATION_POLL_SECS", DEFAULT_CONFIRMATION_POLL_SECS);
        config.provider.webhook_secret = Secret::new(env::var("SPG_PROVIDER_WEBHOOK_SECRET").unwrap_or_else(|_| {
            error!(
                "SPG_PROVIDER_WEBHOOK_SECRET is not set. Provider webhooks cannot be authenticated without it."
            );
            String::default()
        }));
        config.provider.rpc_urls = env_per_chain("SPG_PROVIDER_RPC_URL_");
        config.provider.timeout =
            Duration::from_millis(env_parse("SPG_PROVIDER_TIMEOUT_MS", DEFAULT_PROVIDER_TIMEOUT_MS));
        config.provider.retries = env_parse("SPG_PROVIDER_RETRIES", DEFAULT_PROVIDER_RETRIES);
        config
    }

    pub fn confirmations_for(&self, chain: &Chain) -> Option<i64> {
        self.confirmations.get(chain).copied()
    }
}

fn env_parse<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(s) => s.parse::<T>().unwrap_or_else(|_| {
            error!("{s} is not a valid value for {key}. Using the default, {default}, instead.");
            default
        }),
        Err(_) => default,
    }
}

/// Collect `PREFIX<CHAIN>=value` variables into a per-chain map. Chain names
/// are matched case-insensitively (`SPG_CONFIRMATIONS_ARBITRUM` configures
/// chain "arbitrum").
fn env_per_chain<T: std::str::FromStr>(prefix: &str) -> HashMap<Chain, T> {
    env::vars()
        .filter_map(|(key, value)| {
            let chain = key.strip_prefix(prefix)?;
            let parsed = value.parse::<T>().ok()?;
            Some((Chain::from(chain), parsed))
        })
        .collect()
}
