//! Process configuration.
//!
//! Loaded once at startup. Provider credentials, the webhook secret and the
//! settlement mode are read only here, so changing any of them requires a
//! restart.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::SettlementMode;

const DEFAULT_BATCH_CRON: &str = "0 0 9 * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub client_id: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub signature_header: String,
    pub timeout: Duration,
    pub circuit_failures: u32,
    pub circuit_reset: Duration,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub mode: SettlementMode,
    pub auto_settle: bool,
    pub batch_schedule: cron::Schedule,
    pub payout_max_attempts: i32,
    pub payout_retry_backoff: Duration,
    /// PROCESSING payouts untouched for this long are re-sent under their reference.
    pub payout_reconcile_after: Duration,
}

impl SettlementConfig {
    /// First batch run on or after the start of the next UTC day.
    pub fn next_batch_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = (now + ChronoDuration::days(1)).date_naive();
        let start = tomorrow
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(now);
        self.batch_schedule
            .after(&(start - ChronoDuration::seconds(1)))
            .next()
            .unwrap_or(start)
    }

    /// Delay before payout attempt `attempt + 1`.
    pub fn retry_delay(&self, attempt: i32) -> ChronoDuration {
        let base = ChronoDuration::from_std(self.payout_retry_backoff)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        base * attempt.max(1)
    }

    /// Payouts last updated before this instant are due for reconciliation.
    pub fn reconcile_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::from_std(self.payout_reconcile_after)
            .unwrap_or_else(|_| ChronoDuration::minutes(30))
    }
}

/// What the engine itself needs, separate from process concerns.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub currency: String,
    pub webhook_secret: String,
    pub signature_header: String,
    pub payment_ttl: ChronoDuration,
    pub pin_pepper: String,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub provider: ProviderConfig,
    pub settlement: SettlementConfig,
    pub payment_ttl: Duration,
    pub expiry_sweep_interval: Duration,
    pub outbox_poll_interval: Duration,
    pub wallet_pin_pepper: String,
    pub currency: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).ok_or_else(|| anyhow!("{} must be set", key));
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let base_url = required("PROVIDER_BASE_URL")?;
        url::Url::parse(&base_url).with_context(|| format!("PROVIDER_BASE_URL '{}'", base_url))?;

        let batch_cron = or_default("SETTLEMENT_BATCH_CRON", DEFAULT_BATCH_CRON);
        let batch_schedule = cron::Schedule::from_str(&batch_cron)
            .map_err(|e| anyhow!("SETTLEMENT_BATCH_CRON '{}': {}", batch_cron, e))?;

        let mode = SettlementMode::from_str(&or_default("SETTLEMENT_MODE", "main_balance"))?;

        let log_format = match or_default("LOG_FORMAT", "text").as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => anyhow::bail!("LOG_FORMAT must be 'text' or 'json', got '{}'", other),
        };

        Ok(Config {
            server_port: or_default("SERVER_PORT", "3000").parse()?,
            database_url: required("DATABASE_URL")?,
            database_max_connections: or_default("DATABASE_MAX_CONNECTIONS", "10").parse()?,
            provider: ProviderConfig {
                base_url,
                client_id: required("PROVIDER_CLIENT_ID")?,
                secret_key: required("PROVIDER_SECRET_KEY")?,
                webhook_secret: required("PROVIDER_WEBHOOK_SECRET")?,
                signature_header: or_default("PROVIDER_SIGNATURE_HEADER", "x-paystack-signature")
                    .to_ascii_lowercase(),
                timeout: Duration::from_secs(or_default("PROVIDER_TIMEOUT_SECS", "20").parse()?),
                circuit_failures: or_default("PROVIDER_CIRCUIT_FAILURES", "5").parse()?,
                circuit_reset: Duration::from_secs(
                    or_default("PROVIDER_CIRCUIT_RESET_SECS", "60").parse()?,
                ),
            },
            settlement: SettlementConfig {
                mode,
                auto_settle: or_default("AUTO_SETTLE", "true").parse()?,
                batch_schedule,
                payout_max_attempts: or_default("PAYOUT_MAX_ATTEMPTS", "5").parse()?,
                payout_retry_backoff: Duration::from_secs(
                    or_default("PAYOUT_RETRY_BACKOFF_SECS", "300").parse()?,
                ),
                payout_reconcile_after: Duration::from_secs(
                    or_default("PAYOUT_RECONCILE_AFTER_SECS", "1800").parse()?,
                ),
            },
            payment_ttl: Duration::from_secs(
                or_default("PAYMENT_TTL_MINUTES", "30").parse::<u64>()? * 60,
            ),
            expiry_sweep_interval: Duration::from_secs(
                or_default("EXPIRY_SWEEP_INTERVAL_SECS", "60").parse()?,
            ),
            outbox_poll_interval: Duration::from_secs(
                or_default("OUTBOX_POLL_INTERVAL_SECS", "5").parse()?,
            ),
            wallet_pin_pepper: required("WALLET_PIN_PEPPER")?,
            currency: or_default("CURRENCY", "NGN"),
            log_format,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            currency: self.currency.clone(),
            webhook_secret: self.provider.webhook_secret.clone(),
            signature_header: self.provider.signature_header.clone(),
            payment_ttl: ChronoDuration::from_std(self.payment_ttl)
                .unwrap_or_else(|_| ChronoDuration::minutes(30)),
            pin_pepper: self.wallet_pin_pepper.clone(),
            settlement: self.settlement.clone(),
        }
    }
}
