//! Process configuration
//!
//! Everything is read once from the environment at startup. Unset or
//! malformed variables fall back to their defaults.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::jobs::JobConfig;
use crate::services::escrow_service::EscrowPolicy;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub redis_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub background_jobs_enabled: bool,
    pub auto_accept_payments: bool,
    pub escrow: EscrowPolicy,
    pub jobs: JobConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8081,
            redis_url: None,
            slack_webhook_url: None,
            background_jobs_enabled: true,
            auto_accept_payments: true,
            escrow: EscrowPolicy::default(),
            jobs: JobConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Settings::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut escrow = defaults.escrow;
        escrow.min_amount = parsed(&lookup, "MIN_PAYMENT_AMOUNT", escrow.min_amount);
        escrow.max_amount = parsed(&lookup, "MAX_PAYMENT_AMOUNT", escrow.max_amount);
        let hold_hours = parsed(&lookup, "ESCROW_HOLD_HOURS", 24u32);
        escrow.hold = chrono::Duration::hours(i64::from(hold_hours.max(1)));
        if escrow.min_amount > escrow.max_amount {
            warn!("MIN_PAYMENT_AMOUNT exceeds MAX_PAYMENT_AMOUNT, using defaults");
            escrow.min_amount = Decimal::new(5, 0);
            escrow.max_amount = Decimal::new(50, 0);
        }

        let jobs = defaults.jobs;
        let jobs = JobConfig {
            rating_reminder_interval: duration(
                &lookup,
                "RATING_REMINDER_INTERVAL",
                jobs.rating_reminder_interval,
            ),
            auto_release_interval: duration(
                &lookup,
                "AUTO_RELEASE_INTERVAL",
                jobs.auto_release_interval,
            ),
            dispute_escalation_interval: duration(
                &lookup,
                "DISPUTE_ESCALATION_INTERVAL",
                jobs.dispute_escalation_interval,
            ),
            rating_deadline_days: parsed(&lookup, "RATING_DEADLINE_DAYS", jobs.rating_deadline_days),
            min_rating_for_auto_release: parsed(
                &lookup,
                "MIN_RATING_FOR_AUTO_RELEASE",
                jobs.min_rating_for_auto_release,
            ),
            dispute_escalation_hours: parsed(
                &lookup,
                "DISPUTE_ESCALATION_HOURS",
                jobs.dispute_escalation_hours,
            ),
        };

        Self {
            port: parsed(&lookup, "PORT", defaults.port),
            redis_url: lookup("REDIS_URL"),
            slack_webhook_url: lookup("SLACK_ESCROW_WEBHOOK_URL"),
            background_jobs_enabled: !parsed(&lookup, "DISABLE_BACKGROUND_JOBS", false),
            auto_accept_payments: parsed(
                &lookup,
                "PAYMENT_AUTO_ACCEPT",
                defaults.auto_accept_payments,
            ),
            escrow,
            jobs,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid value, using default");
            default
        }),
        None => default,
    }
}

fn duration(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match lookup(key) {
        Some(raw) => match parse_duration(&raw) {
            Some(value) if !value.is_zero() => value,
            _ => {
                warn!(key, value = %raw, "invalid duration, using default");
                default
            }
        },
        None => default,
    }
}

/// `90`, `45s`, `15m`, `1h` or `2d`. Bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let secs = match unit.trim() {
        "" | "s" => value,
        "m" => value.checked_mul(60)?,
        "h" => value.checked_mul(60 * 60)?,
        "d" => value.checked_mul(24 * 60 * 60)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
