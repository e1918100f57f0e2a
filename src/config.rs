use std::env;
use std::time::Duration;

use anyhow::{bail, Context};
use teloxide::types::ChatId;

const DATABASE_URL_ENV: &str = "DATABASE_URL";
const PERSISTENCE_INTERVAL_ENV: &str = "PERSISTENCE_INTERVAL";
const ADMIN_USER_ID_ENV: &str = "ADMIN_USER_ID";

const DEFAULT_DATABASE_URL: &str = "sqlite://smoker.db?mode=rwc";
const DEFAULT_PERSISTENCE_INTERVAL_SECS: u64 = 600;

/// Настройки процесса. Токен бота читает сам teloxide (`TELOXIDE_TOKEN`).
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub persistence_interval: Duration,
    pub admin_chat: Option<ChatId>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url =
            lookup(DATABASE_URL_ENV).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let interval_secs = match lookup(PERSISTENCE_INTERVAL_ENV) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{} must be a number of seconds", PERSISTENCE_INTERVAL_ENV))?,
            None => DEFAULT_PERSISTENCE_INTERVAL_SECS,
        };
        if interval_secs == 0 {
            bail!("{} must be positive", PERSISTENCE_INTERVAL_ENV);
        }

        let admin_chat = lookup(ADMIN_USER_ID_ENV)
            .map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .map(ChatId)
                    .with_context(|| format!("{} must be a Telegram user id", ADMIN_USER_ID_ENV))
            })
            .transpose()?;

        Ok(Config {
            database_url,
            persistence_interval: Duration::from_secs(interval_secs),
            admin_chat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.persistence_interval, Duration::from_secs(600));
        assert_eq!(config.admin_chat, None);
    }

    #[test]
    fn values_are_read() {
        let config = config(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("PERSISTENCE_INTERVAL", "30"),
            ("ADMIN_USER_ID", "42"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.persistence_interval, Duration::from_secs(30));
        assert_eq!(config.admin_chat, Some(ChatId(42)));
    }

    #[test]
    fn zero_or_garbage_interval_is_rejected() {
        assert!(config(&[("PERSISTENCE_INTERVAL", "0")]).is_err());
        assert!(config(&[("PERSISTENCE_INTERVAL", "soon")]).is_err());
        assert!(config(&[("ADMIN_USER_ID", "admin")]).is_err());
    }
}
