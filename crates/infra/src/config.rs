//! Ledger configuration.
//!
//! Loaded from `KERMESSE_*` environment variables or from JSON. Every field
//! has a default, so an empty environment yields a working configuration.
//!
//! | variable | field |
//! |----------|-------|
//! | `KERMESSE_TOP_UP_POLICY` | `top_up_policy` (`pending_validation` or `direct_credit`) |
//! | `KERMESSE_TRANSFER_REQUIRES_PARTICIPATION` | `transfer_requires_participation` |
//! | `KERMESSE_MAX_CONFLICT_RETRIES` | `max_conflict_retries` |
//! | `KERMESSE_OPERATION_TIMEOUT_MS` | `operation_timeout_ms` |
//! | `DATABASE_URL` | `database_url` |

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use kermesse_ledger::{LedgerPolicy, TopUpPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub top_up_policy: TopUpPolicy,
    pub transfer_requires_participation: bool,
    /// Extra attempts after a `Conflict` before giving up.
    pub max_conflict_retries: u32,
    pub operation_timeout_ms: Option<u64>,
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            top_up_policy: TopUpPolicy::default(),
            transfer_requires_participation: false,
            max_conflict_retries: 3,
            operation_timeout_ms: None,
            database_url: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("KERMESSE_TOP_UP_POLICY") {
            config.top_up_policy = value
                .trim()
                .parse()
                .with_context(|| format!("invalid KERMESSE_TOP_UP_POLICY '{value}'"))?;
        }
        if let Some(value) = lookup("KERMESSE_TRANSFER_REQUIRES_PARTICIPATION") {
            config.transfer_requires_participation = value
                .trim()
                .parse()
                .with_context(|| format!("invalid KERMESSE_TRANSFER_REQUIRES_PARTICIPATION '{value}'"))?;
        }
        if let Some(value) = lookup("KERMESSE_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = value
                .trim()
                .parse()
                .with_context(|| format!("invalid KERMESSE_MAX_CONFLICT_RETRIES '{value}'"))?;
        }
        if let Some(value) = lookup("KERMESSE_OPERATION_TIMEOUT_MS") {
            let ms: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("invalid KERMESSE_OPERATION_TIMEOUT_MS '{value}'"))?;
            config.operation_timeout_ms = Some(ms);
        }
        config.database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Ok(config)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid ledger configuration JSON")
    }

    pub fn policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            top_up: self.top_up_policy,
            transfer_requires_participation: self.transfer_requires_participation,
        }
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = LedgerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.operation_timeout(), None);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = LedgerConfig::from_lookup(lookup(&[
            ("KERMESSE_TOP_UP_POLICY", "direct_credit"),
            ("KERMESSE_TRANSFER_REQUIRES_PARTICIPATION", "true"),
            ("KERMESSE_MAX_CONFLICT_RETRIES", "7"),
            ("KERMESSE_OPERATION_TIMEOUT_MS", "250"),
            ("DATABASE_URL", "postgres://localhost/kermesse"),
        ]))
        .unwrap();

        assert_eq!(config.top_up_policy, TopUpPolicy::DirectCredit);
        assert!(config.policy().transfer_requires_participation);
        assert_eq!(config.max_conflict_retries, 7);
        assert_eq!(config.operation_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/kermesse"));
    }

    #[test]
    fn malformed_values_are_reported_with_their_key() {
        let err = LedgerConfig::from_lookup(lookup(&[("KERMESSE_MAX_CONFLICT_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("KERMESSE_MAX_CONFLICT_RETRIES"));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = LedgerConfig::from_json(r#"{ "top_up_policy": "direct_credit" }"#).unwrap();
        assert_eq!(config.top_up_policy, TopUpPolicy::DirectCredit);
        assert_eq!(config.max_conflict_retries, 3);
    }
}
