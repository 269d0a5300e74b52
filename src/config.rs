// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration.
//!
//! Every field has a default, so a partial JSON file (or none at all) is valid.
//! Environment variables prefixed with `WALLET_` override file values.

use crate::error::ConfigError;
use crate::wallet::WalletType;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Wallet engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// ISO currency code assigned to new wallets.
    pub currency: String,
    /// Default lifetime of a hold before the sweep expires it.
    pub hold_ttl_secs: u64,
    /// Per-operation sanity ceiling.
    pub max_amount: Decimal,
    pub rider_signup_balance: Decimal,
    pub driver_signup_balance: Decimal,
    pub provider_signup_balance: Decimal,
    /// Overdraft allowed on new driver wallets before restriction.
    pub driver_min_balance_threshold: Decimal,
    /// Overdraft allowed on new provider wallets before restriction.
    pub provider_min_balance_threshold: Decimal,
    /// Attempts per guarded mutation before `Conflict` is surfaced.
    pub max_retries: u32,
    /// Base backoff between conflict retries, doubled on each attempt.
    pub retry_backoff_ms: u64,
    pub lock_timeout_ms: u64,
    pub payment_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    /// How long settled holds and replay receipts are kept before pruning.
    pub retention_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
            hold_ttl_secs: 30 * 60,
            max_amount: dec!(10000),
            rider_signup_balance: dec!(1000),
            driver_signup_balance: Decimal::ZERO,
            provider_signup_balance: Decimal::ZERO,
            driver_min_balance_threshold: dec!(100),
            provider_min_balance_threshold: dec!(100),
            max_retries: 5,
            retry_backoff_ms: 1,
            lock_timeout_ms: 250,
            payment_timeout_ms: 5_000,
            sweep_interval_secs: 30,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl WalletConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: WalletConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `WALLET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WALLET_CURRENCY") {
            self.currency = v;
        }
        override_parsed(&lookup, "WALLET_HOLD_TTL_SECS", &mut self.hold_ttl_secs)?;
        override_parsed(&lookup, "WALLET_MAX_AMOUNT", &mut self.max_amount)?;
        override_parsed(
            &lookup,
            "WALLET_DRIVER_MIN_BALANCE_THRESHOLD",
            &mut self.driver_min_balance_threshold,
        )?;
        override_parsed(
            &lookup,
            "WALLET_PROVIDER_MIN_BALANCE_THRESHOLD",
            &mut self.provider_min_balance_threshold,
        )?;
        override_parsed(&lookup, "WALLET_MAX_RETRIES", &mut self.max_retries)?;
        override_parsed(&lookup, "WALLET_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms)?;
        override_parsed(&lookup, "WALLET_LOCK_TIMEOUT_MS", &mut self.lock_timeout_ms)?;
        override_parsed(&lookup, "WALLET_PAYMENT_TIMEOUT_MS", &mut self.payment_timeout_ms)?;
        override_parsed(&lookup, "WALLET_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        override_parsed(&lookup, "WALLET_RETENTION_SECS", &mut self.retention_secs)?;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_amount <= Decimal::ZERO {
            return Err(invalid("max_amount", self.max_amount));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", self.max_retries));
        }
        if self.driver_min_balance_threshold < Decimal::ZERO {
            return Err(invalid(
                "driver_min_balance_threshold",
                self.driver_min_balance_threshold,
            ));
        }
        if self.provider_min_balance_threshold < Decimal::ZERO {
            return Err(invalid(
                "provider_min_balance_threshold",
                self.provider_min_balance_threshold,
            ));
        }
        if self.currency.len() != 3 {
            return Err(invalid("currency", &self.currency));
        }
        Ok(())
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(self.hold_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Initial balance granted at signup for each role.
    pub fn signup_balance(&self, wallet_type: WalletType) -> Decimal {
        match wallet_type {
            WalletType::Rider => self.rider_signup_balance,
            WalletType::Driver => self.driver_signup_balance,
            WalletType::Provider => self.provider_signup_balance,
        }
    }

    /// Overdraft threshold assigned to a new wallet. Riders never overdraw.
    pub fn min_balance_threshold(&self, wallet_type: WalletType) -> Decimal {
        match wallet_type {
            WalletType::Rider => Decimal::ZERO,
            WalletType::Driver => self.driver_min_balance_threshold,
            WalletType::Provider => self.provider_min_balance_threshold,
        }
    }
}

/// Bounded retry with exponential backoff for optimistic-lock conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        self.base_backoff.saturating_mul(1u32 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        WalletConfig::default().retry_policy()
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}
