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

//! Wallet data model.
//!
//! A [`Wallet`] is an immutable snapshot of one row in the
//! [`WalletStore`](crate::store::WalletStore). Every committed mutation bumps
//! `version`, which is what the store compares on guarded writes.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use wallet_ledger::{UserId, WalletId, WalletType};
//! use wallet_ledger::wallet::{NewWallet, Wallet};
//!
//! let wallet = Wallet::open(WalletId(1), NewWallet {
//!     owner_id: UserId::from("rider-1"),
//!     wallet_type: WalletType::Rider,
//!     initial_balance: dec!(1000),
//!     currency: "INR".into(),
//!     min_balance_threshold: dec!(0),
//! });
//! assert_eq!(wallet.available_balance(), dec!(1000));
//! ```

use crate::base::{UserId, WalletId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletType {
    Rider,
    Driver,
    Provider,
}

impl WalletType {
    /// Driver and provider wallets carry commission debt and can be restricted.
    pub fn is_restrictable(self) -> bool {
        matches!(self, WalletType::Driver | WalletType::Provider)
    }
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletType::Rider => write!(f, "rider"),
            WalletType::Driver => write!(f, "driver"),
            WalletType::Provider => write!(f, "provider"),
        }
    }
}

impl std::str::FromStr for WalletType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rider" | "customer" => Ok(WalletType::Rider),
            "driver" => Ok(WalletType::Driver),
            "provider" | "service_provider" => Ok(WalletType::Provider),
            other => Err(format!("unknown wallet type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    /// Set automatically by the restriction policy.
    Suspended,
    /// Set by an operator; never cleared automatically.
    Disabled,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountStatus::Active => write!(f, "active"),
            AccountStatus::Suspended => write!(f, "suspended"),
            AccountStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Restriction fields, written together by the restriction policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub is_restricted: bool,
    pub restriction_reason: Option<String>,
    pub restricted_at: Option<DateTime<Utc>>,
    pub account_status: AccountStatus,
}

impl Standing {
    pub fn good() -> Self {
        Self {
            is_restricted: false,
            restriction_reason: None,
            restricted_at: None,
            account_status: AccountStatus::Active,
        }
    }

    pub fn restricted(reason: String, at: DateTime<Utc>) -> Self {
        Self {
            is_restricted: true,
            restriction_reason: Some(reason),
            restricted_at: Some(at),
            account_status: AccountStatus::Suspended,
        }
    }
}

/// Parameters for a wallet created at signup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWallet {
    pub owner_id: UserId,
    pub wallet_type: WalletType,
    pub initial_balance: Decimal,
    pub currency: String,
    pub min_balance_threshold: Decimal,
}

/// Snapshot of a wallet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: UserId,
    pub wallet_type: WalletType,
    /// Signed; only overdraft-permitted wallets go below zero.
    pub balance: Decimal,
    pub held_balance: Decimal,
    /// Opening balance; not recorded in the ledger.
    pub initial_balance: Decimal,
    pub currency: String,
    pub is_active: bool,
    pub min_balance_threshold: Decimal,
    pub is_restricted: bool,
    pub restriction_reason: Option<String>,
    pub restricted_at: Option<DateTime<Utc>>,
    pub account_status: AccountStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn open(id: WalletId, new: NewWallet) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: new.owner_id,
            wallet_type: new.wallet_type,
            balance: new.initial_balance,
            held_balance: Decimal::ZERO,
            initial_balance: new.initial_balance,
            currency: new.currency,
            is_active: true,
            min_balance_threshold: new.min_balance_threshold,
            is_restricted: false,
            restriction_reason: None,
            restricted_at: None,
            account_status: AccountStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `balance - held_balance`.
    pub fn available_balance(&self) -> Decimal {
        self.balance - self.held_balance
    }

    /// Direct debits may drive the balance negative only on these wallets.
    pub fn allows_overdraft(&self) -> bool {
        self.wallet_type.is_restrictable() && self.min_balance_threshold > Decimal::ZERO
    }

    /// Balance below which the restriction policy suspends the account.
    pub fn restriction_floor(&self) -> Decimal {
        -self.min_balance_threshold
    }

    pub fn standing(&self) -> Standing {
        Standing {
            is_restricted: self.is_restricted,
            restriction_reason: self.restriction_reason.clone(),
            restricted_at: self.restricted_at,
            account_status: self.account_status,
        }
    }

    /// Eligible to go online / accept jobs.
    pub fn is_eligible(&self) -> bool {
        self.is_active && !self.is_restricted && self.account_status == AccountStatus::Active
    }

    pub fn balance_view(&self) -> BalanceView {
        BalanceView {
            balance: self.balance,
            held_balance: self.held_balance,
            currency: self.currency.clone(),
        }
    }

    /// Invariants every committed snapshot must satisfy.
    pub(crate) fn assert_invariants(&self) {
        debug_assert!(
            self.held_balance >= Decimal::ZERO,
            "Invariant violated: held balance went negative: {}",
            self.held_balance
        );
        debug_assert!(
            self.wallet_type.is_restrictable() || self.balance >= Decimal::ZERO,
            "Invariant violated: rider balance went negative: {}",
            self.balance
        );
    }
}

/// Read-only balance summary returned by `get_balance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceView {
    pub balance: Decimal,
    pub held_balance: Decimal,
    pub currency: String,
}

impl BalanceView {
    const DECIMAL_PRECISION: u32 = 2;

    pub fn available(&self) -> Decimal {
        self.balance - self.held_balance
    }
}

impl Serialize for BalanceView {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("BalanceView", 4)?;
        state.serialize_field(
            "balance",
            &self.balance.round_dp(BalanceView::DECIMAL_PRECISION),
        )?;
        state.serialize_field(
            "held_balance",
            &self.held_balance.round_dp(BalanceView::DECIMAL_PRECISION),
        )?;
        state.serialize_field(
            "available_balance",
            &self.available().round_dp(BalanceView::DECIMAL_PRECISION),
        )?;
        state.serialize_field("currency", &self.currency)?;
        state.end()
    }
}
