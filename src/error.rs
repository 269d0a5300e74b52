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

//! Error types for wallet operations and the ports they call.

use crate::base::WalletId;
use crate::hold::HoldStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Wallet operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Amount is zero, negative or above the per-operation ceiling
    #[error("invalid amount {0} (must be positive and within the per-operation limit)")]
    InvalidAmount(Decimal),

    /// Hold or debit exceeds the available balance
    #[error("insufficient available funds: available {available}, required {required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    /// No wallet for the given id or owner
    #[error("wallet not found")]
    WalletNotFound,

    /// Owner already has a wallet of this type
    #[error("wallet already exists for this owner and type")]
    WalletAlreadyExists,

    /// Wallet is deactivated and rejects mutations
    #[error("wallet is not active")]
    WalletInactive,

    /// Referenced hold does not exist
    #[error("hold not found")]
    HoldNotFound,

    /// Referenced ledger entry does not exist or belongs to another user
    #[error("ledger entry not found")]
    EntryNotFound,

    /// Hold already reached a terminal state
    #[error("hold is no longer active (status: {0})")]
    HoldNotActive(HoldStatus),

    /// Optimistic version check failed and retries were exhausted
    #[error("concurrent modification conflict")]
    Conflict,

    /// A wallet or hold lock could not be acquired in time
    #[error("timed out waiting for lock")]
    LockTimeout,

    /// Source and destination of a transfer are the same wallet
    #[error("cannot transfer to the same wallet")]
    SameWallet,

    /// Transfer credit failed; the debit was reversed
    #[error("transfer failed and was compensated: {reason}")]
    TransferPartialFailure { reason: String },

    /// Transfer credit failed and the compensating credit failed too
    #[error(
        "transfer compensation failed for wallet {wallet_id} ({amount}); reconciliation required: {reason}"
    )]
    ReconciliationRequired {
        wallet_id: WalletId,
        amount: Decimal,
        reason: String,
    },

    /// Provider charged the user but the wallet credit failed; replay
    /// `confirm_top_up` with the provider transaction id
    #[error(
        "payment {provider_transaction_id} ({amount}) was charged but not credited: {reason}"
    )]
    TopUpUnconfirmed {
        provider_transaction_id: String,
        amount: Decimal,
        reason: String,
    },

    /// Payment port rejected or failed the request
    #[error("payment failed: {reason}")]
    Payment { reason: String, retryable: bool },

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// A mutation would break a data-model invariant
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl WalletError {
    /// Returns `true` when the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            WalletError::Conflict | WalletError::LockTimeout => true,
            WalletError::Payment { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns `true` for the one failure that needs manual reconciliation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WalletError::ReconciliationRequired { .. })
    }
}

/// Ledger sink errors. Never surfaced as a money-movement failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger sink unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate ledger entry id")]
    DuplicateEntry,
}

/// Payment port errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),

    #[error("payment provider timed out")]
    Timeout,

    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

impl From<PaymentError> for WalletError {
    fn from(err: PaymentError) -> Self {
        let retryable = !matches!(err, PaymentError::Declined(_));
        WalletError::Payment {
            reason: err.to_string(),
            retryable,
        }
    }
}

impl From<LedgerError> for WalletError {
    fn from(err: LedgerError) -> Self {
        WalletError::Storage(err.to_string())
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
