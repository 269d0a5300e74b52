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

//! # Wallet Ledger
//!
//! This library provides the wallet engine of a ride and home-services
//! marketplace: per-user balances, fund holds against pending jobs, direct
//! debits and credits, transfers, and automatic restriction of driver and
//! provider accounts that run into commission debt.
//!
//! ## Core Components
//!
//! - [`WalletService`]: Public API used by the booking, earnings and top-up flows
//! - [`WalletStore`]: Versioned wallet rows with guarded compare-and-swap writes
//! - [`HoldManager`]: Hold lifecycle (active, captured, released, expired)
//! - [`LedgerRecorder`]: Append-only ledger with out-of-band retry of failed writes
//! - [`RestrictionPolicy`]: Overdraft restriction and recovery
//! - [`WalletError`]: Error type for every wallet operation
//!
//! ## Example
//!
//! ```
//! use wallet_ledger::{UserId, WalletConfig, WalletService, WalletType};
//! use rust_decimal_macros::dec;
//!
//! let service = WalletService::new(WalletConfig::default());
//! let rider = UserId::from("rider-1");
//! service.create_wallet(&rider, WalletType::Rider, dec!(1000.00)).unwrap();
//!
//! // Reserve the fare, then capture it on completion
//! let hold = service.hold_funds(&rider, dec!(500), "service_order", "o1").unwrap();
//! assert_eq!(service.get_balance(&rider).unwrap().available(), dec!(500));
//!
//! service.capture_hold(&rider, hold.id, "order completed").unwrap();
//! let balance = service.get_balance(&rider).unwrap();
//! assert_eq!(balance.balance, dec!(500.00));
//! assert_eq!(balance.held_balance, dec!(0));
//! ```
//!
//! ## Thread Safety
//!
//! All components are `Send + Sync` and meant to be shared behind an [`Arc`](std::sync::Arc).
//! Operations on different wallets proceed in parallel; operations on the same
//! wallet serialize on its version.

mod base;
pub mod config;
pub mod error;
pub mod hold;
pub mod ledger;
pub mod payment;
pub mod restriction;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod wallet;

pub use base::{EntryId, HoldId, UserId, WalletId};
pub use config::{RetryPolicy, WalletConfig};
pub use error::{ConfigError, LedgerError, PaymentError, WalletError};
pub use hold::{Hold, HoldManager, HoldStatus};
pub use ledger::{
    HistoryQuery, LedgerEntry, LedgerRecorder, LedgerSink, MemoryLedger, Page, TransactionKind,
};
pub use payment::{PaymentPort, PaymentReceipt, PaymentRequest, SimulatedPaymentPort};
pub use restriction::{RestrictionOutcome, RestrictionPolicy};
pub use service::{BalanceAudit, PendingTopUp, Transfer, WalletService};
pub use store::{MemoryWalletStore, WalletStore};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
pub use wallet::{AccountStatus, BalanceView, Wallet, WalletType};
