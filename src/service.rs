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

//! Wallet service.
//!
//! The [`WalletService`] is the entry point used by the booking, earnings and
//! top-up flows. It resolves owners to wallets and composes the
//! [`WalletStore`], [`HoldManager`], [`LedgerRecorder`] and
//! [`RestrictionPolicy`].
//!
//! # Money Movements
//!
//! - **Holds**: Reserve funds at booking time, captured on completion or
//!   released on cancellation.
//! - **Debits**: Direct decrements (cancellation fees, commission, penalties,
//!   subscriptions). Driver and provider wallets with a threshold may go negative.
//! - **Withdrawals**: Payouts and cash settlements. Never overdraw.
//! - **Credits**: Direct increments (earnings, top-ups, cash collections).
//! - **Transfers**: Debit one wallet and credit another, compensated if the
//!   credit fails. Never overdraw.
//!
//! # Thread Safety
//!
//! Every balance change is a guarded compare-and-swap in the store. Transfers
//! additionally take per-wallet transfer locks in ascending [`WalletId`] order.

use crate::base::{EntryId, HoldId, IdSequence, UserId, WalletId};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::hold::{Hold, HoldManager, HoldSettings};
use crate::ledger::{
    EntryDraft, HistoryQuery, LedgerEntry, LedgerRecorder, LedgerSink, MemoryLedger, Page,
    TransactionKind,
};
use crate::payment::{PaymentPort, PaymentRequest, SimulatedPaymentPort};
use crate::restriction::RestrictionPolicy;
use crate::store::{MemoryWalletStore, WalletStore, retry_on_conflict};
use crate::wallet::{BalanceView, NewWallet, Wallet, WalletType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reference types used by the marketplace flows.
pub mod reference {
    pub const CANCELLATION_FEE: &str = "cancellation_fee";
    pub const CASH_COLLECTION: &str = "cash_collection";
    pub const CASH_SETTLEMENT: &str = "cash_settlement";
    pub const RIDE: &str = "ride";
    pub const RIDE_COMMISSION: &str = "ride_commission";
    pub const DRIVER_PENALTY: &str = "driver_penalty";
    pub const SERVICE_ORDER: &str = "service_order";
    pub const SUBSCRIPTION_FEE: &str = "subscription_fee";
    pub const TOPUP: &str = "topup";
    pub const TRANSFER: &str = "transfer";
    pub const WITHDRAWAL: &str = "withdrawal";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    In,
    Out,
}

/// Idempotency key of a referenced debit or credit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MovementKey {
    wallet_id: WalletId,
    direction: Direction,
    reference_type: String,
    reference_id: String,
}

struct Movement<'a> {
    wallet_id: WalletId,
    direction: Direction,
    kind: TransactionKind,
    amount: Decimal,
    reference_type: &'a str,
    reference_id: &'a str,
    description: &'a str,
    /// Outgoing movement may use the wallet's overdraft allowance.
    overdraft: bool,
}

impl<'a> Movement<'a> {
    fn credit(
        wallet_id: WalletId,
        amount: Decimal,
        reference_type: &'a str,
        reference_id: &'a str,
        description: &'a str,
    ) -> Self {
        Self {
            wallet_id,
            direction: Direction::In,
            kind: TransactionKind::Credit,
            amount,
            reference_type,
            reference_id,
            description,
            overdraft: false,
        }
    }

    fn debit(
        wallet_id: WalletId,
        amount: Decimal,
        reference_type: &'a str,
        reference_id: &'a str,
        description: &'a str,
    ) -> Self {
        let kind = if reference_type == reference::CANCELLATION_FEE {
            TransactionKind::CancellationFee
        } else {
            TransactionKind::Debit
        };
        Self {
            wallet_id,
            direction: Direction::Out,
            kind,
            amount,
            reference_type,
            reference_id,
            description,
            overdraft: true,
        }
    }

    /// Requires `available >= amount` whatever the wallet type.
    fn covered(mut self) -> Self {
        self.overdraft = false;
        self
    }

    fn key(&self) -> MovementKey {
        MovementKey {
            wallet_id: self.wallet_id,
            direction: self.direction,
            reference_type: self.reference_type.to_string(),
            reference_id: self.reference_id.to_string(),
        }
    }
}

/// Both legs of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub reference_id: String,
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

/// A charged top-up whose wallet credit has not been applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTopUp {
    pub user_id: UserId,
    pub amount: Decimal,
    pub provider_transaction_id: String,
    pub charged_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Stored balance compared with the balance rebuilt from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceAudit {
    pub wallet_id: WalletId,
    pub wallet_type: WalletType,
    pub balance: Decimal,
    pub ledger_balance: Decimal,
    /// `balance - ledger_balance`.
    pub discrepancy: Decimal,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.discrepancy.is_zero()
    }
}

/// Wallet service that owns every wallet mutation.
///
/// # Invariants
///
/// - `held_balance` never goes negative.
/// - Rider wallets and wallets without a threshold never go negative.
/// - Transfers and withdrawals never take a wallet below zero available.
/// - `balance` equals the initial balance plus the signed sum of the wallet's ledger entries.
/// - A hold settles at most once.
pub struct WalletService {
    config: WalletConfig,
    store: Arc<dyn WalletStore>,
    ledger: Arc<LedgerRecorder>,
    holds: HoldManager,
    policy: RestrictionPolicy,
    payments: Arc<dyn PaymentPort>,
    /// Receipts of referenced debits and credits, for replay.
    movements: DashMap<MovementKey, LedgerEntry>,
    /// Charged top-ups keyed by provider transaction id, until credited.
    pending_top_ups: DashMap<String, PendingTopUp>,
    transfer_locks: DashMap<WalletId, Arc<Mutex<()>>>,
    transfer_ids: IdSequence,
}

impl WalletService {
    /// Creates a service backed by in-memory storage and a simulated payment provider.
    pub fn new(config: WalletConfig) -> Self {
        let store = Arc::new(MemoryWalletStore::new(config.lock_timeout()));
        Self::with_parts(
            config,
            store,
            Arc::new(MemoryLedger::new()),
            Arc::new(SimulatedPaymentPort::new()),
        )
    }

    pub fn with_parts(
        config: WalletConfig,
        store: Arc<dyn WalletStore>,
        sink: Arc<dyn LedgerSink>,
        payments: Arc<dyn PaymentPort>,
    ) -> Self {
        let ledger = Arc::new(LedgerRecorder::new(sink));
        let holds = HoldManager::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            HoldSettings {
                default_ttl: config.hold_ttl(),
                max_amount: config.max_amount,
                lock_timeout: config.lock_timeout(),
                retry: config.retry_policy(),
            },
        );
        let policy = RestrictionPolicy::new(Arc::clone(&store), config.retry_policy());

        Self {
            config,
            store,
            ledger,
            holds,
            policy,
            payments,
            movements: DashMap::new(),
            pending_top_ups: DashMap::new(),
            transfer_locks: DashMap::new(),
            transfer_ids: IdSequence::new(),
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn holds(&self) -> &HoldManager {
        &self.holds
    }

    pub fn ledger(&self) -> &LedgerRecorder {
        &self.ledger
    }

    /// Opens a wallet of `wallet_type` for `owner_id`.
    ///
    /// # Errors
    ///
    /// - [`WalletError::WalletAlreadyExists`] - Owner already has a wallet of this type.
    /// - [`WalletError::InvalidAmount`] - Negative initial balance.
    pub fn create_wallet(
        &self,
        owner_id: &UserId,
        wallet_type: WalletType,
        initial_balance: Decimal,
    ) -> Result<Wallet, WalletError> {
        let wallet = self.store.create_wallet(NewWallet {
            owner_id: owner_id.clone(),
            wallet_type,
            initial_balance,
            currency: self.config.currency.clone(),
            min_balance_threshold: self.config.min_balance_threshold(wallet_type),
        })?;
        info!(
            wallet_id = %wallet.id,
            owner_id = %owner_id,
            %wallet_type,
            balance = %wallet.balance,
            "wallet created"
        );
        Ok(wallet)
    }

    /// Opens a wallet with the configured signup balance for its role.
    pub fn open_signup_wallet(
        &self,
        owner_id: &UserId,
        wallet_type: WalletType,
    ) -> Result<Wallet, WalletError> {
        self.create_wallet(owner_id, wallet_type, self.config.signup_balance(wallet_type))
    }

    /// The owner's earliest-created wallet.
    pub fn get_wallet(&self, user: &UserId) -> Result<Wallet, WalletError> {
        self.store
            .find_by_owner(user)?
            .into_iter()
            .next()
            .ok_or(WalletError::WalletNotFound)
    }

    pub fn wallet_of_type(
        &self,
        user: &UserId,
        wallet_type: WalletType,
    ) -> Result<Wallet, WalletError> {
        self.store
            .find_by_owner(user)?
            .into_iter()
            .find(|w| w.wallet_type == wallet_type)
            .ok_or(WalletError::WalletNotFound)
    }

    pub fn wallets(&self, user: &UserId) -> Result<Vec<Wallet>, WalletError> {
        self.store.find_by_owner(user)
    }

    pub fn get_balance(&self, user: &UserId) -> Result<BalanceView, WalletError> {
        Ok(self.get_wallet(user)?.balance_view())
    }

    /// Whether the user may go online or accept jobs.
    pub fn is_eligible(&self, user: &UserId) -> Result<bool, WalletError> {
        let wallet = match self.earning_wallet(user) {
            Err(WalletError::WalletNotFound) => self.get_wallet(user)?,
            other => other?,
        };
        Ok(wallet.is_eligible())
    }

    /// Reserves `amount` on the user's wallet. Idempotent per reference.
    pub fn hold_funds(
        &self,
        user: &UserId,
        amount: Decimal,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Hold, WalletError> {
        let wallet = self.get_wallet(user)?;
        self.holds
            .hold_funds(wallet.id, amount, reference_type, reference_id)
    }

    pub fn release_hold(&self, user: &UserId, hold_id: HoldId) -> Result<Hold, WalletError> {
        self.owned_hold(user, hold_id)?;
        self.holds.release_hold(hold_id)
    }

    pub fn capture_hold(
        &self,
        user: &UserId,
        hold_id: HoldId,
        description: &str,
    ) -> Result<Hold, WalletError> {
        self.owned_hold(user, hold_id)?;
        let hold = self.holds.capture_hold(hold_id, description)?;
        self.reevaluate_wallet(hold.wallet_id);
        Ok(hold)
    }

    /// Captures part of a hold; the remainder returns to available balance.
    pub fn capture_partial(
        &self,
        user: &UserId,
        hold_id: HoldId,
        amount: Decimal,
        description: &str,
    ) -> Result<Hold, WalletError> {
        self.owned_hold(user, hold_id)?;
        let hold = self.holds.capture_partial(hold_id, amount, description)?;
        self.reevaluate_wallet(hold.wallet_id);
        Ok(hold)
    }

    pub fn holds_by_reference(&self, reference_type: &str, reference_id: &str) -> Vec<Hold> {
        self.holds.holds_by_reference(reference_type, reference_id)
    }

    /// Decrements the user's balance directly.
    ///
    /// Wallets without overdraft fail if `amount` exceeds the available
    /// balance. Overdraft wallets always succeed and are re-checked for
    /// restriction. A non-empty `reference_id` makes the call idempotent.
    ///
    /// # Errors
    ///
    /// - [`WalletError::InvalidAmount`] - Amount is not positive or above the ceiling.
    /// - [`WalletError::InsufficientFunds`] - Non-overdraft wallet lacks available funds.
    /// - [`WalletError::WalletInactive`] - Wallet is deactivated.
    pub fn debit(
        &self,
        user: &UserId,
        amount: Decimal,
        reference_type: &str,
        reference_id: &str,
        description: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.get_wallet(user)?;
        self.record(Movement::debit(
            wallet.id,
            amount,
            reference_type,
            reference_id,
            description,
        ))
    }

    /// Increments the user's balance directly. A non-empty `reference_id` makes the call idempotent.
    pub fn credit(
        &self,
        user: &UserId,
        amount: Decimal,
        reference_type: &str,
        reference_id: &str,
        description: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.get_wallet(user)?;
        self.record(Movement::credit(
            wallet.id,
            amount,
            reference_type,
            reference_id,
            description,
        ))
    }

    /// Credits the user's earning (driver or provider) wallet.
    ///
    /// Use this for ride and order payouts: it lands on the wallet that
    /// commission and penalties are charged to, so it can lift a restriction.
    pub fn credit_earnings(
        &self,
        user: &UserId,
        amount: Decimal,
        reference_type: &str,
        reference_id: &str,
        description: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.earning_wallet(user)?;
        self.record(Movement::credit(
            wallet.id,
            amount,
            reference_type,
            reference_id,
            description,
        ))
    }

    /// Pays out `amount` from the user's wallet. Never overdraws.
    ///
    /// A non-empty `payout_id` makes the call idempotent.
    pub fn withdraw_funds(
        &self,
        user: &UserId,
        amount: Decimal,
        payout_id: &str,
        description: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.get_wallet(user)?;
        self.record(
            Movement::debit(
                wallet.id,
                amount,
                reference::WITHDRAWAL,
                payout_id,
                description,
            )
            .covered(),
        )
    }

    /// Debits the platform commission for a ride from the user's earning wallet.
    pub fn deduct_commission(
        &self,
        user: &UserId,
        amount: Decimal,
        rate: Decimal,
        ride_id: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.earning_wallet(user)?;
        let description = format!("platform commission ({rate}%) for ride {ride_id}");
        self.record(Movement::debit(
            wallet.id,
            amount,
            reference::RIDE_COMMISSION,
            ride_id,
            &description,
        ))
    }

    pub fn deduct_penalty(
        &self,
        user: &UserId,
        amount: Decimal,
        reason: &str,
        ride_id: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.earning_wallet(user)?;
        info!(owner_id = %user, amount = %amount, reason, ride_id, "applying penalty");
        let description = format!("penalty ({reason}) for {ride_id}");
        self.record(Movement::debit(
            wallet.id,
            amount,
            reference::DRIVER_PENALTY,
            ride_id,
            &description,
        ))
    }

    /// Charges a subscription plan to the earning wallet, once per `period`.
    pub fn deduct_subscription(
        &self,
        user: &UserId,
        amount: Decimal,
        plan: &str,
        period: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.earning_wallet(user)?;
        info!(owner_id = %user, amount = %amount, plan, period, "deducting subscription fee");
        let reference_id = format!("subscription_{plan}_{period}");
        let description = format!("subscription fee for {plan} plan");
        self.record(Movement::debit(
            wallet.id,
            amount,
            reference::SUBSCRIPTION_FEE,
            &reference_id,
            &description,
        ))
    }

    /// Records cash a driver collected from a rider for `ride_id`.
    ///
    /// Opens a driver wallet when the user has no earning wallet yet.
    pub fn record_cash_collection(
        &self,
        user: &UserId,
        amount: Decimal,
        ride_id: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = match self.earning_wallet(user) {
            Err(WalletError::WalletNotFound) => {
                match self.create_wallet(user, WalletType::Driver, Decimal::ZERO) {
                    Err(WalletError::WalletAlreadyExists) => self.earning_wallet(user)?,
                    other => other?,
                }
            }
            other => other?,
        };
        let description = format!("cash collected from ride {ride_id}");
        self.record(Movement::credit(
            wallet.id,
            amount,
            reference::CASH_COLLECTION,
            ride_id,
            &description,
        ))
    }

    /// Records cash a driver handed over to the platform. Never overdraws.
    pub fn record_cash_payment(
        &self,
        user: &UserId,
        amount: Decimal,
        settlement_id: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let wallet = self.earning_wallet(user)?;
        let description = format!("cash settlement {settlement_id}");
        self.record(
            Movement::debit(
                wallet.id,
                amount,
                reference::CASH_SETTLEMENT,
                settlement_id,
                &description,
            )
            .covered(),
        )
    }

    /// Checks the earning wallet covers `amount`. Returns the available balance.
    ///
    /// A user without an earning wallet has nothing available.
    pub fn validate_balance(&self, user: &UserId, amount: Decimal) -> Result<Decimal, WalletError> {
        let available = match self.earning_wallet(user) {
            Ok(wallet) => wallet.available_balance(),
            Err(WalletError::WalletNotFound) => Decimal::ZERO,
            Err(e) => return Err(e),
        };
        if available < amount {
            warn!(
                owner_id = %user,
                required = %amount,
                available = %available,
                "insufficient earning balance"
            );
            return Err(WalletError::InsufficientFunds {
                available,
                required: amount,
            });
        }
        Ok(available)
    }

    /// Moves `amount` from one user's wallet to another's.
    ///
    /// The source must cover `amount` from its available balance; overdraft
    /// allowances do not apply.
    ///
    /// # Errors
    ///
    /// - [`WalletError::SameWallet`] - Both users resolve to the same wallet.
    /// - [`WalletError::InsufficientFunds`] - Source cannot cover the debit.
    /// - [`WalletError::TransferPartialFailure`] - Credit failed; source was refunded.
    /// - [`WalletError::ReconciliationRequired`] - Credit and refund both failed.
    pub fn transfer_funds(
        &self,
        from: &UserId,
        to: &UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<Transfer, WalletError> {
        self.validate_amount(amount)?;
        let source = self.get_wallet(from)?;
        let target = self.get_wallet(to)?;
        if source.id == target.id {
            return Err(WalletError::SameWallet);
        }

        // Ascending id order; opposite transfers cannot wait on each other.
        let (low, high) = if source.id < target.id {
            (source.id, target.id)
        } else {
            (target.id, source.id)
        };
        let low_lock = self.transfer_lock(low);
        let high_lock = self.transfer_lock(high);
        let _low = low_lock
            .try_lock_for(self.config.lock_timeout())
            .ok_or(WalletError::LockTimeout)?;
        let _high = high_lock
            .try_lock_for(self.config.lock_timeout())
            .ok_or(WalletError::LockTimeout)?;

        let reference_id = format!("transfer_{}", self.transfer_ids.next());
        let debit = self.apply_movement(&Movement {
            kind: TransactionKind::TransferOut,
            ..Movement::debit(
                source.id,
                amount,
                reference::TRANSFER,
                &reference_id,
                description,
            )
            .covered()
        })?;

        let credit = match self.apply_movement(&Movement {
            kind: TransactionKind::TransferIn,
            ..Movement::credit(
                target.id,
                amount,
                reference::TRANSFER,
                &reference_id,
                description,
            )
        }) {
            Ok(credit) => credit,
            Err(credit_err) => {
                return Err(self.compensate(source.id, amount, &reference_id, credit_err));
            }
        };

        info!(
            from = %source.id,
            to = %target.id,
            amount = %amount,
            reference_id = %reference_id,
            "transfer completed"
        );
        Ok(Transfer {
            reference_id,
            debit,
            credit,
        })
    }

    /// Charges the user through the payment port and credits the wallet.
    ///
    /// The receipt is kept as a [`PendingTopUp`] until the credit lands. If
    /// the credit fails after the charge, the error carries the provider
    /// transaction id and [`WalletService::retry_top_ups`] replays it.
    ///
    /// # Errors
    ///
    /// - [`WalletError::Payment`] - Provider declined or failed; nothing was charged.
    /// - [`WalletError::TopUpUnconfirmed`] - Charged but not yet credited.
    pub fn top_up(
        &self,
        user: &UserId,
        amount: Decimal,
        method: &str,
    ) -> Result<LedgerEntry, WalletError> {
        self.validate_amount(amount)?;
        let wallet = self.get_wallet(user)?;
        if !wallet.is_active {
            return Err(WalletError::WalletInactive);
        }

        let receipt = self.payments.process_payment(&PaymentRequest {
            user_id: user.clone(),
            amount,
            currency: wallet.currency.clone(),
            method: method.to_string(),
            timeout: self.config.payment_timeout(),
        })?;
        let txn_id = receipt.provider_transaction_id;
        self.pending_top_ups.insert(
            txn_id.clone(),
            PendingTopUp {
                user_id: user.clone(),
                amount: receipt.amount,
                provider_transaction_id: txn_id.clone(),
                charged_at: Utc::now(),
                last_error: None,
            },
        );

        self.confirm_top_up(user, receipt.amount, &txn_id)
            .map_err(|e| {
                error!(
                    owner_id = %user,
                    amount = %receipt.amount,
                    provider_transaction_id = %txn_id,
                    error = %e,
                    "top-up charged but not credited"
                );
                self.note_top_up_failure(&txn_id, &e);
                WalletError::TopUpUnconfirmed {
                    provider_transaction_id: txn_id.clone(),
                    amount: receipt.amount,
                    reason: e.to_string(),
                }
            })
    }

    /// Payment confirmation callback. Idempotent on `provider_transaction_id`.
    pub fn confirm_top_up(
        &self,
        user: &UserId,
        amount: Decimal,
        provider_transaction_id: &str,
    ) -> Result<LedgerEntry, WalletError> {
        let entry = self.credit(
            user,
            amount,
            reference::TOPUP,
            provider_transaction_id,
            "wallet top-up",
        )?;
        self.pending_top_ups.remove(provider_transaction_id);
        Ok(entry)
    }

    /// Charged top-ups still waiting for their credit, oldest first.
    pub fn pending_top_ups(&self) -> Vec<PendingTopUp> {
        let mut pending: Vec<PendingTopUp> = self
            .pending_top_ups
            .iter()
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by_key(|p| p.charged_at);
        pending
    }

    /// Replays every pending top-up credit. Returns how many landed.
    pub fn retry_top_ups(&self) -> usize {
        let mut confirmed = 0;
        for pending in self.pending_top_ups() {
            match self.confirm_top_up(
                &pending.user_id,
                pending.amount,
                &pending.provider_transaction_id,
            ) {
                Ok(_) => confirmed += 1,
                Err(e) => {
                    debug!(
                        provider_transaction_id = %pending.provider_transaction_id,
                        error = %e,
                        "top-up credit still failing"
                    );
                    self.note_top_up_failure(&pending.provider_transaction_id, &e);
                }
            }
        }
        if confirmed > 0 {
            info!(confirmed, "pending top-ups credited");
        }
        confirmed
    }

    pub fn history(
        &self,
        user: &UserId,
        query: &HistoryQuery,
    ) -> Result<Page<LedgerEntry>, WalletError> {
        let wallet = self.get_wallet(user)?;
        Ok(self.ledger.history(wallet.id, query)?)
    }

    /// One ledger entry of any of the user's wallets.
    ///
    /// An entry on someone else's wallet is reported as [`WalletError::EntryNotFound`].
    pub fn get_transaction(
        &self,
        user: &UserId,
        entry_id: EntryId,
    ) -> Result<LedgerEntry, WalletError> {
        let entry = self
            .ledger
            .entry(entry_id)?
            .ok_or(WalletError::EntryNotFound)?;
        let owned = self
            .store
            .find_by_owner(user)?
            .iter()
            .any(|w| w.id == entry.wallet_id);
        if !owned {
            return Err(WalletError::EntryNotFound);
        }
        Ok(entry)
    }

    /// Compares each of the user's wallets with its ledger.
    ///
    /// Movements still in flight, or parked in the ledger backlog, show up
    /// as a discrepancy until their entry is written.
    pub fn audit_balances(&self, user: &UserId) -> Result<Vec<BalanceAudit>, WalletError> {
        let wallets = self.store.find_by_owner(user)?;
        if wallets.is_empty() {
            return Err(WalletError::WalletNotFound);
        }

        let mut audits = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let ledger_balance = self
                .ledger
                .reconstruct_balance(wallet.id, wallet.initial_balance)?;
            let audit = BalanceAudit {
                wallet_id: wallet.id,
                wallet_type: wallet.wallet_type,
                balance: wallet.balance,
                ledger_balance,
                discrepancy: wallet.balance - ledger_balance,
            };
            if audit.is_consistent() {
                debug!(wallet_id = %wallet.id, balance = %wallet.balance, "balance audit passed");
            } else {
                warn!(
                    wallet_id = %wallet.id,
                    balance = %audit.balance,
                    ledger_balance = %audit.ledger_balance,
                    discrepancy = %audit.discrepancy,
                    pending = self.ledger.pending(),
                    "balance does not match ledger"
                );
            }
            audits.push(audit);
        }
        Ok(audits)
    }

    /// Expires due holds. Returns how many were expired.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.holds.sweep_expired(now).len()
    }

    /// Retries parked ledger writes. Returns how many were written.
    pub fn flush_ledger(&self) -> usize {
        self.ledger.retry_pending()
    }

    /// Drops settled holds and replay receipts older than the retention window.
    ///
    /// Returns how many records were dropped. Pending top-ups are never pruned.
    pub fn prune_settled(&self, now: DateTime<Utc>) -> usize {
        // A retention too large for chrono keeps everything.
        let Ok(retention) = chrono::Duration::from_std(self.config.retention()) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };

        let holds = self.holds.prune_settled(cutoff);
        let mut receipts = 0;
        self.movements.retain(|_, entry| {
            let keep = entry.created_at >= cutoff;
            if !keep {
                receipts += 1;
            }
            keep
        });
        if holds + receipts > 0 {
            debug!(holds, receipts, %cutoff, "settled records pruned");
        }
        holds + receipts
    }

    /// Deactivates every wallet of `user`. Active holds stay in place.
    pub fn deactivate(&self, user: &UserId) -> Result<Vec<Wallet>, WalletError> {
        let wallets = self.store.find_by_owner(user)?;
        if wallets.is_empty() {
            return Err(WalletError::WalletNotFound);
        }
        let mut deactivated = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let updated = self.store.set_active(wallet.id, false)?;
            info!(wallet_id = %updated.id, owner_id = %user, "wallet deactivated");
            deactivated.push(updated);
        }
        Ok(deactivated)
    }

    fn validate_amount(&self, amount: Decimal) -> Result<(), WalletError> {
        if amount <= Decimal::ZERO || amount > self.config.max_amount {
            return Err(WalletError::InvalidAmount(amount));
        }
        Ok(())
    }

    /// The owner's earliest driver or provider wallet.
    fn earning_wallet(&self, user: &UserId) -> Result<Wallet, WalletError> {
        self.store
            .find_by_owner(user)?
            .into_iter()
            .find(|w| w.wallet_type.is_restrictable())
            .ok_or(WalletError::WalletNotFound)
    }

    /// Fails with `HoldNotFound` unless the hold sits on an active wallet owned by `user`.
    fn owned_hold(&self, user: &UserId, hold_id: HoldId) -> Result<(), WalletError> {
        let hold = self.holds.get(hold_id)?;
        let wallet = self
            .store
            .find_by_owner(user)?
            .into_iter()
            .find(|w| w.id == hold.wallet_id)
            .ok_or(WalletError::HoldNotFound)?;
        if !wallet.is_active {
            return Err(WalletError::WalletInactive);
        }
        Ok(())
    }

    fn transfer_lock(&self, wallet_id: WalletId) -> Arc<Mutex<()>> {
        Arc::clone(self.transfer_locks.entry(wallet_id).or_default().value())
    }

    fn note_top_up_failure(&self, provider_transaction_id: &str, err: &WalletError) {
        if let Some(mut pending) = self.pending_top_ups.get_mut(provider_transaction_id) {
            pending.last_error = Some(err.to_string());
        }
    }

    /// Validated, idempotent [`Self::apply_movement`].
    ///
    /// An empty `reference_id` opts out of idempotency. The receipt slot stays
    /// locked while the movement runs, so a concurrent duplicate waits for the
    /// first receipt.
    fn record(&self, movement: Movement<'_>) -> Result<LedgerEntry, WalletError> {
        self.validate_amount(movement.amount)?;
        if movement.reference_id.is_empty() {
            return self.apply_movement(&movement);
        }
        match self.movements.entry(movement.key()) {
            Entry::Occupied(slot) => {
                debug!(
                    wallet_id = %movement.wallet_id,
                    reference_type = movement.reference_type,
                    reference_id = movement.reference_id,
                    "replaying movement receipt"
                );
                Ok(slot.get().clone())
            }
            Entry::Vacant(slot) => {
                let entry = self.apply_movement(&movement)?;
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    /// Guarded balance change, ledger append and restriction re-check.
    fn apply_movement(&self, movement: &Movement<'_>) -> Result<LedgerEntry, WalletError> {
        let amount = movement.amount;
        let (before, after) = retry_on_conflict(&self.config.retry_policy(), || {
            let wallet = self.store.get(movement.wallet_id)?;
            if !wallet.is_active {
                return Err(WalletError::WalletInactive);
            }
            let delta = match movement.direction {
                Direction::In => amount,
                Direction::Out => {
                    let available = wallet.available_balance();
                    let may_overdraw = movement.overdraft && wallet.allows_overdraft();
                    if !may_overdraw && available < amount {
                        return Err(WalletError::InsufficientFunds {
                            available,
                            required: amount,
                        });
                    }
                    -amount
                }
            };
            let after = self
                .store
                .apply_delta(movement.wallet_id, delta, Decimal::ZERO, wallet.version)?;
            Ok((wallet, after))
        })?;

        info!(
            wallet_id = %after.id,
            kind = %movement.kind,
            amount = %amount,
            balance = %after.balance,
            reference_type = movement.reference_type,
            reference_id = movement.reference_id,
            "funds moved"
        );
        if after.balance < Decimal::ZERO && movement.direction == Direction::Out {
            warn!(wallet_id = %after.id, balance = %after.balance, "wallet overdrawn");
        }

        let entry = self.ledger.append(EntryDraft {
            wallet_id: after.id,
            kind: movement.kind,
            amount,
            balance_before: before.balance,
            balance_after: after.balance,
            reference_type: movement.reference_type.to_string(),
            reference_id: movement.reference_id.to_string(),
            description: movement.description.to_string(),
        });
        self.reevaluate(&after);
        Ok(entry)
    }

    /// Restriction errors after a committed movement are logged only.
    fn reevaluate(&self, wallet: &Wallet) {
        if !wallet.wallet_type.is_restrictable() {
            return;
        }
        if let Err(e) = self.policy.evaluate(wallet.id) {
            warn!(wallet_id = %wallet.id, error = %e, "restriction check failed");
        }
    }

    fn reevaluate_wallet(&self, wallet_id: WalletId) {
        match self.store.get(wallet_id) {
            Ok(wallet) => self.reevaluate(&wallet),
            Err(e) => warn!(wallet_id = %wallet_id, error = %e, "restriction check failed"),
        }
    }

    /// Refunds the source of a transfer whose credit leg failed.
    fn compensate(
        &self,
        source: WalletId,
        amount: Decimal,
        reference_id: &str,
        credit_err: WalletError,
    ) -> WalletError {
        warn!(
            wallet_id = %source,
            amount = %amount,
            reference_id,
            error = %credit_err,
            "transfer credit failed, compensating"
        );
        let refund = self.apply_movement(&Movement::credit(
            source,
            amount,
            reference::TRANSFER,
            reference_id,
            "transfer reversal",
        ));
        match refund {
            Ok(_) => WalletError::TransferPartialFailure {
                reason: credit_err.to_string(),
            },
            Err(refund_err) => {
                error!(
                    wallet_id = %source,
                    amount = %amount,
                    reference_id,
                    credit_error = %credit_err,
                    refund_error = %refund_err,
                    "transfer compensation failed, reconciliation required"
                );
                WalletError::ReconciliationRequired {
                    wallet_id: source,
                    amount,
                    reason: refund_err.to_string(),
                }
            }
        }
    }
}

impl Default for WalletService {
    fn default() -> Self {
        Self::new(WalletConfig::default())
    }
}
