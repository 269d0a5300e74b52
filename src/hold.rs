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

//! Fund holds.
//!
//! Implemented State Machine
//!
//! ```text
//!  Active ──capture──► Captured
//!    │
//!    ├────release────► Released
//!    │
//!    └─────expire────► Expired
//! ```
//!
//! Each hold sits behind its own [`Mutex`]. Settling a hold keeps that mutex
//! for the whole wallet mutation, so of two racing settlements exactly one
//! observes `Active`; the other gets [`WalletError::HoldNotActive`].

use crate::base::{HoldId, IdSequence, WalletId};
use crate::config::RetryPolicy;
use crate::error::WalletError;
use crate::ledger::{EntryDraft, LedgerRecorder, TransactionKind};
use crate::store::{WalletStore, retry_on_conflict};
use crate::wallet::Wallet;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    Captured,
    Released,
    Expired,
}

impl HoldStatus {
    pub fn is_terminal(self) -> bool {
        self != HoldStatus::Active
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldStatus::Active => write!(f, "active"),
            HoldStatus::Captured => write!(f, "captured"),
            HoldStatus::Released => write!(f, "released"),
            HoldStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Reservation against a wallet's available balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub wallet_id: WalletId,
    pub amount: Decimal,
    pub reference_type: String,
    pub reference_id: String,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Set when captured; may be less than `amount` for a partial capture.
    pub captured_amount: Option<Decimal>,
}

impl Hold {
    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at <= now
    }
}

/// Idempotency key of a hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HoldKey {
    wallet_id: WalletId,
    reference_type: String,
    reference_id: String,
}

/// Terminal transition requested for an active hold.
#[derive(Debug, Clone, Copy)]
enum Settlement {
    Capture(Decimal),
    Release,
    Expire,
}

/// Tunables for [`HoldManager`].
#[derive(Debug, Clone)]
pub struct HoldSettings {
    pub default_ttl: Duration,
    pub max_amount: Decimal,
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Creates and settles holds.
pub struct HoldManager {
    store: Arc<dyn WalletStore>,
    ledger: Arc<LedgerRecorder>,
    holds: DashMap<HoldId, Arc<Mutex<Hold>>>,
    references: DashMap<HoldKey, HoldId>,
    ids: IdSequence,
    settings: HoldSettings,
}

impl HoldManager {
    pub fn new(
        store: Arc<dyn WalletStore>,
        ledger: Arc<LedgerRecorder>,
        settings: HoldSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            holds: DashMap::new(),
            references: DashMap::new(),
            ids: IdSequence::new(),
            settings,
        }
    }

    /// Reserves `amount` with the default lifetime.
    ///
    /// # Errors
    ///
    /// - [`WalletError::InvalidAmount`] - Amount is not positive or above the ceiling.
    /// - [`WalletError::InsufficientFunds`] - Available balance is below `amount`.
    /// - [`WalletError::WalletInactive`] - Wallet is deactivated.
    pub fn hold_funds(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Hold, WalletError> {
        self.hold_funds_for(
            wallet_id,
            amount,
            reference_type,
            reference_id,
            self.settings.default_ttl,
        )
    }

    /// Reserves `amount` until `now + ttl`.
    ///
    /// Repeating the call with the same `(wallet_id, reference_type,
    /// reference_id)` returns the original hold, whatever its status, and
    /// reserves nothing.
    pub fn hold_funds_for(
        &self,
        wallet_id: WalletId,
        amount: Decimal,
        reference_type: &str,
        reference_id: &str,
        ttl: Duration,
    ) -> Result<Hold, WalletError> {
        if amount <= Decimal::ZERO || amount > self.settings.max_amount {
            return Err(WalletError::InvalidAmount(amount));
        }

        let key = HoldKey {
            wallet_id,
            reference_type: reference_type.to_string(),
            reference_id: reference_id.to_string(),
        };

        // The vacant entry stays locked until the hold is registered, so a
        // concurrent duplicate waits here and then sees the occupied slot.
        let (hold, before) = match self.references.entry(key) {
            Entry::Occupied(slot) => {
                let existing = self.snapshot(*slot.get())?;
                debug!(hold_id = %existing.id, reference_id, "hold already exists for reference");
                return Ok(existing);
            }
            Entry::Vacant(slot) => {
                let before = retry_on_conflict(&self.settings.retry, || {
                    let wallet = self.store.get(wallet_id)?;
                    if !wallet.is_active {
                        return Err(WalletError::WalletInactive);
                    }
                    let available = wallet.available_balance();
                    if available < amount {
                        return Err(WalletError::InsufficientFunds {
                            available,
                            required: amount,
                        });
                    }
                    self.store
                        .apply_delta(wallet_id, Decimal::ZERO, amount, wallet.version)?;
                    Ok(wallet)
                })?;

                let now = Utc::now();
                let expires_at = chrono::Duration::from_std(ttl)
                    .ok()
                    .and_then(|ttl| now.checked_add_signed(ttl))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let hold = Hold {
                    id: HoldId(self.ids.next()),
                    wallet_id,
                    amount,
                    reference_type: reference_type.to_string(),
                    reference_id: reference_id.to_string(),
                    status: HoldStatus::Active,
                    created_at: now,
                    expires_at,
                    settled_at: None,
                    captured_amount: None,
                };
                self.holds
                    .insert(hold.id, Arc::new(Mutex::new(hold.clone())));
                slot.insert(hold.id);
                (hold, before)
            }
        };

        info!(
            hold_id = %hold.id,
            wallet_id = %wallet_id,
            amount = %amount,
            reference_type,
            reference_id,
            "funds held"
        );
        self.ledger.append(EntryDraft {
            wallet_id,
            kind: TransactionKind::Hold,
            amount,
            balance_before: before.balance,
            balance_after: before.balance,
            reference_type: hold.reference_type.clone(),
            reference_id: hold.reference_id.clone(),
            description: format!("hold for {reference_type} {reference_id}"),
        });
        Ok(hold)
    }

    /// Returns the reservation to available balance.
    ///
    /// # Errors
    ///
    /// - [`WalletError::HoldNotFound`] - Unknown hold.
    /// - [`WalletError::HoldNotActive`] - Hold already captured, released or expired.
    pub fn release_hold(&self, hold_id: HoldId) -> Result<Hold, WalletError> {
        self.settle(hold_id, Settlement::Release, "hold released")
    }

    /// Converts the full hold into a permanent debit.
    pub fn capture_hold(&self, hold_id: HoldId, description: &str) -> Result<Hold, WalletError> {
        let amount = self.snapshot(hold_id)?.amount;
        self.capture_partial(hold_id, amount, description)
    }

    /// Debits `amount` (at most the held amount) and releases the rest.
    pub fn capture_partial(
        &self,
        hold_id: HoldId,
        amount: Decimal,
        description: &str,
    ) -> Result<Hold, WalletError> {
        if amount <= Decimal::ZERO {
            return Err(WalletError::InvalidAmount(amount));
        }
        self.settle(hold_id, Settlement::Capture(amount), description)
    }

    /// Expires one hold if it is still active and past `expires_at`.
    ///
    /// Losing a race against capture or release is not an error: returns `Ok(None)`.
    pub fn expire_hold(
        &self,
        hold_id: HoldId,
        now: DateTime<Utc>,
    ) -> Result<Option<Hold>, WalletError> {
        if !self.snapshot(hold_id)?.is_due(now) {
            return Ok(None);
        }
        match self.settle(hold_id, Settlement::Expire, "hold expired") {
            Ok(hold) => Ok(Some(hold)),
            Err(WalletError::HoldNotActive(status)) => {
                debug!(hold_id = %hold_id, %status, "hold settled before expiry");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Expires every due hold. Returns the holds this pass expired.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Hold> {
        let due: Vec<HoldId> = self
            .holds
            .iter()
            .filter_map(|r| {
                let hold = r.value().try_lock()?;
                hold.is_due(now).then_some(hold.id)
            })
            .collect();

        let mut expired = Vec::new();
        for hold_id in due {
            match self.expire_hold(hold_id, now) {
                Ok(Some(hold)) => expired.push(hold),
                Ok(None) => {}
                Err(e) => {
                    // Left active; the next sweep picks it up again.
                    debug!(hold_id = %hold_id, error = %e, "hold expiry deferred");
                }
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired holds swept");
        }
        expired
    }

    /// Forgets holds settled before `cutoff`. Returns how many were dropped.
    ///
    /// A pruned reference no longer deduplicates: repeating its `hold_funds`
    /// call afterwards opens a new hold.
    pub fn prune_settled(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: HashSet<HoldId> = self
            .holds
            .iter()
            .filter_map(|r| {
                let hold = r.value().try_lock()?;
                let settled_before = hold.settled_at.is_some_and(|at| at < cutoff);
                (hold.status.is_terminal() && settled_before).then_some(hold.id)
            })
            .collect();
        if stale.is_empty() {
            return 0;
        }

        // References first, so a lookup never finds an id whose hold is gone.
        self.references.retain(|_, id| !stale.contains(&*id));
        for hold_id in &stale {
            self.holds.remove(hold_id);
        }
        debug!(count = stale.len(), "settled holds pruned");
        stale.len()
    }

    pub fn get(&self, hold_id: HoldId) -> Result<Hold, WalletError> {
        self.snapshot(hold_id)
    }

    pub fn holds_by_reference(&self, reference_type: &str, reference_id: &str) -> Vec<Hold> {
        let ids: Vec<HoldId> = self
            .references
            .iter()
            .filter(|r| r.key().reference_type == reference_type && r.key().reference_id == reference_id)
            .map(|r| *r.value())
            .collect();
        let mut holds: Vec<Hold> = ids
            .into_iter()
            .filter_map(|id| self.snapshot(id).ok())
            .collect();
        holds.sort_by_key(|h| h.id);
        holds
    }

    pub fn active_holds(&self, wallet_id: WalletId) -> Vec<Hold> {
        let cells: Vec<Arc<Mutex<Hold>>> =
            self.holds.iter().map(|r| Arc::clone(r.value())).collect();
        let mut holds: Vec<Hold> = cells
            .iter()
            .map(|cell| cell.lock().clone())
            .filter(|h| h.wallet_id == wallet_id && h.is_active())
            .collect();
        holds.sort_by_key(|h| h.id);
        holds
    }

    fn cell(&self, hold_id: HoldId) -> Result<Arc<Mutex<Hold>>, WalletError> {
        self.holds
            .get(&hold_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(WalletError::HoldNotFound)
    }

    fn snapshot(&self, hold_id: HoldId) -> Result<Hold, WalletError> {
        let cell = self.cell(hold_id)?;
        let hold = cell
            .try_lock_for(self.settings.lock_timeout)
            .ok_or(WalletError::LockTimeout)?;
        Ok(hold.clone())
    }

    /// Shared terminal transition. Holds the hold's mutex across the wallet mutation.
    fn settle(
        &self,
        hold_id: HoldId,
        settlement: Settlement,
        description: &str,
    ) -> Result<Hold, WalletError> {
        let cell = self.cell(hold_id)?;
        let mut hold = cell
            .try_lock_for(self.settings.lock_timeout)
            .ok_or(WalletError::LockTimeout)?;
        if hold.status.is_terminal() {
            return Err(WalletError::HoldNotActive(hold.status));
        }

        let (balance_delta, status) = match settlement {
            Settlement::Capture(amount) if amount > hold.amount => {
                return Err(WalletError::InvalidAmount(amount));
            }
            Settlement::Capture(amount) => (-amount, HoldStatus::Captured),
            Settlement::Release => (Decimal::ZERO, HoldStatus::Released),
            Settlement::Expire => (Decimal::ZERO, HoldStatus::Expired),
        };

        let (before, after) = retry_on_conflict(&self.settings.retry, || {
            let wallet = self.store.get(hold.wallet_id)?;
            let after =
                self.store
                    .apply_delta(hold.wallet_id, balance_delta, -hold.amount, wallet.version)?;
            Ok((wallet, after))
        })?;

        let now = Utc::now();
        hold.status = status;
        hold.settled_at = Some(now);
        if let Settlement::Capture(amount) = settlement {
            hold.captured_amount = Some(amount);
        }
        let settled = hold.clone();
        drop(hold);

        info!(
            hold_id = %settled.id,
            wallet_id = %settled.wallet_id,
            amount = %settled.amount,
            status = %settled.status,
            "hold settled"
        );
        self.record_settlement(&settled, settlement, &before, &after, description);
        Ok(settled)
    }

    fn record_settlement(
        &self,
        hold: &Hold,
        settlement: Settlement,
        before: &Wallet,
        after: &Wallet,
        description: &str,
    ) {
        let draft = |kind, amount| EntryDraft {
            wallet_id: hold.wallet_id,
            kind,
            amount,
            balance_before: before.balance,
            balance_after: after.balance,
            reference_type: hold.reference_type.clone(),
            reference_id: hold.reference_id.clone(),
            description: description.to_string(),
        };

        match settlement {
            Settlement::Capture(amount) => {
                self.ledger.append(draft(TransactionKind::Capture, amount));
                let remainder = hold.amount - amount;
                if remainder > Decimal::ZERO {
                    let mut release = draft(TransactionKind::Release, remainder);
                    release.balance_before = after.balance;
                    release.description = format!("uncaptured remainder of hold {}", hold.id);
                    self.ledger.append(release);
                }
            }
            Settlement::Release | Settlement::Expire => {
                self.ledger.append(draft(TransactionKind::Release, hold.amount));
            }
        }
    }
}
