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

//! Wallet storage.
//!
//! The [`WalletStore`] is the only component allowed to change a wallet row.
//! Every write is a compare-and-swap on [`Wallet::version`]: callers read a
//! snapshot, decide, and submit the change together with the version they
//! decided on. If anything committed in between, the store answers
//! [`WalletError::Conflict`] and the caller re-reads. [`retry_on_conflict`]
//! wraps that loop with bounded exponential backoff.
//!
//! # Thread Safety
//!
//! [`MemoryWalletStore`] keeps rows in a [`DashMap`] of per-wallet
//! [`Mutex`]es. The version check and the write happen under the row mutex,
//! which is only held for the read-modify-write itself.

use crate::base::{IdSequence, UserId, WalletId};
use crate::config::RetryPolicy;
use crate::error::WalletError;
use crate::wallet::{NewWallet, Standing, Wallet};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Durable per-owner wallet records.
pub trait WalletStore: Send + Sync {
    /// Creates a wallet, failing with [`WalletError::WalletAlreadyExists`] if
    /// the owner already has one of the same type.
    fn create_wallet(&self, new: NewWallet) -> Result<Wallet, WalletError>;

    fn get(&self, wallet_id: WalletId) -> Result<Wallet, WalletError>;

    /// The owner's wallets in creation order. Empty if none.
    fn find_by_owner(&self, owner_id: &UserId) -> Result<Vec<Wallet>, WalletError>;

    /// Adds `balance_delta` and `held_delta` if the row is still at `expected_version`.
    fn apply_delta(
        &self,
        wallet_id: WalletId,
        balance_delta: Decimal,
        held_delta: Decimal,
        expected_version: u64,
    ) -> Result<Wallet, WalletError>;

    /// Replaces the restriction fields if the row is still at `expected_version`.
    fn update_standing(
        &self,
        wallet_id: WalletId,
        standing: Standing,
        expected_version: u64,
    ) -> Result<Wallet, WalletError>;

    fn set_active(&self, wallet_id: WalletId, active: bool) -> Result<Wallet, WalletError>;
}

/// Runs `op` until it stops returning [`WalletError::Conflict`] or
/// [`WalletError::LockTimeout`], at most `policy.max_attempts` times.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, WalletError>
where
    F: FnMut() -> Result<T, WalletError>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Err(e @ (WalletError::Conflict | WalletError::LockTimeout))
                if attempt < policy.max_attempts =>
            {
                trace!(attempt, error = %e, "guarded write contended, retrying");
                std::thread::sleep(policy.backoff(attempt));
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// In-memory [`WalletStore`].
#[derive(Debug)]
pub struct MemoryWalletStore {
    wallets: DashMap<WalletId, Arc<Mutex<Wallet>>>,
    /// Owner index; the entry lock makes the one-wallet-per-type check atomic.
    owners: DashMap<UserId, Vec<WalletId>>,
    ids: IdSequence,
    lock_timeout: Duration,
}

impl MemoryWalletStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            wallets: DashMap::new(),
            owners: DashMap::new(),
            ids: IdSequence::new(),
            lock_timeout,
        }
    }

    /// Every wallet snapshot, in no particular order.
    pub fn snapshot_all(&self) -> Vec<Wallet> {
        let rows: Vec<Arc<Mutex<Wallet>>> =
            self.wallets.iter().map(|r| Arc::clone(r.value())).collect();
        rows.iter().map(|row| row.lock().clone()).collect()
    }

    fn row(&self, wallet_id: WalletId) -> Result<Arc<Mutex<Wallet>>, WalletError> {
        // Clone the Arc so the DashMap shard guard is released before locking the row.
        self.wallets
            .get(&wallet_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(WalletError::WalletNotFound)
    }

    /// Locks the row, checks the version, applies `mutate`, bumps the version.
    fn guarded_write<F>(
        &self,
        wallet_id: WalletId,
        expected_version: u64,
        mutate: F,
    ) -> Result<Wallet, WalletError>
    where
        F: FnOnce(&mut Wallet) -> Result<(), WalletError>,
    {
        let row = self.row(wallet_id)?;
        let mut wallet = row
            .try_lock_for(self.lock_timeout)
            .ok_or(WalletError::LockTimeout)?;
        if wallet.version != expected_version {
            return Err(WalletError::Conflict);
        }

        mutate(&mut wallet)?;
        wallet.version += 1;
        wallet.updated_at = Utc::now();
        wallet.assert_invariants();
        Ok(wallet.clone())
    }
}

impl Default for MemoryWalletStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl WalletStore for MemoryWalletStore {
    fn create_wallet(&self, new: NewWallet) -> Result<Wallet, WalletError> {
        if new.initial_balance < Decimal::ZERO {
            return Err(WalletError::InvalidAmount(new.initial_balance));
        }

        let mut owned = match self.owners.entry(new.owner_id.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => entry.insert(Vec::new()),
        };
        for id in owned.iter() {
            let existing = self.row(*id)?;
            if existing.lock().wallet_type == new.wallet_type {
                return Err(WalletError::WalletAlreadyExists);
            }
        }

        let wallet = Wallet::open(WalletId(self.ids.next()), new);
        self.wallets
            .insert(wallet.id, Arc::new(Mutex::new(wallet.clone())));
        owned.push(wallet.id);
        Ok(wallet)
    }

    fn get(&self, wallet_id: WalletId) -> Result<Wallet, WalletError> {
        let row = self.row(wallet_id)?;
        let wallet = row
            .try_lock_for(self.lock_timeout)
            .ok_or(WalletError::LockTimeout)?;
        Ok(wallet.clone())
    }

    fn find_by_owner(&self, owner_id: &UserId) -> Result<Vec<Wallet>, WalletError> {
        let ids = match self.owners.get(owner_id) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        ids.into_iter().map(|id| self.get(id)).collect()
    }

    fn apply_delta(
        &self,
        wallet_id: WalletId,
        balance_delta: Decimal,
        held_delta: Decimal,
        expected_version: u64,
    ) -> Result<Wallet, WalletError> {
        self.guarded_write(wallet_id, expected_version, |wallet| {
            let held = wallet.held_balance + held_delta;
            if held < Decimal::ZERO {
                return Err(WalletError::InvariantViolation(format!(
                    "held balance of wallet {wallet_id} would become {held}"
                )));
            }
            wallet.balance += balance_delta;
            wallet.held_balance = held;
            Ok(())
        })
    }

    fn update_standing(
        &self,
        wallet_id: WalletId,
        standing: Standing,
        expected_version: u64,
    ) -> Result<Wallet, WalletError> {
        self.guarded_write(wallet_id, expected_version, |wallet| {
            wallet.is_restricted = standing.is_restricted;
            wallet.restriction_reason = standing.restriction_reason;
            wallet.restricted_at = standing.restricted_at;
            wallet.account_status = standing.account_status;
            Ok(())
        })
    }

    fn set_active(&self, wallet_id: WalletId, active: bool) -> Result<Wallet, WalletError> {
        let row = self.row(wallet_id)?;
        let mut wallet = row
            .try_lock_for(self.lock_timeout)
            .ok_or(WalletError::LockTimeout)?;
        wallet.is_active = active;
        wallet.version += 1;
        wallet.updated_at = Utc::now();
        Ok(wallet.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::WalletType;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn new_wallet(owner: &str, wallet_type: WalletType, balance: Decimal) -> NewWallet {
        NewWallet {
            owner_id: UserId::from(owner),
            wallet_type,
            initial_balance: balance,
            currency: "INR".into(),
            min_balance_threshold: Decimal::ZERO,
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = MemoryWalletStore::default();
        let created = store
            .create_wallet(new_wallet("u1", WalletType::Rider, dec!(1000)))
            .unwrap();

        let fetched = store.get(created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.balance, dec!(1000));
    }

    #[test]
    fn second_wallet_of_same_type_is_rejected() {
        let store = MemoryWalletStore::default();
        store
            .create_wallet(new_wallet("u1", WalletType::Driver, Decimal::ZERO))
            .unwrap();

        let result = store.create_wallet(new_wallet("u1", WalletType::Driver, Decimal::ZERO));
        assert_eq!(result, Err(WalletError::WalletAlreadyExists));

        // A different type for the same owner is fine.
        store
            .create_wallet(new_wallet("u1", WalletType::Rider, Decimal::ZERO))
            .unwrap();
        assert_eq!(store.find_by_owner(&UserId::from("u1")).unwrap().len(), 2);
    }

    #[test]
    fn negative_initial_balance_is_rejected() {
        let store = MemoryWalletStore::default();
        let result = store.create_wallet(new_wallet("u1", WalletType::Rider, dec!(-1)));
        assert_eq!(result, Err(WalletError::InvalidAmount(dec!(-1))));
    }

    #[test]
    fn get_unknown_wallet_fails() {
        let store = MemoryWalletStore::default();
        assert_eq!(store.get(WalletId(99)), Err(WalletError::WalletNotFound));
        assert!(store.find_by_owner(&UserId::from("nobody")).unwrap().is_empty());
    }

    #[test]
    fn apply_delta_bumps_version() {
        let store = MemoryWalletStore::default();
        let w = store
            .create_wallet(new_wallet("u1", WalletType::Rider, dec!(100)))
            .unwrap();

        let after = store.apply_delta(w.id, dec!(-10), dec!(5), w.version).unwrap();
        assert_eq!(after.balance, dec!(90));
        assert_eq!(after.held_balance, dec!(5));
        assert_eq!(after.version, w.version + 1);
    }

    #[test]
    fn stale_version_conflicts_and_leaves_row_untouched() {
        let store = MemoryWalletStore::default();
        let w = store
            .create_wallet(new_wallet("u1", WalletType::Rider, dec!(100)))
            .unwrap();
        store.apply_delta(w.id, dec!(1), Decimal::ZERO, w.version).unwrap();

        let result = store.apply_delta(w.id, dec!(50), Decimal::ZERO, w.version);
        assert_eq!(result, Err(WalletError::Conflict));
        assert_eq!(store.get(w.id).unwrap().balance, dec!(101));
    }

    #[test]
    fn held_balance_cannot_go_negative() {
        let store = MemoryWalletStore::default();
        let w = store
            .create_wallet(new_wallet("u1", WalletType::Rider, dec!(100)))
            .unwrap();

        let result = store.apply_delta(w.id, Decimal::ZERO, dec!(-1), w.version);
        assert!(matches!(result, Err(WalletError::InvariantViolation(_))));
        assert_eq!(store.get(w.id).unwrap().version, w.version);
    }

    #[test]
    fn locked_row_times_out() {
        let store = MemoryWalletStore::new(Duration::from_millis(5));
        let w = store
            .create_wallet(new_wallet("u1", WalletType::Rider, dec!(100)))
            .unwrap();

        let row = store.row(w.id).unwrap();
        let _guard = row.lock();
        assert_eq!(store.get(w.id), Err(WalletError::LockTimeout));
    }

    #[test]
    fn retry_on_conflict_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
        };

        let result: Result<(), WalletError> = retry_on_conflict(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WalletError::Conflict)
        });

        assert_eq!(result, Err(WalletError::Conflict));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_on_conflict_retries_lock_timeouts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::ZERO,
        };

        let result = retry_on_conflict(&policy, || {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(WalletError::LockTimeout),
                _ => Ok(7),
            }
        });

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_on_conflict_passes_other_errors_through() {
        let calls = AtomicU32::new(0);
        let result: Result<(), WalletError> = retry_on_conflict(&RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WalletError::HoldNotFound)
        });

        assert_eq!(result, Err(WalletError::HoldNotFound));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
