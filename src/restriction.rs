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

//! Automatic restriction of driver and provider accounts.
//!
//! An overdraft-permitted wallet whose balance drops below
//! `-min_balance_threshold` is restricted and its account suspended. Once the
//! balance is back at or above the floor the restriction is lifted. Accounts
//! disabled by an operator stay disabled.

use crate::base::WalletId;
use crate::config::RetryPolicy;
use crate::error::WalletError;
use crate::store::{WalletStore, retry_on_conflict};
use crate::wallet::{AccountStatus, Standing, Wallet};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestrictionOutcome {
    /// Nothing to change; carries the current flag.
    Unchanged { restricted: bool },
    Restricted { reason: String },
    Cleared,
}

pub struct RestrictionPolicy {
    store: Arc<dyn WalletStore>,
    retry: RetryPolicy,
}

impl RestrictionPolicy {
    pub fn new(store: Arc<dyn WalletStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Re-evaluates the standing of `wallet_id` against its current balance.
    ///
    /// # Errors
    ///
    /// - [`WalletError::WalletNotFound`] - Unknown wallet.
    /// - [`WalletError::Conflict`] - Retries exhausted while writing the new standing.
    pub fn evaluate(&self, wallet_id: WalletId) -> Result<RestrictionOutcome, WalletError> {
        retry_on_conflict(&self.retry, || {
            let wallet = self.store.get(wallet_id)?;
            match Self::decide(&wallet) {
                Some((standing, outcome)) => {
                    self.store
                        .update_standing(wallet_id, standing, wallet.version)?;
                    Self::log(&wallet, &outcome);
                    Ok(outcome)
                }
                None => Ok(RestrictionOutcome::Unchanged {
                    restricted: wallet.is_restricted,
                }),
            }
        })
    }

    fn decide(wallet: &Wallet) -> Option<(Standing, RestrictionOutcome)> {
        if !wallet.allows_overdraft() {
            return None;
        }

        let floor = wallet.restriction_floor();
        if wallet.balance < floor && !wallet.is_restricted {
            let reason = format!("negative balance: {} (threshold: {floor})", wallet.balance);
            let mut standing = Standing::restricted(reason.clone(), Utc::now());
            if wallet.account_status == AccountStatus::Disabled {
                standing.account_status = AccountStatus::Disabled;
            }
            return Some((standing, RestrictionOutcome::Restricted { reason }));
        }

        if wallet.balance >= floor && wallet.is_restricted {
            let mut standing = Standing::good();
            if wallet.account_status == AccountStatus::Disabled {
                standing.account_status = AccountStatus::Disabled;
            }
            return Some((standing, RestrictionOutcome::Cleared));
        }

        None
    }

    fn log(wallet: &Wallet, outcome: &RestrictionOutcome) {
        match outcome {
            RestrictionOutcome::Restricted { reason } => warn!(
                wallet_id = %wallet.id,
                owner_id = %wallet.owner_id,
                balance = %wallet.balance,
                reason = %reason,
                "wallet restricted"
            ),
            RestrictionOutcome::Cleared => info!(
                wallet_id = %wallet.id,
                owner_id = %wallet.owner_id,
                balance = %wallet.balance,
                "wallet restriction cleared"
            ),
            RestrictionOutcome::Unchanged { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::UserId;
    use crate::store::MemoryWalletStore;
    use crate::wallet::{NewWallet, WalletType};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn setup(
        wallet_type: WalletType,
        threshold: Decimal,
    ) -> (Arc<MemoryWalletStore>, RestrictionPolicy, WalletId) {
        let store = Arc::new(MemoryWalletStore::default());
        let id = store
            .create_wallet(NewWallet {
                owner_id: UserId::from("driver-1"),
                wallet_type,
                initial_balance: Decimal::ZERO,
                currency: "INR".into(),
                min_balance_threshold: threshold,
            })
            .unwrap()
            .id;
        let policy = RestrictionPolicy::new(store.clone(), RetryPolicy::default());
        (store, policy, id)
    }

    fn move_balance(store: &MemoryWalletStore, id: WalletId, delta: Decimal) {
        let w = store.get(id).unwrap();
        store.apply_delta(id, delta, Decimal::ZERO, w.version).unwrap();
    }

    #[test]
    fn restricts_below_floor_and_clears_on_recovery() {
        let (store, policy, id) = setup(WalletType::Driver, dec!(100));

        move_balance(&store, id, dec!(-150));
        let outcome = policy.evaluate(id).unwrap();
        assert_eq!(
            outcome,
            RestrictionOutcome::Restricted {
                reason: "negative balance: -150 (threshold: -100)".into()
            }
        );
        let w = store.get(id).unwrap();
        assert!(w.is_restricted);
        assert_eq!(w.account_status, AccountStatus::Suspended);
        assert!(w.restricted_at.is_some());

        move_balance(&store, id, dec!(60));
        assert_eq!(policy.evaluate(id).unwrap(), RestrictionOutcome::Cleared);
        let w = store.get(id).unwrap();
        assert!(!w.is_restricted);
        assert_eq!(w.account_status, AccountStatus::Active);
        assert_eq!(w.restriction_reason, None);
    }

    #[test]
    fn balance_exactly_at_floor_is_not_restricted() {
        let (store, policy, id) = setup(WalletType::Provider, dec!(100));
        move_balance(&store, id, dec!(-100));
        assert_eq!(
            policy.evaluate(id).unwrap(),
            RestrictionOutcome::Unchanged { restricted: false }
        );
    }

    #[test]
    fn repeated_evaluation_does_not_rewrite() {
        let (store, policy, id) = setup(WalletType::Driver, dec!(100));
        move_balance(&store, id, dec!(-150));
        policy.evaluate(id).unwrap();
        let version = store.get(id).unwrap().version;

        assert_eq!(
            policy.evaluate(id).unwrap(),
            RestrictionOutcome::Unchanged { restricted: true }
        );
        assert_eq!(store.get(id).unwrap().version, version);
    }

    #[test]
    fn disabled_account_stays_disabled_when_cleared() {
        let (store, policy, id) = setup(WalletType::Driver, dec!(100));
        let w = store.get(id).unwrap();
        let disabled = Standing {
            is_restricted: true,
            restriction_reason: Some("fraud review".into()),
            restricted_at: Some(Utc::now()),
            account_status: AccountStatus::Disabled,
        };
        store.update_standing(id, disabled, w.version).unwrap();

        assert_eq!(policy.evaluate(id).unwrap(), RestrictionOutcome::Cleared);
        let w = store.get(id).unwrap();
        assert!(!w.is_restricted);
        assert_eq!(w.account_status, AccountStatus::Disabled);
        assert!(!w.is_eligible());
    }

    #[test]
    fn wallets_without_overdraft_are_ignored() {
        let (_, policy, id) = setup(WalletType::Driver, Decimal::ZERO);
        assert_eq!(
            policy.evaluate(id).unwrap(),
            RestrictionOutcome::Unchanged { restricted: false }
        );
    }
}
