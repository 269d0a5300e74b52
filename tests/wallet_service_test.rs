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

//! WalletService public API integration tests.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wallet_ledger::store::MemoryWalletStore;
use wallet_ledger::wallet::{NewWallet, Standing};
use wallet_ledger::{
    EntryId, HistoryQuery, HoldStatus, LedgerEntry, LedgerError, LedgerSink, MemoryLedger, PaymentError,
    PaymentPort, PaymentReceipt, PaymentRequest, SimulatedPaymentPort, TransactionKind, UserId,
    Wallet, WalletConfig, WalletError, WalletId, WalletService, WalletStore, WalletType,
};

fn user(id: &str) -> UserId {
    UserId::from(id)
}

/// Store that refuses credits to selected wallets.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryWalletStore,
    refuse_credits: Mutex<HashSet<WalletId>>,
}

impl FlakyStore {
    fn refuse_credits_to(&self, wallet_id: WalletId) {
        self.refuse_credits.lock().insert(wallet_id);
    }
}

impl WalletStore for FlakyStore {
    fn create_wallet(&self, new: NewWallet) -> Result<Wallet, WalletError> {
        self.inner.create_wallet(new)
    }

    fn get(&self, wallet_id: WalletId) -> Result<Wallet, WalletError> {
        self.inner.get(wallet_id)
    }

    fn find_by_owner(&self, owner_id: &UserId) -> Result<Vec<Wallet>, WalletError> {
        self.inner.find_by_owner(owner_id)
    }

    fn apply_delta(
        &self,
        wallet_id: WalletId,
        balance_delta: Decimal,
        held_delta: Decimal,
        expected_version: u64,
    ) -> Result<Wallet, WalletError> {
        if balance_delta > Decimal::ZERO && self.refuse_credits.lock().contains(&wallet_id) {
            return Err(WalletError::Storage("connection reset".into()));
        }
        self.inner
            .apply_delta(wallet_id, balance_delta, held_delta, expected_version)
    }

    fn update_standing(
        &self,
        wallet_id: WalletId,
        standing: Standing,
        expected_version: u64,
    ) -> Result<Wallet, WalletError> {
        self.inner.update_standing(wallet_id, standing, expected_version)
    }

    fn set_active(&self, wallet_id: WalletId, active: bool) -> Result<Wallet, WalletError> {
        self.inner.set_active(wallet_id, active)
    }
}

/// Ledger sink that can be switched off.
#[derive(Default)]
struct SwitchableSink {
    down: AtomicBool,
    inner: MemoryLedger,
}

impl LedgerSink for SwitchableSink {
    fn write(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("sink offline".into()));
        }
        self.inner.write(entry)
    }

    fn entries(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.inner.entries(wallet_id)
    }

    fn entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        self.inner.entry(entry_id)
    }
}

/// Payment port that deactivates the payer's wallets while charging them.
struct DeactivatingPort {
    store: Arc<MemoryWalletStore>,
}

impl PaymentPort for DeactivatingPort {
    fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        for wallet in self.store.find_by_owner(&request.user_id).unwrap() {
            self.store.set_active(wallet.id, false).unwrap();
        }
        Ok(PaymentReceipt {
            provider_transaction_id: "prov-1".into(),
            amount: request.amount,
        })
    }
}

fn service_with_store(store: Arc<FlakyStore>) -> WalletService {
    WalletService::with_parts(
        WalletConfig::default(),
        store,
        Arc::new(MemoryLedger::new()),
        Arc::new(SimulatedPaymentPort::new()),
    )
}

fn assert_conserved(service: &WalletService, wallet: &Wallet, initial: Decimal) {
    let current = service.get_wallet(&wallet.owner_id).unwrap();
    let reconstructed = service
        .ledger()
        .reconstruct_balance(wallet.id, initial)
        .unwrap();
    assert_eq!(reconstructed, current.balance);
}

#[test]
fn scenario_hold_then_capture() {
    let service = WalletService::default();
    let rider = user("rider-a");
    let wallet = service
        .create_wallet(&rider, WalletType::Rider, dec!(1000.00))
        .unwrap();

    let hold = service
        .hold_funds(&rider, dec!(500), "service_order", "o1")
        .unwrap();
    let balance = service.get_balance(&rider).unwrap();
    assert_eq!(balance.held_balance, dec!(500));
    assert_eq!(balance.available(), dec!(500));

    service.capture_hold(&rider, hold.id, "order o1").unwrap();
    let balance = service.get_balance(&rider).unwrap();
    assert_eq!(balance.balance, dec!(500.00));
    assert_eq!(balance.held_balance, Decimal::ZERO);

    let entries = service.ledger().entries(wallet.id).unwrap();
    let kinds: Vec<_> = entries.iter().map(|e| (e.kind, e.amount)).collect();
    assert_eq!(
        kinds,
        vec![
            (TransactionKind::Hold, dec!(500)),
            (TransactionKind::Capture, dec!(500))
        ]
    );
    assert_conserved(&service, &wallet, dec!(1000));
}

#[test]
fn scenario_hold_then_release() {
    let service = WalletService::default();
    let rider = user("rider-b");
    let wallet = service
        .create_wallet(&rider, WalletType::Rider, dec!(1000.00))
        .unwrap();

    let hold = service
        .hold_funds(&rider, dec!(500), "service_order", "o2")
        .unwrap();
    service.release_hold(&rider, hold.id).unwrap();

    let balance = service.get_balance(&rider).unwrap();
    assert_eq!(balance.balance, dec!(1000.00));
    assert_eq!(balance.held_balance, Decimal::ZERO);
    assert_conserved(&service, &wallet, dec!(1000));
}

#[test]
fn scenario_transfer_with_failed_credit_is_compensated() {
    let store = Arc::new(FlakyStore::default());
    let service = service_with_store(Arc::clone(&store));
    let a = service
        .create_wallet(&user("a"), WalletType::Provider, dec!(300))
        .unwrap();
    let b = service
        .create_wallet(&user("b"), WalletType::Provider, Decimal::ZERO)
        .unwrap();

    // Healthy transfer first.
    service
        .transfer_funds(&user("a"), &user("b"), dec!(200), "earnings")
        .unwrap();
    assert_eq!(service.get_balance(&user("a")).unwrap().balance, dec!(100));
    assert_eq!(service.get_balance(&user("b")).unwrap().balance, dec!(200));

    // Top A back up to 300 and make B refuse credits.
    service.credit(&user("a"), dec!(200), "topup", "pay-1", "reload").unwrap();
    store.refuse_credits_to(b.id);

    let result = service.transfer_funds(&user("a"), &user("b"), dec!(200), "earnings");
    assert!(matches!(result, Err(WalletError::TransferPartialFailure { .. })));
    assert!(!result.unwrap_err().is_fatal());
    assert_eq!(service.get_balance(&user("a")).unwrap().balance, dec!(300));
    assert_eq!(service.get_balance(&user("b")).unwrap().balance, dec!(200));

    assert_conserved(&service, &a, dec!(300));
    assert_conserved(&service, &b, Decimal::ZERO);
}

#[test]
fn failed_compensation_requires_reconciliation() {
    let store = Arc::new(FlakyStore::default());
    let service = service_with_store(Arc::clone(&store));
    let a = service
        .create_wallet(&user("a"), WalletType::Provider, dec!(300))
        .unwrap();
    let b = service
        .create_wallet(&user("b"), WalletType::Provider, Decimal::ZERO)
        .unwrap();
    store.refuse_credits_to(a.id);
    store.refuse_credits_to(b.id);

    let err = service
        .transfer_funds(&user("a"), &user("b"), dec!(200), "earnings")
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err,
        WalletError::ReconciliationRequired { wallet_id, amount, .. }
            if wallet_id == a.id && amount == dec!(200)
    ));
    assert_eq!(service.get_balance(&user("a")).unwrap().balance, dec!(100));
}

#[test]
fn transfer_writes_both_legs() {
    let service = WalletService::default();
    service
        .create_wallet(&user("a"), WalletType::Rider, dec!(300))
        .unwrap();
    service
        .create_wallet(&user("b"), WalletType::Rider, Decimal::ZERO)
        .unwrap();

    let transfer = service
        .transfer_funds(&user("a"), &user("b"), dec!(120), "split fare")
        .unwrap();

    assert_eq!(transfer.debit.kind, TransactionKind::TransferOut);
    assert_eq!(transfer.credit.kind, TransactionKind::TransferIn);
    assert_eq!(transfer.debit.reference_id, transfer.reference_id);
    assert_eq!(transfer.credit.reference_id, transfer.reference_id);
    assert_eq!(transfer.debit.balance_after, dec!(180));
    assert_eq!(transfer.credit.balance_after, dec!(120));
}

#[test]
fn transfer_beyond_rider_balance_fails_without_side_effects() {
    let service = WalletService::default();
    let a = service
        .create_wallet(&user("a"), WalletType::Rider, dec!(50))
        .unwrap();
    service
        .create_wallet(&user("b"), WalletType::Rider, Decimal::ZERO)
        .unwrap();

    let result = service.transfer_funds(&user("a"), &user("b"), dec!(80), "too much");
    assert_eq!(
        result,
        Err(WalletError::InsufficientFunds {
            available: dec!(50),
            required: dec!(80)
        })
    );
    assert!(service.ledger().entries(a.id).unwrap().is_empty());
}

#[test]
fn restriction_follows_balance_threshold() {
    let service = WalletService::default();
    let driver = user("driver-1");
    service.open_signup_wallet(&driver, WalletType::Driver).unwrap();

    service
        .debit(&driver, dec!(150), "ride_commission", "ride-1", "commission")
        .unwrap();
    let wallet = service.get_wallet(&driver).unwrap();
    assert_eq!(wallet.balance, dec!(-150));
    assert!(wallet.is_restricted);
    assert!(!service.is_eligible(&driver).unwrap());

    service
        .credit(&driver, dec!(60), "earnings", "ride-2", "fare share")
        .unwrap();
    let wallet = service.get_wallet(&driver).unwrap();
    assert_eq!(wallet.balance, dec!(-90));
    assert!(!wallet.is_restricted);
    assert!(service.is_eligible(&driver).unwrap());
}

#[test]
fn driver_hold_cannot_overdraw() {
    let service = WalletService::default();
    let driver = user("driver-1");
    service.open_signup_wallet(&driver, WalletType::Driver).unwrap();

    let result = service.hold_funds(&driver, dec!(10), "ride", "ride-1");
    assert_eq!(
        result,
        Err(WalletError::InsufficientFunds {
            available: Decimal::ZERO,
            required: dec!(10)
        })
    );
}

#[test]
fn capture_then_release_is_not_active() {
    let service = WalletService::default();
    let rider = user("rider-1");
    service.open_signup_wallet(&rider, WalletType::Rider).unwrap();

    let hold = service.hold_funds(&rider, dec!(300), "ride", "ride-1").unwrap();
    service.capture_hold(&rider, hold.id, "fare").unwrap();
    let before = service.get_balance(&rider).unwrap();

    let result = service.release_hold(&rider, hold.id);
    assert_eq!(result, Err(WalletError::HoldNotActive(HoldStatus::Captured)));
    assert_eq!(service.get_balance(&rider).unwrap(), before);
}

#[test]
fn top_up_credits_confirmed_amount_once() {
    let service = WalletService::default();
    let rider = user("rider-1");
    let wallet = service
        .create_wallet(&rider, WalletType::Rider, Decimal::ZERO)
        .unwrap();

    let entry = service.top_up(&rider, dec!(250), "upi").unwrap();
    assert_eq!(entry.reference_type, "topup");

    // The provider retries its confirmation callback.
    let replay = service
        .confirm_top_up(&rider, dec!(250), &entry.reference_id)
        .unwrap();
    assert_eq!(replay.id, entry.id);
    assert_eq!(service.get_balance(&rider).unwrap().balance, dec!(250));
    assert_conserved(&service, &wallet, Decimal::ZERO);
}

#[test]
fn declined_payment_does_not_credit() {
    let payments = Arc::new(SimulatedPaymentPort::new());
    let service = WalletService::with_parts(
        WalletConfig::default(),
        Arc::new(MemoryWalletStore::default()),
        Arc::new(MemoryLedger::new()),
        Arc::clone(&payments) as Arc<dyn wallet_ledger::PaymentPort>,
    );
    let rider = user("rider-1");
    service
        .create_wallet(&rider, WalletType::Rider, Decimal::ZERO)
        .unwrap();

    payments.fail_next(PaymentError::Declined("card expired".into()));
    let err = service.top_up(&rider, dec!(100), "card").unwrap_err();
    assert!(matches!(err, WalletError::Payment { retryable: false, .. }));

    payments.fail_next(PaymentError::Timeout);
    let err = service.top_up(&rider, dec!(100), "card").unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(service.get_balance(&rider).unwrap().balance, Decimal::ZERO);
}

#[test]
fn ledger_outage_does_not_fail_money_movement() {
    let sink = Arc::new(SwitchableSink::default());
    let service = WalletService::with_parts(
        WalletConfig::default(),
        Arc::new(MemoryWalletStore::default()),
        Arc::clone(&sink) as Arc<dyn LedgerSink>,
        Arc::new(SimulatedPaymentPort::new()),
    );
    let rider = user("rider-1");
    let wallet = service
        .create_wallet(&rider, WalletType::Rider, dec!(100))
        .unwrap();

    sink.down.store(true, Ordering::SeqCst);
    service.debit(&rider, dec!(40), "adjustment", "adj-1", "fix").unwrap();
    assert_eq!(service.get_balance(&rider).unwrap().balance, dec!(60));
    assert_eq!(service.ledger().pending(), 1);

    sink.down.store(false, Ordering::SeqCst);
    assert_eq!(service.flush_ledger(), 1);
    assert_eq!(service.ledger().pending(), 0);
    assert_conserved(&service, &wallet, dec!(100));
}

#[test]
fn history_is_paged_newest_first() {
    let service = WalletService::default();
    let provider = user("provider-1");
    service.open_signup_wallet(&provider, WalletType::Provider).unwrap();
    for i in 1..=25 {
        service
            .credit(&provider, Decimal::from(i), "service_order", &format!("o{i}"), "earnings")
            .unwrap();
    }
    service
        .debit(&provider, dec!(5), "driver_penalty", "o1", "late")
        .unwrap();

    let first = service.history(&provider, &HistoryQuery::default()).unwrap();
    assert_eq!(first.total, 26);
    assert_eq!(first.items.len(), 20);
    assert_eq!(first.items[0].kind, TransactionKind::Debit);

    let credits = service
        .history(
            &provider,
            &HistoryQuery {
                kind: Some(TransactionKind::Credit),
                page: 2,
                limit: 20,
            },
        )
        .unwrap();
    assert_eq!(credits.total, 25);
    assert_eq!(credits.items.len(), 5);
    assert_eq!(credits.items[4].amount, dec!(1));
}

#[test]
fn one_wallet_per_owner_and_type() {
    let service = WalletService::default();
    let owner = user("u1");
    service.open_signup_wallet(&owner, WalletType::Rider).unwrap();
    assert_eq!(
        service.open_signup_wallet(&owner, WalletType::Rider),
        Err(WalletError::WalletAlreadyExists)
    );

    service.open_signup_wallet(&owner, WalletType::Driver).unwrap();
    assert_eq!(
        service.get_wallet(&owner).unwrap().wallet_type,
        WalletType::Rider
    );
    assert_eq!(
        service
            .wallet_of_type(&owner, WalletType::Driver)
            .unwrap()
            .min_balance_threshold,
        dec!(100)
    );
}

#[test]
fn unknown_user_has_no_wallet() {
    let service = WalletService::default();
    assert_eq!(
        service.get_balance(&user("ghost")),
        Err(WalletError::WalletNotFound)
    );
}

#[test]
fn earnings_clear_restriction_for_rider_and_driver() {
    let service = WalletService::default();
    let owner = user("both");
    service.open_signup_wallet(&owner, WalletType::Rider).unwrap();
    service.open_signup_wallet(&owner, WalletType::Driver).unwrap();

    service
        .deduct_commission(&owner, dec!(150), dec!(20), "ride-1")
        .unwrap();
    let driver = service.wallet_of_type(&owner, WalletType::Driver).unwrap();
    assert!(driver.is_restricted);
    assert!(!service.is_eligible(&owner).unwrap());

    let entry = service
        .credit_earnings(&owner, dec!(500), "ride", "ride-2", "fare")
        .unwrap();
    assert_eq!(entry.wallet_id, driver.id);

    let driver = service.wallet_of_type(&owner, WalletType::Driver).unwrap();
    assert_eq!(driver.balance, dec!(350));
    assert!(!driver.is_restricted);
    assert!(service.is_eligible(&owner).unwrap());
    assert_eq!(
        service.wallet_of_type(&owner, WalletType::Rider).unwrap().balance,
        dec!(1000)
    );
}

#[test]
fn charged_top_up_survives_failed_credit() {
    let store = Arc::new(MemoryWalletStore::default());
    let service = WalletService::with_parts(
        WalletConfig::default(),
        Arc::clone(&store) as Arc<dyn WalletStore>,
        Arc::new(MemoryLedger::new()),
        Arc::new(DeactivatingPort {
            store: Arc::clone(&store),
        }),
    );
    let rider = user("rider-t");
    let wallet = service
        .create_wallet(&rider, WalletType::Rider, dec!(100))
        .unwrap();

    let result = service.top_up(&rider, dec!(250), "card");
    assert!(matches!(
        result,
        Err(WalletError::TopUpUnconfirmed { ref provider_transaction_id, amount, .. })
            if provider_transaction_id == "prov-1" && amount == dec!(250)
    ));

    let pending = service.pending_top_ups();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider_transaction_id, "prov-1");
    assert_eq!(pending[0].user_id, rider);
    assert!(pending[0].last_error.is_some());
    assert_eq!(service.retry_top_ups(), 0);

    store.set_active(wallet.id, true).unwrap();
    assert_eq!(service.retry_top_ups(), 1);
    assert_eq!(service.get_balance(&rider).unwrap().balance, dec!(350));
    assert!(service.pending_top_ups().is_empty());

    // A late provider callback for the same charge is a replay.
    service.confirm_top_up(&rider, dec!(250), "prov-1").unwrap();
    assert_eq!(service.get_balance(&rider).unwrap().balance, dec!(350));
    assert_conserved(&service, &wallet, dec!(100));
}

#[test]
fn driver_without_balance_cannot_transfer() {
    let service = WalletService::default();
    let driver = service
        .open_signup_wallet(&user("driver-t"), WalletType::Driver)
        .unwrap();
    service
        .open_signup_wallet(&user("rider-t"), WalletType::Rider)
        .unwrap();

    let result = service.transfer_funds(&user("driver-t"), &user("rider-t"), dec!(50), "payout");
    assert!(matches!(result, Err(WalletError::InsufficientFunds { .. })));
    assert_eq!(service.get_wallet(&user("driver-t")).unwrap().balance, Decimal::ZERO);
    assert_eq!(service.get_wallet(&user("rider-t")).unwrap().balance, dec!(1000));
    assert!(service.ledger().entries(driver.id).unwrap().is_empty());
}
