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

//! Hold lifecycle tests under concurrency.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use wallet_ledger::{
    HoldStatus, TransactionKind, UserId, WalletConfig, WalletError, WalletService, WalletType,
};

/// Config with generous conflict retries for contended tests.
fn contended_config() -> WalletConfig {
    WalletConfig {
        max_retries: 50,
        retry_backoff_ms: 0,
        ..WalletConfig::default()
    }
}

fn rider_service(balance: Decimal) -> (Arc<WalletService>, UserId) {
    let service = Arc::new(WalletService::new(contended_config()));
    let rider = UserId::from("rider-1");
    service
        .create_wallet(&rider, WalletType::Rider, balance)
        .unwrap();
    (service, rider)
}

#[test]
fn concurrent_holds_never_exceed_available() {
    for round in 0..50 {
        let (service, rider) = rider_service(dec!(1000));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = [dec!(700), dec!(600)]
            .into_iter()
            .enumerate()
            .map(|(i, amount)| {
                let service = Arc::clone(&service);
                let rider = rider.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    service.hold_funds(&rider, amount, "ride", &format!("ride-{round}-{i}"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 1, "round {round}: {results:?}");
        assert!(results.iter().any(|r| matches!(
            r,
            Err(WalletError::InsufficientFunds { .. })
        )));

        let held = service.get_balance(&rider).unwrap().held_balance;
        assert!(held == dec!(700) || held == dec!(600), "held {held}");
    }
}

#[test]
fn concurrent_duplicate_holds_reserve_once() {
    let (service, rider) = rider_service(dec!(1000));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            let rider = rider.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                service
                    .hold_funds(&rider, dec!(300), "service_order", "o1")
                    .unwrap()
                    .id
            })
        })
        .collect();

    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));

    let balance = service.get_balance(&rider).unwrap();
    assert_eq!(balance.held_balance, dec!(300));
    assert_eq!(service.holds_by_reference("service_order", "o1").len(), 1);
}

#[test]
fn capture_and_release_race_settles_once() {
    for round in 0..50 {
        let (service, rider) = rider_service(dec!(1000));
        let hold = service
            .hold_funds(&rider, dec!(400), "ride", &format!("ride-{round}"))
            .unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let capture = {
            let (service, rider, barrier) =
                (Arc::clone(&service), rider.clone(), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                service.capture_hold(&rider, hold.id, "fare")
            })
        };
        let release = {
            let (service, rider, barrier) =
                (Arc::clone(&service), rider.clone(), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                service.release_hold(&rider, hold.id)
            })
        };

        let captured = capture.join().unwrap();
        let released = release.join().unwrap();
        assert_ne!(captured.is_ok(), released.is_ok(), "round {round}");

        let balance = service.get_balance(&rider).unwrap();
        assert_eq!(balance.held_balance, Decimal::ZERO);
        match service.holds().get(hold.id).unwrap().status {
            HoldStatus::Captured => {
                assert_eq!(released, Err(WalletError::HoldNotActive(HoldStatus::Captured)));
                assert_eq!(balance.balance, dec!(600));
            }
            HoldStatus::Released => {
                assert_eq!(captured, Err(WalletError::HoldNotActive(HoldStatus::Released)));
                assert_eq!(balance.balance, dec!(1000));
            }
            other => panic!("unexpected status {other}"),
        }
    }
}

#[test]
fn expiry_racing_captures_settles_each_hold_once() {
    let (service, rider) = rider_service(dec!(10000));
    let wallet = service.get_wallet(&rider).unwrap();
    let holds: Vec<_> = (0..40)
        .map(|i| {
            service
                .holds()
                .hold_funds_for(wallet.id, dec!(10), "ride", &format!("ride-{i}"), Duration::ZERO)
                .unwrap()
        })
        .collect();
    let ids: Vec<_> = holds.iter().map(|h| h.id).collect();

    let sweeper = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let mut expired = 0;
            for _ in 0..20 {
                expired += service.sweep_expired(Utc::now() + chrono::Duration::seconds(1));
            }
            expired
        })
    };
    let capturer = {
        let (service, rider, ids) = (Arc::clone(&service), rider.clone(), ids.clone());
        thread::spawn(move || {
            ids.iter()
                .filter(|id| service.capture_hold(&rider, **id, "fare").is_ok())
                .count()
        })
    };

    let expired = sweeper.join().unwrap();
    let captured = capturer.join().unwrap();
    assert_eq!(expired + captured, ids.len());

    let balance = service.get_balance(&rider).unwrap();
    assert_eq!(balance.held_balance, Decimal::ZERO);
    assert_eq!(
        balance.balance,
        dec!(10000) - Decimal::from(captured as u64) * dec!(10)
    );

    // One hold entry plus exactly one settlement entry per hold.
    let entries = service.ledger().entries(wallet.id).unwrap();
    let settlements = entries
        .iter()
        .filter(|e| matches!(e.kind, TransactionKind::Capture | TransactionKind::Release))
        .count();
    assert_eq!(settlements, ids.len());
}

#[test]
fn expired_hold_is_logged_as_release() {
    let (service, rider) = rider_service(dec!(1000));
    let wallet = service.get_wallet(&rider).unwrap();
    let hold = service
        .holds()
        .hold_funds_for(wallet.id, dec!(250), "ride", "ride-1", Duration::from_secs(60))
        .unwrap();

    assert_eq!(service.sweep_expired(Utc::now()), 0);
    assert_eq!(service.sweep_expired(Utc::now() + chrono::Duration::minutes(2)), 1);

    let entry = service.ledger().entries(wallet.id).unwrap().pop().unwrap();
    assert_eq!(entry.kind, TransactionKind::Release);
    assert_eq!(entry.description, "hold expired");
    assert_eq!(
        service.capture_hold(&rider, hold.id, "late"),
        Err(WalletError::HoldNotActive(HoldStatus::Expired))
    );
}
