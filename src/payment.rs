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

//! External payment provider port used by wallet top-ups.

use crate::base::UserId;
use crate::error::PaymentError;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    /// Provider-specific method name, e.g. `card` or `upi`.
    pub method: String,
    /// Upper bound the provider call must respect.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Used as the idempotency reference of the resulting credit.
    pub provider_transaction_id: String,
    pub amount: Decimal,
}

pub trait PaymentPort: Send + Sync {
    fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError>;
}

/// Approves every request unless a failure has been scripted.
#[derive(Debug, Default)]
pub struct SimulatedPaymentPort {
    sequence: AtomicU64,
    next_failure: Mutex<Option<PaymentError>>,
}

impl SimulatedPaymentPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: PaymentError) {
        *self.next_failure.lock() = Some(error);
    }
}

impl PaymentPort for SimulatedPaymentPort {
    fn process_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        if let Some(error) = self.next_failure.lock().take() {
            return Err(error);
        }
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let receipt = PaymentReceipt {
            provider_transaction_id: format!("sim_{}_{n}", request.method),
            amount: request.amount,
        };
        debug!(
            user_id = %request.user_id,
            amount = %request.amount,
            provider_transaction_id = %receipt.provider_transaction_id,
            "simulated payment approved"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> PaymentRequest {
        PaymentRequest {
            user_id: UserId::from("rider-1"),
            amount: dec!(250),
            currency: "INR".into(),
            method: "card".into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn simulated_port_issues_unique_ids() {
        let port = SimulatedPaymentPort::new();
        let a = port.process_payment(&request()).unwrap();
        let b = port.process_payment(&request()).unwrap();
        assert_eq!(a.amount, dec!(250));
        assert_ne!(a.provider_transaction_id, b.provider_transaction_id);
    }

    #[test]
    fn scripted_failure_applies_once() {
        let port = SimulatedPaymentPort::new();
        port.fail_next(PaymentError::Timeout);
        assert_eq!(port.process_payment(&request()), Err(PaymentError::Timeout));
        assert!(port.process_payment(&request()).is_ok());
    }
}
