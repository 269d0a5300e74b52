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

//! Append-only transaction ledger.
//!
//! Entries are written after the wallet mutation they describe has committed.
//! A failed write never undoes the mutation: the entry is parked in a
//! lock-free backlog and flushed later by [`LedgerRecorder::retry_pending`].
//!
//! Folding [`TransactionKind::balance_effect`] over a wallet's entries and
//! adding the initial balance reproduces the wallet's current balance.

use crate::base::{EntryId, IdSequence, WalletId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Debit,
    Hold,
    Capture,
    Release,
    TransferIn,
    TransferOut,
    CancellationFee,
}

impl TransactionKind {
    /// Signed effect of an entry of this kind on `balance`.
    ///
    /// Holds and releases only move `held_balance`.
    pub fn balance_effect(self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit | Self::TransferIn => amount,
            Self::Debit | Self::Capture | Self::TransferOut | Self::CancellationFee => -amount,
            Self::Hold | Self::Release => Decimal::ZERO,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::Hold => "hold",
            Self::Capture => "capture",
            Self::Release => "release",
            Self::TransferIn => "transfer_in",
            Self::TransferOut => "transfer_out",
            Self::CancellationFee => "cancellation_fee",
        };
        f.write_str(name)
    }
}

/// Ledger entry before an id and timestamp are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub wallet_id: WalletId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reference_type: String,
    pub reference_id: String,
    pub description: String,
}

/// Immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub wallet_id: WalletId,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub reference_type: String,
    pub reference_id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn signed_amount(&self) -> Decimal {
        self.kind.balance_effect(self.amount)
    }
}

/// Storage behind the recorder.
pub trait LedgerSink: Send + Sync {
    /// Persists `entry`. Writing the same id twice fails with
    /// [`LedgerError::DuplicateEntry`].
    fn write(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;

    /// Entries of `wallet_id` in append order.
    fn entries(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError>;

    fn entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, LedgerError>;
}

/// In-memory [`LedgerSink`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    by_wallet: DashMap<WalletId, Vec<LedgerEntry>>,
    ids: DashMap<EntryId, WalletId>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl LedgerSink for MemoryLedger {
    fn write(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        // Use entry API for atomic check-and-insert on the entry id.
        match self.ids.entry(entry.id) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateEntry),
            Entry::Vacant(slot) => {
                slot.insert(entry.wallet_id);
                self.by_wallet
                    .entry(entry.wallet_id)
                    .or_default()
                    .push(entry.clone());
                Ok(())
            }
        }
    }

    fn entries(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .by_wallet
            .get(&wallet_id)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }

    fn entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        let Some(wallet_id) = self.ids.get(&entry_id).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self
            .by_wallet
            .get(&wallet_id)
            .and_then(|entries| entries.iter().find(|e| e.id == entry_id).cloned()))
    }
}

/// Filter and paging for [`LedgerRecorder::history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub kind: Option<TransactionKind>,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
}

impl HistoryQuery {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    pub fn of_kind(kind: TransactionKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn normalized(&self) -> (usize, usize) {
        let page = self.page.max(1);
        let limit = match self.limit {
            0 => Self::DEFAULT_LIMIT,
            n => n.min(Self::MAX_LIMIT),
        };
        (page, limit)
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            kind: None,
            page: 1,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Assigns ids to drafts and writes them to a [`LedgerSink`].
pub struct LedgerRecorder {
    sink: Arc<dyn LedgerSink>,
    /// Entries whose write failed, in failure order.
    backlog: SegQueue<LedgerEntry>,
    ids: IdSequence,
}

impl LedgerRecorder {
    pub fn new(sink: Arc<dyn LedgerSink>) -> Self {
        Self {
            sink,
            backlog: SegQueue::new(),
            ids: IdSequence::new(),
        }
    }

    /// Records `draft`. Always returns the entry, even if it had to be parked.
    pub fn append(&self, draft: EntryDraft) -> LedgerEntry {
        let entry = LedgerEntry {
            id: EntryId(self.ids.next()),
            wallet_id: draft.wallet_id,
            kind: draft.kind,
            amount: draft.amount,
            balance_before: draft.balance_before,
            balance_after: draft.balance_after,
            reference_type: draft.reference_type,
            reference_id: draft.reference_id,
            description: draft.description,
            created_at: Utc::now(),
        };

        if let Err(e) = self.sink.write(&entry) {
            warn!(
                entry_id = %entry.id,
                wallet_id = %entry.wallet_id,
                kind = %entry.kind,
                error = %e,
                "ledger write failed, queued for retry"
            );
            self.backlog.push(entry.clone());
        }
        entry
    }

    /// Makes one pass over the backlog. Returns how many entries were written.
    pub fn retry_pending(&self) -> usize {
        let mut flushed = 0;
        let mut still_failing = Vec::new();

        while let Some(entry) = self.backlog.pop() {
            match self.sink.write(&entry) {
                // Already persisted by an earlier attempt that reported failure.
                Ok(()) | Err(LedgerError::DuplicateEntry) => flushed += 1,
                Err(e) => {
                    debug!(entry_id = %entry.id, error = %e, "ledger retry failed");
                    still_failing.push(entry);
                }
            }
        }
        for entry in still_failing {
            self.backlog.push(entry);
        }

        if flushed > 0 {
            debug!(flushed, remaining = self.backlog.len(), "ledger backlog flushed");
        }
        flushed
    }

    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    pub fn entries(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.sink.entries(wallet_id)
    }

    /// Looks up one persisted entry. Entries still in the backlog are not visible.
    pub fn entry(&self, entry_id: EntryId) -> Result<Option<LedgerEntry>, LedgerError> {
        self.sink.entry(entry_id)
    }

    pub fn history(
        &self,
        wallet_id: WalletId,
        query: &HistoryQuery,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        let (page, limit) = query.normalized();
        let mut matching: Vec<LedgerEntry> = self
            .sink
            .entries(wallet_id)?
            .into_iter()
            .filter(|e| query.kind.is_none_or(|kind| e.kind == kind))
            .collect();
        matching.reverse();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();

        Ok(Page {
            items,
            total,
            page,
            limit,
        })
    }

    /// `initial_balance` plus the signed effect of every recorded entry.
    pub fn reconstruct_balance(
        &self,
        wallet_id: WalletId,
        initial_balance: Decimal,
    ) -> Result<Decimal, LedgerError> {
        Ok(self
            .sink
            .entries(wallet_id)?
            .iter()
            .fold(initial_balance, |acc, e| acc + e.signed_amount()))
    }
}
