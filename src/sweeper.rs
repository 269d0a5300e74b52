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

//! Background maintenance: hold expiry, ledger backlog flushing, top-up
//! replay and pruning of settled records.

use crate::service::WalletService;
use chrono::Utc;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Totals of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_holds: usize,
    pub flushed_entries: usize,
    pub confirmed_top_ups: usize,
    pub pruned_records: usize,
}

/// Runs one pass against `service`.
pub fn sweep_once(service: &WalletService) -> SweepReport {
    let now = Utc::now();
    let report = SweepReport {
        expired_holds: service.sweep_expired(now),
        flushed_entries: service.flush_ledger(),
        confirmed_top_ups: service.retry_top_ups(),
        pruned_records: service.prune_settled(now),
    };
    let pending = service.ledger().pending();
    if pending > 0 {
        warn!(pending, "ledger backlog not drained");
    }
    let unconfirmed = service.pending_top_ups().len();
    if unconfirmed > 0 {
        warn!(unconfirmed, "charged top-ups still not credited");
    }
    debug!(?report, "sweep pass completed");
    report
}

pub struct Sweeper;

impl Sweeper {
    /// Starts a thread that runs [`sweep_once`] every `interval`.
    pub fn spawn(service: Arc<WalletService>, interval: Duration) -> std::io::Result<SweeperHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("wallet-sweeper".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "sweeper started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep_once(&service);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("sweeper stopped");
            })?;

        Ok(SweeperHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Stops the sweeper thread when dropped.
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
