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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use wallet_ledger::sweeper::sweep_once;
use wallet_ledger::{
    Hold, UserId, Wallet, WalletConfig, WalletError, WalletService, WalletType,
};

/// Wallet Ledger - Replay wallet command CSV files
///
/// Reads wallet commands from a CSV file and prints the resulting wallet
/// states to stdout. Logs go to stderr; set RUST_LOG to change the level.
#[derive(Parser, Debug)]
#[command(name = "wallet-ledger")]
#[command(about = "Replays wallet commands and prints wallet balances", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: op,user,wallet_type,amount,reference_type,reference_id,target
    /// Example: cargo run -- commands.csv > wallets.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// JSON configuration file; WALLET_* environment variables override it
    #[arg(long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %args.input.display(), error = %e, "cannot open input file");
            process::exit(1);
        }
    };

    let service = WalletService::new(config);
    let users = match process_commands(BufReader::new(file), &service) {
        Ok(users) => users,
        Err(e) => {
            error!(error = %e, "failed to read commands");
            process::exit(1);
        }
    };

    if let Err(e) = write_wallets(&service, &users, std::io::stdout()) {
        error!(error = %e, "failed to write output");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<WalletConfig, wallet_ledger::ConfigError> {
    let mut config = match &args.config {
        Some(path) => WalletConfig::from_file(path)?,
        None => WalletConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    Ok(config)
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, user, wallet_type, amount, reference_type, reference_id, target`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    user: String,
    #[serde(default)]
    wallet_type: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    reference_type: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

/// One replayable wallet command.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Open {
        wallet_type: WalletType,
        initial_balance: Option<Decimal>,
    },
    Hold {
        amount: Decimal,
        reference_type: String,
        reference_id: String,
    },
    Capture {
        amount: Option<Decimal>,
        reference_type: String,
        reference_id: String,
    },
    Release {
        reference_type: String,
        reference_id: String,
    },
    Debit {
        amount: Decimal,
        reference_type: String,
        reference_id: String,
    },
    Credit {
        amount: Decimal,
        reference_type: String,
        reference_id: String,
    },
    Commission {
        amount: Decimal,
        rate: Decimal,
        ride_id: String,
    },
    Penalty {
        amount: Decimal,
        reason: String,
        ride_id: String,
    },
    Transfer {
        amount: Decimal,
        to: UserId,
        description: String,
    },
    Earn {
        amount: Decimal,
        reference_type: String,
        reference_id: String,
    },
    Withdraw {
        amount: Decimal,
        payout_id: String,
    },
    Subscription {
        amount: Decimal,
        plan: String,
        period: String,
    },
    CashCollect {
        amount: Decimal,
        ride_id: String,
    },
    CashSettle {
        amount: Decimal,
        settlement_id: String,
    },
    TopUp {
        amount: Decimal,
        method: String,
    },
    Deactivate,
    Sweep,
}

impl CsvRecord {
    /// Converts CSV record to a command.
    ///
    /// Returns `None` for unknown ops or missing required fields.
    fn into_command(self) -> Option<(UserId, Command)> {
        let user = UserId::new(self.user);
        let reference_type = self.reference_type.unwrap_or_default();
        let reference_id = self.reference_id.unwrap_or_default();

        let command = match self.op.to_lowercase().as_str() {
            "open" => Command::Open {
                wallet_type: self.wallet_type?.parse().ok()?,
                initial_balance: self.amount,
            },
            "hold" => Command::Hold {
                amount: self.amount?,
                reference_type,
                reference_id,
            },
            "capture" => Command::Capture {
                amount: self.amount,
                reference_type,
                reference_id,
            },
            "release" => Command::Release {
                reference_type,
                reference_id,
            },
            "debit" => Command::Debit {
                amount: self.amount?,
                reference_type,
                reference_id,
            },
            "credit" => Command::Credit {
                amount: self.amount?,
                reference_type,
                reference_id,
            },
            "commission" => Command::Commission {
                amount: self.amount?,
                rate: self
                    .target
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(Decimal::ZERO),
                ride_id: reference_id,
            },
            "penalty" => Command::Penalty {
                amount: self.amount?,
                reason: reference_type,
                ride_id: reference_id,
            },
            "transfer" => Command::Transfer {
                amount: self.amount?,
                to: UserId::new(self.target?),
                description: reference_id,
            },
            "earn" => Command::Earn {
                amount: self.amount?,
                reference_type,
                reference_id,
            },
            "withdraw" => Command::Withdraw {
                amount: self.amount?,
                payout_id: reference_id,
            },
            "subscription" => Command::Subscription {
                amount: self.amount?,
                plan: reference_type,
                period: reference_id,
            },
            "cash_collect" => Command::CashCollect {
                amount: self.amount?,
                ride_id: reference_id,
            },
            "cash_settle" => Command::CashSettle {
                amount: self.amount?,
                settlement_id: reference_id,
            },
            "topup" => Command::TopUp {
                amount: self.amount?,
                method: if reference_type.is_empty() {
                    "card".to_string()
                } else {
                    reference_type
                },
            },
            "deactivate" => Command::Deactivate,
            "sweep" => Command::Sweep,
            _ => return None,
        };
        Some((user, command))
    }
}

/// Finds the user's hold for a reference.
fn hold_for(
    service: &WalletService,
    user: &UserId,
    reference_type: &str,
    reference_id: &str,
) -> Result<Hold, WalletError> {
    let owned: Vec<_> = service.wallets(user)?.iter().map(|w| w.id).collect();
    service
        .holds_by_reference(reference_type, reference_id)
        .into_iter()
        .find(|h| owned.contains(&h.wallet_id))
        .ok_or(WalletError::HoldNotFound)
}

fn execute(service: &WalletService, user: &UserId, command: Command) -> Result<(), WalletError> {
    match command {
        Command::Open {
            wallet_type,
            initial_balance: Some(balance),
        } => service.create_wallet(user, wallet_type, balance).map(drop),
        Command::Open { wallet_type, .. } => service.open_signup_wallet(user, wallet_type).map(drop),
        Command::Hold {
            amount,
            reference_type,
            reference_id,
        } => service
            .hold_funds(user, amount, &reference_type, &reference_id)
            .map(drop),
        Command::Capture {
            amount,
            reference_type,
            reference_id,
        } => {
            let hold = hold_for(service, user, &reference_type, &reference_id)?;
            let description = format!("{reference_type} {reference_id} completed");
            let captured = match amount {
                Some(amount) => service.capture_partial(user, hold.id, amount, &description),
                None => service.capture_hold(user, hold.id, &description),
            };
            captured.map(drop)
        }
        Command::Release {
            reference_type,
            reference_id,
        } => {
            let hold = hold_for(service, user, &reference_type, &reference_id)?;
            service.release_hold(user, hold.id).map(drop)
        }
        Command::Debit {
            amount,
            reference_type,
            reference_id,
        } => service
            .debit(user, amount, &reference_type, &reference_id, "debit")
            .map(drop),
        Command::Credit {
            amount,
            reference_type,
            reference_id,
        } => service
            .credit(user, amount, &reference_type, &reference_id, "credit")
            .map(drop),
        Command::Commission {
            amount,
            rate,
            ride_id,
        } => service
            .deduct_commission(user, amount, rate, &ride_id)
            .map(drop),
        Command::Penalty {
            amount,
            reason,
            ride_id,
        } => service
            .deduct_penalty(user, amount, &reason, &ride_id)
            .map(drop),
        Command::Transfer {
            amount,
            to,
            description,
        } => service
            .transfer_funds(user, &to, amount, &description)
            .map(drop),
        Command::Earn {
            amount,
            reference_type,
            reference_id,
        } => service
            .credit_earnings(user, amount, &reference_type, &reference_id, "earnings")
            .map(drop),
        Command::Withdraw { amount, payout_id } => service
            .withdraw_funds(user, amount, &payout_id, "withdrawal")
            .map(drop),
        Command::Subscription {
            amount,
            plan,
            period,
        } => service
            .deduct_subscription(user, amount, &plan, &period)
            .map(drop),
        Command::CashCollect { amount, ride_id } => service
            .record_cash_collection(user, amount, &ride_id)
            .map(drop),
        Command::CashSettle {
            amount,
            settlement_id,
        } => service
            .record_cash_payment(user, amount, &settlement_id)
            .map(drop),
        Command::TopUp { amount, method } => service.top_up(user, amount, &method).map(drop),
        Command::Deactivate => service.deactivate(user).map(drop),
        Command::Sweep => {
            let report = sweep_once(service);
            info!(?report, "sweep requested");
            Ok(())
        }
    }
}

/// Replays commands from a CSV reader against `service`.
///
/// Malformed rows and failed commands are logged and skipped. Returns every
/// user that appeared in the input.
///
/// # CSV Format
///
/// Expected columns: `op, user, wallet_type, amount, reference_type, reference_id, target`
///
/// # Example
///
/// ```csv
/// op,user,wallet_type,amount,reference_type,reference_id,target
/// open,rider-1,rider,,,,
/// hold,rider-1,,500,service_order,o1,
/// capture,rider-1,,,service_order,o1,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
fn process_commands<R: Read>(
    reader: R,
    service: &WalletService,
) -> Result<BTreeSet<UserId>, csv::Error> {
    let mut users = BTreeSet::new();

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line + 2, error = %e, "skipping malformed row");
                continue;
            }
        };
        let op = record.op.clone();
        let Some((user, command)) = record.into_command() else {
            warn!(line = line + 2, op = %op, "skipping invalid command");
            continue;
        };

        users.insert(user.clone());
        if let Command::Transfer { to, .. } = &command {
            users.insert(to.clone());
        }
        match execute(service, &user, command) {
            Ok(()) => debug!(line = line + 2, op = %op, user = %user, "command applied"),
            Err(e) => warn!(line = line + 2, op = %op, user = %user, error = %e, "command failed"),
        }
    }

    Ok(users)
}

/// Output row with 2 decimal precision.
#[derive(Debug, Serialize)]
struct WalletRow {
    user: UserId,
    wallet_type: WalletType,
    balance: Decimal,
    held: Decimal,
    available: Decimal,
    restricted: bool,
    status: String,
}

impl From<&Wallet> for WalletRow {
    fn from(wallet: &Wallet) -> Self {
        Self {
            user: wallet.owner_id.clone(),
            wallet_type: wallet.wallet_type,
            balance: wallet.balance.round_dp(2),
            held: wallet.held_balance.round_dp(2),
            available: wallet.available_balance().round_dp(2),
            restricted: wallet.is_restricted,
            status: if wallet.is_active {
                wallet.account_status.to_string()
            } else {
                "inactive".to_string()
            },
        }
    }
}

/// Writes every wallet of `users` as CSV.
///
/// # CSV Format
///
/// Columns: `user, wallet_type, balance, held, available, restricted, status`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
fn write_wallets<W: Write>(
    service: &WalletService,
    users: &BTreeSet<UserId>,
    writer: W,
) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for user in users {
        let wallets = match service.wallets(user) {
            Ok(wallets) => wallets,
            Err(e) => {
                warn!(user = %user, error = %e, "cannot read wallets");
                continue;
            }
        };
        for wallet in &wallets {
            wtr.serialize(WalletRow::from(wallet))?;
        }
    }
    wtr.flush()?;
    Ok(())
}
