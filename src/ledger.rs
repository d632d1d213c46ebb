// Copyright FlexPrice, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The wallet ledger: a monotonic credit/debit transaction log with
//! FIFO, expiry-aware credit selection, and the double-entry invariants
//! that tie `balance` to `credit_balance` (spec §3, §4.B).

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::alert;
use crate::error::{Error, Result};
use crate::ids::Id;
use crate::ports::{Lock, Store, WaitPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Frozen,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WalletConfig {
    pub allowed_price_types: Vec<crate::subscription::PriceType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Id,
    pub customer_id: Id,
    pub currency: String,
    pub wallet_type: String,
    pub status: WalletStatus,
    pub balance: Decimal,
    pub credit_balance: Decimal,
    pub conversion_rate: Decimal,
    pub topup_conversion_rate: Decimal,
    pub config: WalletConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Wallet {
    pub fn new_default(
        id: Id,
        customer_id: Id,
        currency: String,
        conversion_rate: Decimal,
        topup_conversion_rate: Decimal,
        now: OffsetDateTime,
    ) -> Wallet {
        Wallet {
            id,
            customer_id,
            currency,
            wallet_type: "prepaid".into(),
            status: WalletStatus::Active,
            balance: Decimal::ZERO,
            credit_balance: Decimal::ZERO,
            conversion_rate,
            topup_conversion_rate,
            config: WalletConfig {
                allowed_price_types: vec![crate::subscription::PriceType::Usage],
            },
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Why a credit or debit was made. `ManualBalanceDebit` is the one reason
/// permitted to overdraw a wallet (spec §4.B step 5).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionReason {
    CreditGrant,
    PurchasedCreditDirect,
    PurchasedCreditInvoiced,
    InvoiceDebit,
    ManualBalanceDebit,
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Id,
    pub wallet_id: Id,
    pub tx_type: TransactionType,
    pub amount: Decimal,
    pub credit_amount: Decimal,
    pub credit_balance_before: Decimal,
    pub credit_balance_after: Decimal,
    /// Only meaningful on credit rows; decreases as FIFO debits consume it.
    pub credits_available: Decimal,
    pub transaction_reason: TransactionReason,
    pub reference_type: String,
    pub reference_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiry_date: Option<OffsetDateTime>,
    pub priority: Option<i32>,
    pub tx_status: TransactionStatus,
    pub idempotency_key: String,
    pub conversion_rate: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Options accepted by [`Ledger::credit`].
#[derive(Debug, Clone)]
pub struct CreditOptions {
    pub expiry_date: Option<OffsetDateTime>,
    pub priority: Option<i32>,
    pub reason: TransactionReason,
    pub reference_type: String,
    pub reference_id: String,
    pub idempotency_key: String,
}

/// Options accepted by [`Ledger::debit`].
#[derive(Debug, Clone)]
pub struct DebitOptions {
    pub reason: TransactionReason,
    pub reference_type: String,
    pub reference_id: String,
    pub idempotency_key: String,
    /// The period end of the invoice this debit is for, if any; used as the
    /// time reference for expiry checks (spec §4.B step 2).
    pub time_reference: Option<OffsetDateTime>,
}

/// The ledger: every operation takes an exclusive lock on `wallet_id` and
/// commits a single transactional unit of work (spec §4.B, §5).
pub struct Ledger {
    store: Arc<dyn Store>,
    lock: Arc<dyn Lock>,
    wallet_lock_timeout: std::time::Duration,
    low_balance_threshold: Decimal,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn Store>,
        lock: Arc<dyn Lock>,
        wallet_lock_timeout: std::time::Duration,
        low_balance_threshold: Decimal,
    ) -> Ledger {
        Ledger {
            store,
            lock,
            wallet_lock_timeout,
            low_balance_threshold,
        }
    }

    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::Timeout(self.wallet_lock_timeout)
    }

    /// Credits `wallet_id` with `credits`, idempotent on `opts.idempotency_key`.
    ///
    /// `purchased_credit_invoiced` is held `pending` and excluded from the
    /// wallet's balance until the external invoice is paid; every other
    /// reason credits immediately (spec §4.B "Top-up variants"). Callers
    /// settle a pending top-up with [`Ledger::settle_pending_credit`].
    pub async fn credit(
        &self,
        wallet_id: &str,
        credits: Decimal,
        opts: CreditOptions,
        now: OffsetDateTime,
    ) -> Result<WalletTransaction> {
        crate::money::validate(credits, false)?;
        let handle = self.lock.acquire(&lock_key(wallet_id), self.wait_policy()).await?;

        let result = async {
            if let Some(existing) = self
                .store
                .get_wallet_transaction_by_key(wallet_id, &opts.idempotency_key)
                .await?
            {
                return Ok(existing);
            }

            let pending = opts.reason == TransactionReason::PurchasedCreditInvoiced;

            let tx = self.store.with_tx().await?;
            let mut wallet = tx.get_wallet(wallet_id).await?;
            let before = wallet.credit_balance;
            let after = if pending { before } else { before + credits };

            let row = WalletTransaction {
                id: crate::ids::new_id(),
                wallet_id: wallet_id.to_string(),
                tx_type: TransactionType::Credit,
                amount: crate::money::credits_to_currency(credits, wallet.conversion_rate, 2),
                credit_amount: credits,
                credit_balance_before: before,
                credit_balance_after: after,
                credits_available: if pending { Decimal::ZERO } else { credits },
                transaction_reason: opts.reason,
                reference_type: opts.reference_type,
                reference_id: opts.reference_id,
                expiry_date: opts.expiry_date,
                priority: opts.priority,
                tx_status: if pending { TransactionStatus::Pending } else { TransactionStatus::Completed },
                idempotency_key: opts.idempotency_key,
                conversion_rate: Some(wallet.conversion_rate),
                created_at: now,
            };
            let row = tx.create_wallet_transaction(row).await?;

            if pending {
                tx.commit().await?;
                info!(wallet_id, credits = %credits, "ledger credit recorded pending invoice payment");
                return Ok(row);
            }

            wallet.credit_balance = after;
            wallet.balance = crate::money::credits_to_currency(after, wallet.conversion_rate, 2);
            wallet.updated_at = now;
            verify_invariant(&wallet, &row)?;
            tx.update_wallet(wallet.clone()).await?;
            tx.commit().await?;

            info!(wallet_id, credits = %credits, "ledger credit applied");
            alert::evaluate_wallet_threshold(self.store.as_ref(), &wallet, self.low_balance_threshold, now).await;
            Ok(row)
        }
        .await;

        handle.release().await;
        result
    }

    /// Applies the deferred balance change for a `purchased_credit_invoiced`
    /// top-up once its external invoice has been paid (spec §4.B). Idempotent:
    /// a transaction already `completed` is returned unchanged.
    pub async fn settle_pending_credit(
        &self,
        wallet_id: &str,
        idempotency_key: &str,
        now: OffsetDateTime,
    ) -> Result<WalletTransaction> {
        let handle = self.lock.acquire(&lock_key(wallet_id), self.wait_policy()).await?;

        let result = async {
            let tx = self.store.with_tx().await?;
            let mut row = tx
                .get_wallet_transaction_by_key(wallet_id, idempotency_key)
                .await?
                .ok_or_else(|| Error::not_found("wallet_transaction", idempotency_key))?;
            if row.tx_status == TransactionStatus::Completed {
                tx.commit().await?;
                return Ok(row);
            }

            let mut wallet = tx.get_wallet(wallet_id).await?;
            let before = wallet.credit_balance;
            let after = before + row.credit_amount;

            row.credit_balance_before = before;
            row.credit_balance_after = after;
            row.credits_available = row.credit_amount;
            row.tx_status = TransactionStatus::Completed;
            let row = tx.update_wallet_transaction(row).await?;

            wallet.credit_balance = after;
            wallet.balance = crate::money::credits_to_currency(after, wallet.conversion_rate, 2);
            wallet.updated_at = now;
            verify_invariant(&wallet, &row)?;
            tx.update_wallet(wallet.clone()).await?;
            tx.commit().await?;

            info!(wallet_id, credits = %row.credit_amount, "pending ledger credit settled");
            alert::evaluate_wallet_threshold(self.store.as_ref(), &wallet, self.low_balance_threshold, now).await;
            Ok(row)
        }
        .await;

        handle.release().await;
        result
    }

    /// Debits `wallet_id`, consuming eligible credit FIFO by expiry then
    /// priority then age (spec §4.B).
    pub async fn debit(
        &self,
        wallet_id: &str,
        credits: Decimal,
        opts: DebitOptions,
        now: OffsetDateTime,
    ) -> Result<WalletTransaction> {
        crate::money::validate(credits, false)?;
        let handle = self.lock.acquire(&lock_key(wallet_id), self.wait_policy()).await?;

        let result = async {
            if let Some(existing) = self
                .store
                .get_wallet_transaction_by_key(wallet_id, &opts.idempotency_key)
                .await?
            {
                return Ok(existing);
            }

            let tx = self.store.with_tx().await?;
            let mut wallet = tx.get_wallet(wallet_id).await?;
            let time_reference = opts.time_reference.unwrap_or(now);

            let mut eligible: Vec<WalletTransaction> = tx
                .list_wallet_transactions(wallet_id)
                .await?
                .into_iter()
                .filter(|t| {
                    t.tx_type == TransactionType::Credit
                        && t.credits_available > Decimal::ZERO
                        && !is_expired(t, time_reference)
                })
                .collect();
            eligible.sort_by(|a, b| {
                fifo_key(a, time_reference).cmp(&fifo_key(b, time_reference))
            });

            let available: Decimal = eligible.iter().map(|t| t.credits_available).sum();
            let allow_overdraw = opts.reason == TransactionReason::ManualBalanceDebit;
            if available < credits && !allow_overdraw {
                return Err(Error::InsufficientBalance {
                    wallet_id: wallet_id.to_string(),
                    needed: credits,
                    available,
                });
            }

            let mut remaining = credits;
            for source in &mut eligible {
                if remaining <= Decimal::ZERO {
                    break;
                }
                let take = remaining.min(source.credits_available);
                source.credits_available -= take;
                remaining -= take;
                tx.update_wallet_transaction(source.clone()).await?;
            }

            let before = wallet.credit_balance;
            let after = before - credits;
            let row = WalletTransaction {
                id: crate::ids::new_id(),
                wallet_id: wallet_id.to_string(),
                tx_type: TransactionType::Debit,
                amount: crate::money::credits_to_currency(credits, wallet.conversion_rate, 2),
                credit_amount: credits,
                credit_balance_before: before,
                credit_balance_after: after,
                credits_available: Decimal::ZERO,
                transaction_reason: opts.reason,
                reference_type: opts.reference_type,
                reference_id: opts.reference_id,
                expiry_date: None,
                priority: None,
                tx_status: TransactionStatus::Completed,
                idempotency_key: opts.idempotency_key,
                conversion_rate: Some(wallet.conversion_rate),
                created_at: now,
            };
            let row = tx.create_wallet_transaction(row).await?;

            wallet.credit_balance = after;
            wallet.balance = crate::money::credits_to_currency(after, wallet.conversion_rate, 2);
            wallet.updated_at = now;
            verify_invariant(&wallet, &row)?;
            tx.update_wallet(wallet.clone()).await?;
            tx.commit().await?;

            info!(wallet_id, credits = %credits, "ledger debit applied");
            alert::evaluate_wallet_threshold(self.store.as_ref(), &wallet, self.low_balance_threshold, now).await;
            Ok(row)
        }
        .await;

        handle.release().await;
        result
    }
}

fn lock_key(wallet_id: &str) -> String {
    format!("wallet:{wallet_id}")
}

fn is_expired(tx: &WalletTransaction, time_reference: OffsetDateTime) -> bool {
    tx.expiry_date.map(|e| e <= time_reference).unwrap_or(false)
}

/// The FIFO sort key (spec §4.B step 3): ascending expiry (nulls last),
/// descending priority (nulls last), ascending created_at, then id.
fn fifo_key(tx: &WalletTransaction, _time_reference: OffsetDateTime) -> (i64, i32, OffsetDateTime, String) {
    let expiry_rank = tx
        .expiry_date
        .map(|e| e.unix_timestamp())
        .unwrap_or(i64::MAX);
    let priority_rank = tx.priority.map(|p| -p).unwrap_or(i32::MAX);
    (expiry_rank, priority_rank, tx.created_at, tx.id.clone())
}

fn verify_invariant(wallet: &Wallet, row: &WalletTransaction) -> Result<()> {
    if row.credit_balance_before != wallet.credit_balance - signed_delta(row) {
        return Err(Error::LedgerInvariant {
            wallet_id: wallet.id.clone(),
            detail: "credit_balance_before does not match wallet's pre-transaction balance".into(),
        });
    }
    let expected_balance = crate::money::credits_to_currency(wallet.credit_balance, wallet.conversion_rate, 2);
    if wallet.balance != expected_balance {
        return Err(Error::LedgerInvariant {
            wallet_id: wallet.id.clone(),
            detail: format!(
                "balance {} does not equal credit_balance*conversion_rate {}",
                wallet.balance, expected_balance
            ),
        });
    }
    Ok(())
}

fn signed_delta(row: &WalletTransaction) -> Decimal {
    match row.tx_type {
        TransactionType::Credit => row.credit_amount,
        TransactionType::Debit => -row.credit_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(credits: Decimal, expiry: Option<OffsetDateTime>, priority: Option<i32>, created_at: OffsetDateTime, id: &str) -> WalletTransaction {
        WalletTransaction {
            id: id.into(),
            wallet_id: "wal_1".into(),
            tx_type: TransactionType::Credit,
            amount: credits,
            credit_amount: credits,
            credit_balance_before: Decimal::ZERO,
            credit_balance_after: credits,
            credits_available: credits,
            transaction_reason: TransactionReason::PurchasedCreditDirect,
            reference_type: "test".into(),
            reference_id: "test".into(),
            expiry_date: expiry,
            priority,
            tx_status: TransactionStatus::Completed,
            idempotency_key: id.into(),
            conversion_rate: Some(Decimal::ONE),
            created_at,
        }
    }

    #[test]
    fn fifo_sorts_by_expiry_then_priority_then_age() {
        use time::macros::datetime;
        let now = datetime!(2025-03-25 12:00 UTC);
        let mut txs = [
            tx(Decimal::from(100), None, None, datetime!(2025-03-15 0:00 UTC), "a"),
            tx(Decimal::from(50), Some(datetime!(2025-03-30 0:00 UTC)), None, datetime!(2025-03-20 0:00 UTC), "b"),
        ];
        txs.sort_by_key(|a| fifo_key(a, now));
        assert_eq!(txs[0].id, "b");
        assert_eq!(txs[1].id, "a");
    }
}
