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

//! The ports this crate consumes from the outside world (spec §6):
//! a clock, a store of repositories, advisory locks, an idempotency store,
//! a webhook publisher, and a payment gateway. Every collaborator outside
//! this crate — the REST surface, the ORM, auth, notifications, PDF
//! rendering, SDKs, webhook transport, payment-gateway handshakes — is
//! reached only through these traits.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::alert::Alert;
use crate::credit_grant::{CreditGrant, CreditGrantApplication};
use crate::error::Result;
use crate::ids::Id;
use crate::ledger::{Wallet, WalletTransaction};
use crate::model::{Customer, Invoice, Plan, Price};
use crate::schedule::SubscriptionSchedule;
use crate::subscription::{Subscription, SubscriptionLineItem, SubscriptionPause};

/// A request-scoped context, carried through every public operation.
#[derive(Debug, Clone)]
pub struct Context {
    pub tenant_id: Id,
    pub environment_id: Id,
    pub user_id: Id,
    pub deadline: OffsetDateTime,
    pub idempotency_key: Option<String>,
}

impl Context {
    /// Returns `Err(Error::DeadlineExceeded)` once `now` has passed the
    /// context's deadline.
    pub fn check_deadline(&self, now: OffsetDateTime) -> Result<()> {
        if now > self.deadline {
            return Err(crate::error::Error::DeadlineExceeded);
        }
        Ok(())
    }
}

/// A source of time, abstracted so the engine and its tests can run against
/// a simulated clock instead of the wall clock.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
    async fn sleep(&self, d: StdDuration);
}

/// The wall-clock `Clock` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, d: StdDuration) {
        tokio::time::sleep(d).await;
    }
}

/// How long a lock acquisition is willing to wait.
#[derive(Debug, Clone, Copy)]
pub enum WaitPolicy {
    /// Fail immediately if the lock is held.
    NoWait,
    /// Wait up to the given duration.
    Timeout(StdDuration),
}

/// A handle to an acquired advisory lock. Dropping it releases the lock.
#[async_trait]
pub trait LockHandle: Send {
    async fn release(self: Box<Self>);
}

/// Exclusive advisory locks keyed by string, used to serialize operations
/// per subscription and per wallet (spec §5).
#[async_trait]
pub trait Lock: Send + Sync {
    async fn acquire(&self, key: &str, policy: WaitPolicy) -> Result<Box<dyn LockHandle>>;
}

/// A content-addressed idempotency store: replaying the same `(scope, key)`
/// returns the prior computed value without re-executing `compute`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Looks up a previously stored result for `(scope, key)`.
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;
    /// Stores the result for `(scope, key)`, serialized by the caller.
    async fn put(&self, scope: &str, key: &str, value: String) -> Result<()>;
}

/// An event published to webhook subscribers. Delivery is at-least-once and
/// out of scope for this crate; `Publisher` only needs to accept the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// A stubbed per-provider payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn attempt(&self, invoice_id: &str) -> Result<()>;
    async fn capture(&self, invoice_id: &str) -> Result<()>;
    async fn refund(&self, invoice_id: &str, amount: rust_decimal::Decimal) -> Result<()>;
}

/// Filters accepted by the various `list_*` repository methods. Each field
/// is an optional equality filter; `None` means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub customer_id: Option<Id>,
    pub status: Option<crate::subscription::SubscriptionStatus>,
    /// Restricts to subscriptions whose `current_period_end` has already
    /// passed this instant, for the background period-tick sweep.
    pub period_end_before: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub subscription_id: Option<Id>,
    pub status: Option<crate::schedule::ScheduleStatus>,
    pub due_before: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct CreditGrantApplicationFilter {
    pub credit_grant_id: Option<Id>,
    pub subscription_id: Option<Id>,
    pub status: Option<crate::credit_grant::ApplicationStatus>,
    pub due_before: Option<OffsetDateTime>,
}

/// The store port: one repository per entity named in spec §3, plus
/// `with_tx` (spec §6). Implementations must guarantee rollback on any
/// exit path out of the closure passed to `with_tx`, including an error
/// return or a panic unwind.
///
/// This crate does not prescribe a database; `memstore` ships the
/// in-memory reference implementation this crate tests against.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Subscription & friends (spec §4.E, §4.F primary aggregate) ---
    async fn get_subscription(&self, id: &str) -> Result<Subscription>;
    async fn list_subscriptions(&self, filter: &SubscriptionFilter) -> Result<Vec<Subscription>>;
    async fn create_subscription(&self, sub: Subscription) -> Result<Subscription>;
    async fn update_subscription(&self, sub: Subscription) -> Result<Subscription>;

    async fn list_line_items(&self, subscription_id: &str) -> Result<Vec<SubscriptionLineItem>>;
    async fn create_line_item(&self, item: SubscriptionLineItem) -> Result<SubscriptionLineItem>;
    async fn update_line_item(&self, item: SubscriptionLineItem) -> Result<SubscriptionLineItem>;
    async fn delete_line_item(&self, id: &str) -> Result<()>;

    async fn get_active_pause(&self, subscription_id: &str) -> Result<Option<SubscriptionPause>>;
    async fn create_pause(&self, pause: SubscriptionPause) -> Result<SubscriptionPause>;
    async fn update_pause(&self, pause: SubscriptionPause) -> Result<SubscriptionPause>;

    // --- Schedules (spec §4.F) ---
    async fn get_schedule(&self, id: &str) -> Result<SubscriptionSchedule>;
    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<SubscriptionSchedule>>;
    async fn create_schedule(&self, schedule: SubscriptionSchedule) -> Result<SubscriptionSchedule>;
    async fn update_schedule(&self, schedule: SubscriptionSchedule) -> Result<SubscriptionSchedule>;

    // --- Credit grants & applications (spec §4.C) ---
    async fn get_credit_grant(&self, id: &str) -> Result<CreditGrant>;
    async fn list_credit_grants(&self, plan_or_subscription_id: &str) -> Result<Vec<CreditGrant>>;
    async fn create_credit_grant(&self, grant: CreditGrant) -> Result<CreditGrant>;

    async fn get_credit_grant_application(&self, id: &str) -> Result<CreditGrantApplication>;
    async fn list_credit_grant_applications(
        &self,
        filter: &CreditGrantApplicationFilter,
    ) -> Result<Vec<CreditGrantApplication>>;
    async fn create_credit_grant_application(
        &self,
        cga: CreditGrantApplication,
    ) -> Result<CreditGrantApplication>;
    async fn update_credit_grant_application(
        &self,
        cga: CreditGrantApplication,
    ) -> Result<CreditGrantApplication>;

    // --- Ledger (spec §4.B) ---
    async fn get_wallet(&self, id: &str) -> Result<Wallet>;
    async fn find_active_wallet(
        &self,
        customer_id: &str,
        currency: &str,
        wallet_type: &str,
    ) -> Result<Option<Wallet>>;
    async fn create_wallet(&self, wallet: Wallet) -> Result<Wallet>;
    async fn update_wallet(&self, wallet: Wallet) -> Result<Wallet>;

    async fn list_wallet_transactions(&self, wallet_id: &str) -> Result<Vec<WalletTransaction>>;
    async fn get_wallet_transaction_by_key(
        &self,
        wallet_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<WalletTransaction>>;
    async fn create_wallet_transaction(&self, tx: WalletTransaction) -> Result<WalletTransaction>;
    async fn update_wallet_transaction(&self, tx: WalletTransaction) -> Result<WalletTransaction>;

    // --- Alerts (spec §4.G) ---
    async fn last_alert(&self, entity_id: &str, alert_metric: &str) -> Result<Option<Alert>>;
    async fn create_alert(&self, alert: Alert) -> Result<Alert>;

    // --- External collaborators, consumed read-mostly (spec §3, §1 Non-goals) ---
    async fn get_customer(&self, id: &str) -> Result<Customer>;
    async fn get_plan(&self, id: &str) -> Result<Plan>;
    async fn get_price(&self, id: &str) -> Result<Price>;
    async fn create_invoice(&self, invoice: Invoice) -> Result<Invoice>;
    async fn update_invoice(&self, invoice: Invoice) -> Result<Invoice>;
    async fn get_invoice_by_idempotency_key(&self, key: &str) -> Result<Option<Invoice>>;
    async fn list_invoices(&self, subscription_id: &str) -> Result<Vec<Invoice>>;

    /// Runs `body` inside a transactional unit of work against this same
    /// store. On `Ok`, the work is committed; on `Err` or panic unwind, it
    /// is rolled back before the error/panic propagates.
    async fn with_tx<'a>(&'a self) -> Result<Box<dyn Transaction + 'a>>;
}

/// A transactional view over [`Store`]; it exposes the identical repository
/// methods plus `commit`. Dropping a `Transaction` without calling
/// `commit` rolls it back.
#[async_trait]
pub trait Transaction: Store {
    async fn commit(self: Box<Self>) -> Result<()>;
}
