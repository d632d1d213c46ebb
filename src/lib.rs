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

//! The subscription lifecycle and credit engine at the core of FlexPrice
//! metered billing.
//!
//! This crate owns subscription state transitions, period advancement,
//! prepaid wallet credit/debit accounting, credit grant materialization,
//! mid-period proration, and deferred schedule execution. It does not own
//! HTTP transport, persistence, authentication, or invoice rendering —
//! those are reached through the [`Store`], [`Lock`], [`Clock`],
//! [`Publisher`], and [`PaymentGateway`] ports, which a host application
//! implements against its own database and API surface.
//!
//! # Maintainership
//!
//! * [View source code](https://github.com/flexprice/flexcore)
//! * [Report an issue](https://github.com/flexprice/flexcore/issues/new)
//! * [Submit a pull request](https://github.com/flexprice/flexcore/compare)
//!
//! # See also
//!
//! [`MemStore`] ships an in-memory reference implementation of every port,
//! used by this crate's own test suite and suitable as a starting point
//! for a consuming application's integration tests.

#[warn(missing_debug_implementations)]
mod alert;
mod config;
mod credit_grant;
mod engine;
mod error;
mod ids;
mod invoice;
mod ledger;
mod memstore;
mod model;
mod money;
mod ports;
mod proration;
mod schedule;
mod subscription;
mod time_grid;

pub use alert::{evaluate_past_due_grace, Alert, AlertCondition, AlertInfo, AlertState};
pub use config::{EngineBuilder, EngineConfig};
pub use credit_grant::{
    ApplicationStatus, CreditGrant, CreditGrantApplication, CreditGrantEngine, DurationUnit,
    ExpirationType, GrantCadence, GrantScope,
};
pub use engine::{ChangeOutcome, Engine};
pub use error::{Error, Result};
pub use ids::Id;
pub use invoice::PAST_DUE_GRACE_PERIOD;
pub use ledger::{
    CreditOptions, DebitOptions, Ledger, TransactionReason, TransactionStatus, TransactionType,
    Wallet, WalletConfig, WalletStatus, WalletTransaction,
};
pub use memstore::{
    AlwaysSucceedsGateway, MemIdempotencyStore, MemLock, MemPublisher, MemStore, TestClock,
};
pub use model::{
    BillingModel, Customer, EntityType, Invoice, InvoiceLineItem, InvoiceStatus, PaymentStatus,
    Plan, Price, PriceTier,
};
pub use money::{credits_to_currency, round_for_display, Decimal};
pub use ports::{
    Clock, Context, CreditGrantApplicationFilter, Event, IdempotencyStore, Lock, LockHandle,
    PaymentGateway, Publisher, ScheduleFilter, Store, SubscriptionFilter, SystemClock, Transaction,
    WaitPolicy,
};
pub use proration::{Entitlement, LineItemKind, ProrationLineItem, ProrationResult};
pub use schedule::{ScheduleConfiguration, ScheduleExecutor, ScheduleStatus, ScheduleType};
pub use subscription::{
    BillingCadence, CancellationSnapshot, CollectionMethod, InvoiceCadence, PauseMode, PauseStatus,
    PaymentBehavior, PriceType, ProrationBehavior, Subscription, SubscriptionLineItem,
    SubscriptionPause, SubscriptionStatus,
};
pub use time_grid::{lookup_tz, proration_factor, BillingCycle, BillingPeriod, PeriodGrid};
