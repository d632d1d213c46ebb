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

//! Materialises credit grants into per-period applications and applies
//! them to the ledger (spec §4.C).

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::Result;
use crate::ids::Id;
use crate::ledger::{CreditOptions, Ledger, TransactionReason, Wallet};
use crate::ports::{CreditGrantApplicationFilter, Store};
use crate::subscription::{Subscription, SubscriptionStatus};
use crate::time_grid::{BillingPeriod, PeriodGrid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantScope {
    Plan,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantCadence {
    OneTime,
    Recurring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationType {
    Never,
    Duration,
    BillingCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Days,
    Weeks,
    Months,
    Years,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: Id,
    pub scope: GrantScope,
    pub plan_id: Option<Id>,
    pub subscription_id: Option<Id>,
    pub credits: Decimal,
    pub cadence: GrantCadence,
    pub period: Option<BillingPeriod>,
    pub period_count: Option<u32>,
    pub expiration_type: ExpirationType,
    pub expiration_duration: Option<u32>,
    pub expiration_duration_unit: Option<DurationUnit>,
    pub priority: Option<i32>,
    pub conversion_rate: Option<Decimal>,
    pub topup_conversion_rate: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credit_grant_anchor: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Applied,
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrantApplication {
    pub id: Id,
    pub credit_grant_id: Id,
    pub subscription_id: Id,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub application_status: ApplicationStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub applied_at: Option<OffsetDateTime>,
    pub credits: Decimal,
    pub currency: String,
    pub application_reason: String,
    pub subscription_status_at_application: Option<SubscriptionStatus>,
    pub is_prorated: bool,
    pub proration_factor: Option<Decimal>,
    pub full_period_amount: Option<Decimal>,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    pub idempotency_key: String,
}

/// The decision the engine makes for a single CGA (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Skip,
    Defer,
    Cancel,
}

/// Decides what to do with a CGA given the owning subscription's current
/// status.
pub fn decide(status: SubscriptionStatus) -> Decision {
    match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => Decision::Apply,
        SubscriptionStatus::Paused => Decision::Defer,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Ended => Decision::Cancel,
        SubscriptionStatus::Draft | SubscriptionStatus::PastDue => Decision::Skip,
    }
}

/// The backoff applied to a deferred CGA: `30 * 2^min(retry_count, 4)` minutes.
pub fn defer_backoff(retry_count: u32) -> time::Duration {
    let exp = retry_count.min(4);
    time::Duration::minutes(30 * (1i64 << exp))
}

/// Derives the idempotency key guaranteeing at most one successful
/// application per `(grant, period)` (spec §4.C).
pub fn idempotency_key(grant_id: &str, period_start: OffsetDateTime, period_end: Option<OffsetDateTime>) -> String {
    let end = period_end.map(|e| e.unix_timestamp().to_string()).unwrap_or_default();
    crate::ids::derive_key(&[
        "credit_grant",
        grant_id,
        &period_start.unix_timestamp().to_string(),
        &end,
    ])
}

fn period_end_for(grant: &CreditGrant, period_start: OffsetDateTime, tz: &'static time_tz::Tz) -> Option<OffsetDateTime> {
    if grant.cadence == GrantCadence::OneTime {
        return None;
    }
    let period = grant.period?;
    let count = grant.period_count.unwrap_or(1);
    let grid = PeriodGrid::new(period_start, period, count, crate::time_grid::BillingCycle::Anniversary, tz).ok()?;
    Some(grid.next(period_start))
}

/// Computes a grant's expiry date for the CGA starting at `period_start`
/// (spec §4.C step APPLY.2).
fn expiry_date(
    grant: &CreditGrant,
    period_start: OffsetDateTime,
    subscription: &Subscription,
    tz: &'static time_tz::Tz,
) -> Result<Option<OffsetDateTime>> {
    match grant.expiration_type {
        ExpirationType::Never => Ok(None),
        ExpirationType::Duration => {
            let n = grant.expiration_duration.unwrap_or(0) as i64;
            let unit = grant.expiration_duration_unit.unwrap_or(DurationUnit::Days);
            Ok(Some(match unit {
                DurationUnit::Days => period_start + time::Duration::days(n),
                DurationUnit::Weeks => period_start + time::Duration::weeks(n),
                DurationUnit::Months => {
                    let grid = PeriodGrid::new(period_start, BillingPeriod::Monthly, 1, crate::time_grid::BillingCycle::Anniversary, tz)?;
                    let mut d = period_start;
                    for _ in 0..n {
                        d = grid.next(d);
                    }
                    d
                }
                DurationUnit::Years => {
                    let grid = PeriodGrid::new(period_start, BillingPeriod::Annual, 1, crate::time_grid::BillingCycle::Anniversary, tz)?;
                    let mut d = period_start;
                    for _ in 0..n {
                        d = grid.next(d);
                    }
                    d
                }
            }))
        }
        ExpirationType::BillingCycle => {
            let grid = subscription.grid(tz)?;
            let (_, end) = grid.interval_containing(period_start);
            Ok(Some(end))
        }
    }
}

/// The engine that materialises grants and drives their applications.
pub struct CreditGrantEngine {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    batch_size: usize,
}

impl CreditGrantEngine {
    pub fn new(store: Arc<dyn Store>, ledger: Arc<Ledger>, batch_size: usize) -> CreditGrantEngine {
        CreditGrantEngine { store, ledger, batch_size }
    }

    /// Creates a subscription-scope grant's first CGA, eagerly processing
    /// it in the same unit of work if its anchor has already passed
    /// (spec §4.C "Materialisation").
    pub async fn materialise(
        &self,
        grant: &CreditGrant,
        subscription: &Subscription,
        tz: &'static time_tz::Tz,
        now: OffsetDateTime,
    ) -> Result<CreditGrantApplication> {
        let existing = self
            .store
            .list_credit_grant_applications(&CreditGrantApplicationFilter {
                credit_grant_id: Some(grant.id.clone()),
                subscription_id: Some(subscription.id.clone()),
                ..Default::default()
            })
            .await?;
        if let Some(first) = existing.into_iter().next() {
            return Ok(first);
        }

        let scheduled_for = grant.credit_grant_anchor.or(grant.start_date).unwrap_or(now);
        let period_start = scheduled_for;
        let period_end = period_end_for(grant, period_start, tz);
        let cga = CreditGrantApplication {
            id: crate::ids::new_id(),
            credit_grant_id: grant.id.clone(),
            subscription_id: subscription.id.clone(),
            scheduled_for,
            period_start,
            period_end,
            application_status: ApplicationStatus::Pending,
            applied_at: None,
            credits: grant.credits,
            currency: subscription.currency.clone(),
            application_reason: "credit_grant".into(),
            subscription_status_at_application: None,
            is_prorated: false,
            proration_factor: None,
            full_period_amount: Some(grant.credits),
            retry_count: 0,
            failure_reason: None,
            next_retry_at: None,
            idempotency_key: idempotency_key(&grant.id, period_start, period_end),
        };
        let cga = self.store.create_credit_grant_application(cga).await?;

        if scheduled_for <= now {
            return self.process(cga, grant, subscription, tz, now).await;
        }
        Ok(cga)
    }

    /// Processes one CGA to completion: decides, then applies/skips/defers/cancels.
    pub async fn process(
        &self,
        mut cga: CreditGrantApplication,
        grant: &CreditGrant,
        subscription: &Subscription,
        tz: &'static time_tz::Tz,
        now: OffsetDateTime,
    ) -> Result<CreditGrantApplication> {
        match decide(subscription.status) {
            Decision::Apply => self.apply(cga, grant, subscription, tz, now).await,
            Decision::Skip => {
                cga.application_status = ApplicationStatus::Skipped;
                let cga = self.store.update_credit_grant_application(cga).await?;
                self.create_next_if_recurring(&cga, grant, tz).await?;
                Ok(cga)
            }
            Decision::Defer => {
                let backoff = defer_backoff(cga.retry_count);
                cga.retry_count += 1;
                cga.scheduled_for = now + backoff;
                cga.next_retry_at = Some(cga.scheduled_for);
                cga.application_status = ApplicationStatus::Pending;
                info!(cga_id = %cga.id, retry_count = cga.retry_count, scheduled_for = %cga.scheduled_for, "credit grant application deferred (subscription paused)");
                self.store.update_credit_grant_application(cga).await
            }
            Decision::Cancel => {
                cga.application_status = ApplicationStatus::Cancelled;
                let cga = self.store.update_credit_grant_application(cga).await?;
                self.cancel_siblings(grant).await?;
                Ok(cga)
            }
        }
    }

    async fn cancel_siblings(&self, grant: &CreditGrant) -> Result<()> {
        let siblings = self
            .store
            .list_credit_grant_applications(&CreditGrantApplicationFilter {
                credit_grant_id: Some(grant.id.clone()),
                ..Default::default()
            })
            .await?;
        for mut sibling in siblings {
            if matches!(
                sibling.application_status,
                ApplicationStatus::Pending | ApplicationStatus::Failed
            ) {
                sibling.application_status = ApplicationStatus::Cancelled;
                self.store.update_credit_grant_application(sibling).await?;
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        mut cga: CreditGrantApplication,
        grant: &CreditGrant,
        subscription: &Subscription,
        tz: &'static time_tz::Tz,
        now: OffsetDateTime,
    ) -> Result<CreditGrantApplication> {
        let outcome = self.try_apply(&mut cga, grant, subscription, tz, now).await;
        match outcome {
            Ok(applied) => Ok(applied),
            Err(err) => {
                warn!(cga_id = %cga.id, error = %err, "credit grant application failed");
                cga.application_status = ApplicationStatus::Failed;
                cga.failure_reason = Some(err.to_string());
                self.store.update_credit_grant_application(cga).await?;
                Err(err)
            }
        }
    }

    async fn try_apply(
        &self,
        cga: &mut CreditGrantApplication,
        grant: &CreditGrant,
        subscription: &Subscription,
        tz: &'static time_tz::Tz,
        now: OffsetDateTime,
    ) -> Result<CreditGrantApplication> {
        let wallet = self.resolve_wallet(grant, subscription, now).await?;
        let expiry = expiry_date(grant, cga.period_start, subscription, tz)?;

        if let Some(exp) = expiry {
            if exp < now {
                cga.application_status = ApplicationStatus::Skipped;
                cga.failure_reason = Some("computed expiry_date already elapsed".into());
                let cga = self.store.update_credit_grant_application(cga.clone()).await?;
                self.create_next_if_recurring(&cga, grant, tz).await?;
                return Ok(cga);
            }
        }

        self.ledger
            .credit(
                &wallet.id,
                cga.credits,
                CreditOptions {
                    expiry_date: expiry,
                    priority: grant.priority,
                    reason: TransactionReason::CreditGrant,
                    reference_type: "credit_grant_application".into(),
                    reference_id: cga.id.clone(),
                    idempotency_key: cga.id.clone(),
                },
                now,
            )
            .await?;

        cga.application_status = ApplicationStatus::Applied;
        cga.applied_at = Some(now);
        cga.subscription_status_at_application = Some(subscription.status);
        let cga = self.store.update_credit_grant_application(cga.clone()).await?;
        self.create_next_if_recurring(&cga, grant, tz).await?;
        Ok(cga)
    }

    async fn create_next_if_recurring(
        &self,
        cga: &CreditGrantApplication,
        grant: &CreditGrant,
        tz: &'static time_tz::Tz,
    ) -> Result<()> {
        if grant.cadence != GrantCadence::Recurring {
            return Ok(());
        }
        let Some(prev_end) = cga.period_end else {
            return Ok(());
        };
        let next_period_start = prev_end;
        let next_period_end = period_end_for(grant, next_period_start, tz);
        let next = CreditGrantApplication {
            id: crate::ids::new_id(),
            credit_grant_id: grant.id.clone(),
            subscription_id: cga.subscription_id.clone(),
            scheduled_for: next_period_start,
            period_start: next_period_start,
            period_end: next_period_end,
            application_status: ApplicationStatus::Pending,
            applied_at: None,
            credits: grant.credits,
            currency: cga.currency.clone(),
            application_reason: "credit_grant".into(),
            subscription_status_at_application: None,
            is_prorated: false,
            proration_factor: None,
            full_period_amount: Some(grant.credits),
            retry_count: 0,
            failure_reason: None,
            next_retry_at: None,
            idempotency_key: idempotency_key(&grant.id, next_period_start, next_period_end),
        };
        self.store.create_credit_grant_application(next).await?;
        Ok(())
    }

    async fn resolve_wallet(
        &self,
        grant: &CreditGrant,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> Result<Wallet> {
        let conversion_rate = grant.conversion_rate.unwrap_or(Decimal::ONE);
        let topup_conversion_rate = grant.topup_conversion_rate.unwrap_or(conversion_rate);
        if let Some(wallet) = self
            .store
            .find_active_wallet(&subscription.customer_id, &subscription.currency, "prepaid")
            .await?
        {
            let rate_matches = grant.conversion_rate.map(|r| r == wallet.conversion_rate).unwrap_or(true);
            let topup_rate_matches = grant
                .topup_conversion_rate
                .map(|r| r == wallet.topup_conversion_rate)
                .unwrap_or(true);
            if rate_matches && topup_rate_matches {
                return Ok(wallet);
            }
        }
        let wallet = Wallet::new_default(
            crate::ids::new_id(),
            subscription.customer_id.clone(),
            subscription.currency.clone(),
            conversion_rate,
            topup_conversion_rate,
            now,
        );
        self.store.create_wallet(wallet).await
    }

    /// Re-evaluates every CGA due at or before `now`, driving the §4.C
    /// decision loop. Intended to be called by a background poll loop
    /// (spec §4.F "Background tasks", §5 "bounded batches").
    pub async fn process_due(&self, now: OffsetDateTime, tz: &'static time_tz::Tz) -> Result<usize> {
        let due = self
            .store
            .list_credit_grant_applications(&CreditGrantApplicationFilter {
                due_before: Some(now),
                status: Some(ApplicationStatus::Pending),
                ..Default::default()
            })
            .await?;
        let mut processed = 0;
        for cga in due.into_iter().take(self.batch_size) {
            if cga.scheduled_for > now {
                continue;
            }
            let grant = self.store.get_credit_grant(&cga.credit_grant_id).await?;
            let subscription = self.store.get_subscription(&cga.subscription_id).await?;
            let _ = self.process(cga, &grant, &subscription, tz, now).await;
            processed += 1;
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table_matches_spec() {
        assert_eq!(decide(SubscriptionStatus::Active), Decision::Apply);
        assert_eq!(decide(SubscriptionStatus::Trialing), Decision::Apply);
        assert_eq!(decide(SubscriptionStatus::Paused), Decision::Defer);
        assert_eq!(decide(SubscriptionStatus::Cancelled), Decision::Cancel);
        assert_eq!(decide(SubscriptionStatus::Ended), Decision::Cancel);
        assert_eq!(decide(SubscriptionStatus::Draft), Decision::Skip);
    }

    #[test]
    fn defer_backoff_caps_exponent_at_four() {
        assert_eq!(defer_backoff(0), time::Duration::minutes(30));
        assert_eq!(defer_backoff(4), time::Duration::minutes(30 * 16));
        assert_eq!(defer_backoff(10), time::Duration::minutes(30 * 16));
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        use time::macros::datetime;
        let a = idempotency_key("grant_1", datetime!(2025-03-01 0:00 UTC), Some(datetime!(2025-04-01 0:00 UTC)));
        let b = idempotency_key("grant_1", datetime!(2025-03-01 0:00 UTC), Some(datetime!(2025-04-01 0:00 UTC)));
        let c = idempotency_key("grant_1", datetime!(2025-04-01 0:00 UTC), Some(datetime!(2025-05-01 0:00 UTC)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
