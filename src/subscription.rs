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

//! Subscriptions, their line items and pauses, and the state machine that
//! governs status transitions and period advancement (spec §3, §4.E).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::ids::Id;
use crate::time_grid::{BillingCycle, BillingPeriod, PeriodGrid};

/// The lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Draft,
    Trialing,
    Active,
    PastDue,
    Paused,
    Cancelled,
    Ended,
}

/// `recurring` bills every period; `one-time` bills once and never advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCadence {
    Recurring,
    OneTime,
}

/// Whether an invoice for a period is raised at its start or its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceCadence {
    Advance,
    Arrear,
}

/// How a subscription or grant collects payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    ChargeAutomatically,
    SendInvoice,
}

/// The caller's requested payment behavior on subscription creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentBehavior {
    AllowIncomplete,
    ErrorIfIncomplete,
}

/// How mid-period changes are priced (spec §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    None,
    CreateProrations,
    AlwaysInvoice,
}

/// A subscription: the unit the state machine and orchestrator operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Id,
    pub customer_id: Id,
    pub plan_id: Id,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub billing_cadence: BillingCadence,
    pub billing_period: BillingPeriod,
    pub billing_period_count: u32,
    pub billing_cycle: BillingCycle,
    #[serde(with = "time::serde::rfc3339")]
    pub billing_anchor: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    pub pause_status: Option<PauseStatus>,
    pub active_pause_id: Option<Id>,
    pub collection_method: CollectionMethod,
    pub payment_behavior: PaymentBehavior,
    pub proration_behavior: ProrationBehavior,
    pub commitment_amount: Option<Decimal>,
    pub overage_factor: Decimal,
    pub invoicing_customer_id: Option<Id>,
}

/// A snapshot of a Price attached to a Subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionLineItem {
    pub id: Id,
    pub subscription_id: Id,
    pub customer_id: Id,
    pub plan_id: Option<Id>,
    pub price_id: Id,
    pub price_type: PriceType,
    pub meter_id: Option<Id>,
    pub quantity: Decimal,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub invoice_cadence: InvoiceCadence,
    pub trial_period: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    /// Exclusive: a line item whose interval does not intersect a period is
    /// not billed for that period.
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

impl SubscriptionLineItem {
    /// Whether this line item's own active interval intersects `[start, end)`.
    pub fn intersects(&self, start: OffsetDateTime, end: OffsetDateTime) -> bool {
        let item_start = self.start_date.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let active_from_before_end = item_start < end;
        let active_until_after_start = self.end_date.map(|e| e > start).unwrap_or(true);
        active_from_before_end && active_until_after_start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Fixed,
    Usage,
}

/// Whether a pause takes effect immediately or at the next period boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    Immediate,
    AtPeriodEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseStatus {
    Scheduled,
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPause {
    pub id: Id,
    pub subscription_id: Id,
    pub mode: PauseMode,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resumes_at: Option<OffsetDateTime>,
    pub status: PauseStatus,
}

impl Subscription {
    /// Builds the period grid implied by this subscription's anchor,
    /// cadence, and customer timezone (spec §4.A).
    pub fn grid(&self, tz: &'static time_tz::Tz) -> Result<PeriodGrid> {
        PeriodGrid::new(
            self.billing_anchor,
            self.billing_period,
            self.billing_period_count,
            self.billing_cycle,
            tz,
        )
    }

    fn transition_error(&self, event: &'static str) -> Error {
        Error::InvalidTransition {
            entity: "subscription",
            from: format!("{:?}", self.status),
            event,
        }
    }

    /// draft -> active/trialing (spec §4.E `Activate`).
    pub fn activate(
        &mut self,
        now: OffsetDateTime,
        tz: &'static time_tz::Tz,
        start_trial: bool,
    ) -> Result<()> {
        if self.status != SubscriptionStatus::Draft {
            return Err(self.transition_error("Activate"));
        }
        let grid = self.grid(tz)?;
        let (period_start, period_end) = grid.interval_containing(self.start_date.max(now));
        self.current_period_start = period_start;
        self.current_period_end = period_end;
        self.status = if start_trial {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        };
        Ok(())
    }

    /// trialing -> active (spec §4.E `trial_end_reached`).
    pub fn end_trial(&mut self, now: OffsetDateTime, tz: &'static time_tz::Tz) -> Result<()> {
        if self.status != SubscriptionStatus::Trialing {
            return Err(self.transition_error("trial_end_reached"));
        }
        self.status = SubscriptionStatus::Active;
        if now >= self.current_period_end {
            self.period_tick(now, tz)?;
        }
        Ok(())
    }

    /// Advances `current_period_*` while `now >= current_period_end`,
    /// keeping periods contiguous with no gaps or overlaps (invariant 4).
    pub fn period_tick(&mut self, now: OffsetDateTime, tz: &'static time_tz::Tz) -> Result<bool> {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        ) {
            return Ok(false);
        }
        let grid = self.grid(tz)?;
        let mut advanced = false;
        while now >= self.current_period_end {
            self.current_period_start = self.current_period_end;
            self.current_period_end = grid.next(self.current_period_end);
            advanced = true;
        }
        Ok(advanced)
    }

    /// active -> paused, taking effect immediately. Records `pause_id` as
    /// the subscription's single active pause (spec §3 `SubscriptionPause`
    /// invariant).
    pub fn pause_immediate(&mut self, now: OffsetDateTime, pause_id: Id) -> Result<()> {
        if self.status != SubscriptionStatus::Active {
            return Err(self.transition_error("pause"));
        }
        self.status = SubscriptionStatus::Paused;
        self.pause_status = Some(PauseStatus::Active);
        self.active_pause_id = Some(pause_id);
        let _ = now;
        Ok(())
    }

    /// paused -> active, extending `current_period_end` by the pause
    /// duration so the customer is not billed for paused time.
    pub fn resume(&mut self, now: OffsetDateTime, paused_since: OffsetDateTime) -> Result<()> {
        if self.status != SubscriptionStatus::Paused {
            return Err(self.transition_error("resume"));
        }
        let pause_duration = now - paused_since;
        self.current_period_end += pause_duration;
        self.status = SubscriptionStatus::Active;
        self.active_pause_id = None;
        self.pause_status = None;
        Ok(())
    }

    /// active -> cancelled, effective now.
    pub fn cancel_immediate(&mut self, now: OffsetDateTime) -> Result<()> {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        ) {
            return Err(self.transition_error("cancel(immediate)"));
        }
        self.status = SubscriptionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.end_date = Some(now);
        Ok(())
    }

    /// active -> active, with cancellation armed for the period boundary.
    pub fn arm_cancel_at_period_end(&mut self) -> Result<()> {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) {
            return Err(self.transition_error("cancel(end_of_period)"));
        }
        self.cancel_at_period_end = true;
        self.cancel_at = Some(self.current_period_end);
        Ok(())
    }

    /// Restores the fields captured before `arm_cancel_at_period_end`,
    /// undoing it (spec §4.F reversibility, invariant 7).
    pub fn restore_cancellation_snapshot(&mut self, snapshot: &CancellationSnapshot) {
        self.cancel_at_period_end = snapshot.cancel_at_period_end;
        self.cancel_at = snapshot.cancel_at;
        self.end_date = snapshot.end_date;
        self.cancelled_at = snapshot.cancelled_at;
    }

    /// cancelled/active -> ended, when a scheduled cancellation or plan
    /// change fires.
    pub fn end(&mut self, now: OffsetDateTime) {
        self.status = SubscriptionStatus::Ended;
        self.end_date = Some(now);
    }
}

/// The pre-change field values a cancellation schedule must restore on
/// reversal (spec §3 `SubscriptionSchedule`, invariant 7).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CancellationSnapshot {
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
}

impl CancellationSnapshot {
    pub fn capture(sub: &Subscription) -> CancellationSnapshot {
        CancellationSnapshot {
            cancel_at_period_end: sub.cancel_at_period_end,
            cancel_at: sub.cancel_at,
            end_date: sub.end_date,
            cancelled_at: sub.cancelled_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_grid::lookup_tz;
    use time::macros::datetime;

    fn draft_subscription() -> Subscription {
        Subscription {
            id: "sub_1".into(),
            customer_id: "cus_1".into(),
            plan_id: "plan_1".into(),
            currency: "USD".into(),
            status: SubscriptionStatus::Draft,
            billing_cadence: BillingCadence::Recurring,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_cycle: BillingCycle::Anniversary,
            billing_anchor: datetime!(2025-03-15 0:00 UTC),
            start_date: datetime!(2025-03-15 0:00 UTC),
            current_period_start: datetime!(2025-03-15 0:00 UTC),
            current_period_end: datetime!(2025-03-15 0:00 UTC),
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            cancel_at: None,
            cancelled_at: None,
            end_date: None,
            pause_status: None,
            active_pause_id: None,
            collection_method: CollectionMethod::ChargeAutomatically,
            payment_behavior: PaymentBehavior::AllowIncomplete,
            proration_behavior: ProrationBehavior::CreateProrations,
            commitment_amount: None,
            overage_factor: Decimal::ONE,
            invoicing_customer_id: None,
        }
    }

    #[test]
    fn activate_sets_period_and_status() {
        let tz = lookup_tz("UTC").unwrap();
        let mut sub = draft_subscription();
        sub.activate(datetime!(2025-03-15 0:00 UTC), tz, false).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.current_period_start, datetime!(2025-03-15 0:00 UTC));
        assert_eq!(sub.current_period_end, datetime!(2025-04-15 0:00 UTC));
    }

    #[test]
    fn double_activate_is_invalid_transition() {
        let tz = lookup_tz("UTC").unwrap();
        let mut sub = draft_subscription();
        sub.activate(datetime!(2025-03-15 0:00 UTC), tz, false).unwrap();
        let err = sub.activate(datetime!(2025-03-15 0:00 UTC), tz, false).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn cancel_at_period_end_then_restore() {
        let tz = lookup_tz("UTC").unwrap();
        let mut sub = draft_subscription();
        sub.activate(datetime!(2025-03-15 0:00 UTC), tz, false).unwrap();
        let snapshot = CancellationSnapshot::capture(&sub);
        sub.arm_cancel_at_period_end().unwrap();
        assert!(sub.cancel_at_period_end);
        sub.restore_cancellation_snapshot(&snapshot);
        assert!(!sub.cancel_at_period_end);
        assert_eq!(sub.cancel_at, None);
    }

    #[test]
    fn resume_extends_period_end_by_pause_duration() {
        let tz = lookup_tz("UTC").unwrap();
        let mut sub = draft_subscription();
        sub.activate(datetime!(2025-03-15 0:00 UTC), tz, false).unwrap();
        let before = sub.current_period_end;
        sub.pause_immediate(datetime!(2025-03-20 0:00 UTC), "pause_1".into()).unwrap();
        assert_eq!(sub.active_pause_id.as_deref(), Some("pause_1"));
        sub.resume(
            datetime!(2025-03-25 0:00 UTC),
            datetime!(2025-03-20 0:00 UTC),
        )
        .unwrap();
        assert_eq!(sub.current_period_end, before + time::Duration::days(5));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }
}
