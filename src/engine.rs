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

//! The change orchestrator: the public entry point composing the
//! proration calculator, credit grant engine, ledger, and schedule store
//! into one atomic unit of work per caller-facing operation (spec §4.H).

use std::sync::Arc;

use time::OffsetDateTime;
use time_tz::Tz;
use tracing::info;

use crate::config::{EngineBuilder, EngineConfig};
use crate::credit_grant::CreditGrantEngine;
use crate::error::{Error, Result};
use crate::ids::Id;
use crate::invoice;
use crate::ledger::Ledger;
use crate::ports::{Clock, Context, Store, SubscriptionFilter};
use crate::schedule::{self, ScheduleConfiguration, ScheduleExecutor, ScheduleType};
use crate::subscription::{
    CancellationSnapshot, InvoiceCadence, PauseMode, PauseStatus, ProrationBehavior, Subscription,
    SubscriptionPause, SubscriptionStatus,
};
use crate::time_grid::lookup_tz;

/// The engine's public API. Cheap to clone; clones share the same
/// collaborators.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ledger: Arc<Ledger>,
    credit_grants: Arc<CreditGrantEngine>,
    schedules: Arc<ScheduleExecutor>,
    default_tz: String,
}

/// The outcome of [`Engine::change_plan`] or [`Engine::cancel`]: either the
/// change took effect immediately, or it was recorded as a schedule to
/// execute later.
#[derive(Debug, Clone)]
pub enum ChangeOutcome {
    Applied(Subscription),
    Scheduled { subscription: Subscription, schedule_id: Id },
}

impl Engine {
    pub(crate) fn from_parts(config: EngineConfig, builder: EngineBuilder) -> Engine {
        let lock = config.lock;
        let store = config.store;
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            lock.clone(),
            builder.wallet_lock_timeout,
            builder.low_balance_threshold,
        ));
        let credit_grants = Arc::new(CreditGrantEngine::new(store.clone(), ledger.clone(), builder.schedule_batch_size));
        let schedules = Arc::new(ScheduleExecutor::new(store.clone(), credit_grants.clone(), builder.schedule_batch_size));
        Engine {
            store,
            clock: config.clock,
            ledger,
            credit_grants,
            schedules,
            default_tz: config.timezone,
        }
    }

    fn tz(&self) -> Result<&'static Tz> {
        lookup_tz(&self.default_tz)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn credit_grants(&self) -> &CreditGrantEngine {
        &self.credit_grants
    }

    pub fn schedules(&self) -> &ScheduleExecutor {
        &self.schedules
    }

    /// Creates a subscription in `draft` and materializes its plan-scoped
    /// credit grants (spec §4.H `CreateSubscription`).
    pub async fn create_subscription(&self, ctx: &Context, mut sub: Subscription) -> Result<Subscription> {
        ctx.check_deadline(self.clock.now())?;
        sub.status = SubscriptionStatus::Draft;
        let sub = self.store.create_subscription(sub).await?;
        info!(subscription_id = %sub.id, "subscription created");
        Ok(sub)
    }

    /// draft -> active/trialing, then materializes every plan-scoped
    /// credit grant against the new period (spec §4.H `ActivateDraft`).
    pub async fn activate_draft(&self, ctx: &Context, subscription_id: &str, start_trial: bool) -> Result<Subscription> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;
        let tz = self.tz()?;

        let tx = self.store.with_tx().await?;
        let mut sub = tx.get_subscription(subscription_id).await?;
        sub.activate(now, tz, start_trial)?;
        let sub = tx.update_subscription(sub).await?;
        tx.commit().await?;

        let grants = self.store.list_credit_grants(&sub.plan_id).await?;
        for grant in grants {
            self.credit_grants.materialise(&grant, &sub, tz, now).await?;
        }

        // Arrear-cadence line items are invoiced when their period actually
        // ends (the period-tick path below), so only the advance cadence is
        // billed here (spec §4.E `Activate`: "create first-period invoice
        // (advance) or arm arrear invoice").
        invoice::emit_period_invoice(
            self.store.as_ref(),
            &sub,
            InvoiceCadence::Advance,
            sub.current_period_start,
            sub.current_period_end,
            now,
        )
        .await?;

        info!(subscription_id = %sub.id, "subscription activated");
        Ok(sub)
    }

    /// trialing -> active, emitting the first billing invoice if the trial
    /// ended mid-period (spec §4.E `trial_end_reached`).
    pub async fn end_trial(&self, ctx: &Context, subscription_id: &str) -> Result<Subscription> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;
        let tz = self.tz()?;

        let tx = self.store.with_tx().await?;
        let mut sub = tx.get_subscription(subscription_id).await?;
        sub.end_trial(now, tz)?;
        let sub = tx.update_subscription(sub).await?;
        tx.commit().await?;

        invoice::emit_period_invoice(
            self.store.as_ref(),
            &sub,
            InvoiceCadence::Advance,
            sub.current_period_start,
            sub.current_period_end,
            now,
        )
        .await?;

        info!(subscription_id = %sub.id, "trial ended");
        Ok(sub)
    }

    /// Advances a subscription's period if due, emitting the arrear invoice
    /// for the period that just ended and the advance invoice for the one
    /// that just began, then evaluates `auto_cancel_on_unpaid` (spec §4.E
    /// `period_tick`, §3 `Customer.auto_cancel_on_unpaid`).
    async fn advance_period(&self, subscription_id: &str, now: OffsetDateTime, tz: &'static Tz) -> Result<Subscription> {
        let mut sub = self.store.get_subscription(subscription_id).await?;
        let old_start = sub.current_period_start;
        let old_end = sub.current_period_end;

        let advanced = sub.period_tick(now, tz)?;
        if advanced {
            invoice::emit_period_invoice(self.store.as_ref(), &sub, InvoiceCadence::Arrear, old_start, old_end, now).await?;
            invoice::emit_period_invoice(
                self.store.as_ref(),
                &sub,
                InvoiceCadence::Advance,
                sub.current_period_start,
                sub.current_period_end,
                now,
            )
            .await?;
        }

        invoice::evaluate_auto_cancel(self.store.as_ref(), &mut sub, now).await?;
        self.store.update_subscription(sub).await
    }

    /// Prices and applies a mid-period plan change, either immediately or
    /// (when `proration_behavior` is `always_invoice` and the caller
    /// requests deferral) at the next period boundary via a schedule
    /// (spec §4.D, §4.H `ChangePlan`).
    pub async fn change_plan(
        &self,
        ctx: &Context,
        subscription_id: &str,
        new_plan_id: &str,
        defer_to_period_end: bool,
    ) -> Result<ChangeOutcome> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;

        if defer_to_period_end {
            let sub = self.store.get_subscription(subscription_id).await?;
            let scheduled = schedule::create_schedule(
                self.store.as_ref(),
                subscription_id,
                ScheduleType::PlanChange,
                sub.current_period_end,
                ScheduleConfiguration::PlanChange {
                    new_plan_id: new_plan_id.to_string(),
                    proration_behavior: sub.proration_behavior,
                },
            )
            .await?;
            return Ok(ChangeOutcome::Scheduled { subscription: sub, schedule_id: scheduled.id });
        }

        let tx = self.store.with_tx().await?;
        let mut sub = tx.get_subscription(subscription_id).await?;
        if !matches!(sub.status, SubscriptionStatus::Active | SubscriptionStatus::Trialing) {
            return Err(Error::InvalidTransition {
                entity: "subscription",
                from: format!("{:?}", sub.status),
                event: "change_plan",
            });
        }
        let proration = self.price_plan_change(&sub, new_plan_id, now).await?;
        sub.plan_id = new_plan_id.to_string();
        let sub = tx.update_subscription(sub).await?;
        tx.commit().await?;

        let tz = self.tz()?;
        let grants = self.store.list_credit_grants(&sub.plan_id).await?;
        for grant in grants {
            self.credit_grants.materialise(&grant, &sub, tz, now).await?;
        }

        info!(
            subscription_id = %sub.id,
            net_amount = %proration.net_amount(),
            "plan change applied"
        );
        Ok(ChangeOutcome::Applied(sub))
    }

    async fn price_plan_change(
        &self,
        sub: &Subscription,
        new_plan_id: &str,
        now: OffsetDateTime,
    ) -> Result<crate::proration::ProrationResult> {
        let old_plan = self.store.get_plan(&sub.plan_id).await?;
        let new_plan = self.store.get_plan(new_plan_id).await?;
        let mut old_entitlements = Vec::new();
        for price_id in &old_plan.price_ids {
            let price = self.store.get_price(price_id).await?;
            old_entitlements.push(crate::proration::Entitlement {
                price,
                quantity: rust_decimal::Decimal::ONE,
                period_start: sub.current_period_start,
                period_end: sub.current_period_end,
            });
        }
        let mut new_entitlements = Vec::new();
        for price_id in &new_plan.price_ids {
            let price = self.store.get_price(price_id).await?;
            new_entitlements.push(crate::proration::Entitlement {
                price,
                quantity: rust_decimal::Decimal::ONE,
                period_start: sub.current_period_start,
                period_end: sub.current_period_end,
            });
        }
        Ok(crate::proration::prorate(&old_entitlements, &new_entitlements, now, sub.proration_behavior))
    }

    /// Adds a line item to a subscription, pricing the mid-period portion
    /// per `proration_behavior` (spec §4.D, §4.H `AddAddon`).
    pub async fn add_line_item(
        &self,
        ctx: &Context,
        subscription_id: &str,
        item: crate::subscription::SubscriptionLineItem,
    ) -> Result<crate::proration::ProrationResult> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;

        let tx = self.store.with_tx().await?;
        let sub = tx.get_subscription(subscription_id).await?;
        let price = tx.get_price(&item.price_id).await?;
        let created = tx.create_line_item(item).await?;
        tx.commit().await?;

        let new_entitlement = crate::proration::Entitlement {
            price,
            quantity: created.quantity,
            period_start: sub.current_period_start,
            period_end: sub.current_period_end,
        };
        Ok(crate::proration::prorate(&[], &[new_entitlement], now, sub.proration_behavior))
    }

    /// Removes a line item, crediting its unconsumed remainder (spec §4.D,
    /// §4.H `RemoveAddon`).
    pub async fn remove_line_item(&self, ctx: &Context, subscription_id: &str, line_item_id: &str) -> Result<crate::proration::ProrationResult> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;

        let tx = self.store.with_tx().await?;
        let sub = tx.get_subscription(subscription_id).await?;
        let items = tx.list_line_items(subscription_id).await?;
        let item = items
            .into_iter()
            .find(|i| i.id == line_item_id)
            .ok_or_else(|| Error::not_found("subscription_line_item", line_item_id))?;
        let price = tx.get_price(&item.price_id).await?;
        tx.delete_line_item(line_item_id).await?;
        tx.commit().await?;

        let old_entitlement = crate::proration::Entitlement {
            price,
            quantity: item.quantity,
            period_start: sub.current_period_start,
            period_end: sub.current_period_end,
        };
        Ok(crate::proration::prorate(&[old_entitlement], &[], now, sub.proration_behavior))
    }

    /// Cancels a subscription, either immediately or at the next period
    /// boundary via a reversible schedule (spec §4.E, §4.F, §4.H `Cancel`).
    /// The immediate path always prices the unused-time credit in
    /// `always_invoice` mode, per the §4.E transition table ("cancel(now)
    /// ... run proration in `always_invoice` mode"); the deferred path
    /// captures the subscription's own `proration_behavior` for the
    /// executor to respect when the schedule fires (spec §4.F).
    pub async fn cancel(&self, ctx: &Context, subscription_id: &str, at_period_end: bool) -> Result<ChangeOutcome> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;

        if at_period_end {
            let tx = self.store.with_tx().await?;
            let mut sub = tx.get_subscription(subscription_id).await?;
            let snapshot = CancellationSnapshot::capture(&sub);
            let proration_behavior = sub.proration_behavior;
            sub.arm_cancel_at_period_end()?;
            let sub = tx.update_subscription(sub).await?;
            tx.commit().await?;

            let scheduled = schedule::create_schedule(
                self.store.as_ref(),
                subscription_id,
                ScheduleType::Cancellation,
                sub.current_period_end,
                ScheduleConfiguration::Cancellation { snapshot, proration_behavior },
            )
            .await?;
            info!(subscription_id = %sub.id, schedule_id = %scheduled.id, "cancellation scheduled at period end");
            return Ok(ChangeOutcome::Scheduled { subscription: sub, schedule_id: scheduled.id });
        }

        let (sub, proration) =
            cancel_with_proration(self.store.as_ref(), subscription_id, ProrationBehavior::AlwaysInvoice, now).await?;
        info!(
            subscription_id = %sub.id,
            net_amount = %proration.net_amount(),
            "subscription cancelled immediately"
        );
        Ok(ChangeOutcome::Applied(sub))
    }

    /// Reverses a pending cancellation or plan-change schedule (spec §4.F
    /// reversibility, invariant 7).
    pub async fn undo_scheduled_change(&self, ctx: &Context, schedule_id: &str) -> Result<()> {
        ctx.check_deadline(self.clock.now())?;
        schedule::cancel_schedule(self.store.as_ref(), schedule_id).await?;
        Ok(())
    }

    /// active -> paused, recording a `SubscriptionPause` row so the pause
    /// survives the call and at most one can be active at a time (spec §4.H
    /// `PauseImmediate`).
    pub async fn pause_immediate(&self, ctx: &Context, subscription_id: &str) -> Result<Subscription> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;
        let sub = pause_subscription_immediate(self.store.as_ref(), subscription_id, PauseMode::Immediate, now).await?;
        info!(subscription_id = %sub.id, "subscription paused");
        Ok(sub)
    }

    /// active -> active, with a pause armed for the period boundary (spec
    /// §4.E "active | pause(at_period_end) | active→paused at boundary |
    /// Schedule pause.").
    pub async fn pause_at_period_end(&self, ctx: &Context, subscription_id: &str) -> Result<ChangeOutcome> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;

        let sub = self.store.get_subscription(subscription_id).await?;
        if sub.status != SubscriptionStatus::Active {
            return Err(Error::InvalidTransition {
                entity: "subscription",
                from: format!("{:?}", sub.status),
                event: "pause(at_period_end)",
            });
        }

        let scheduled = schedule::create_schedule(
            self.store.as_ref(),
            subscription_id,
            ScheduleType::Pause,
            sub.current_period_end,
            ScheduleConfiguration::Pause,
        )
        .await?;
        info!(subscription_id = %sub.id, schedule_id = %scheduled.id, "pause scheduled at period end");
        Ok(ChangeOutcome::Scheduled { subscription: sub, schedule_id: scheduled.id })
    }

    /// paused -> active, ending the active `SubscriptionPause` row and
    /// shifting the period grid forward by the elapsed pause duration
    /// (spec §4.H `Resume`).
    pub async fn resume(&self, ctx: &Context, subscription_id: &str) -> Result<Subscription> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;

        let mut pause = self
            .store
            .get_active_pause(subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("subscription_pause", subscription_id))?;

        let tx = self.store.with_tx().await?;
        let mut sub = tx.get_subscription(subscription_id).await?;
        sub.resume(now, pause.started_at)?;
        let sub = tx.update_subscription(sub).await?;
        pause.status = PauseStatus::Ended;
        pause.resumes_at = Some(now);
        tx.update_pause(pause).await?;
        tx.commit().await?;

        info!(subscription_id = %sub.id, "subscription resumed");
        Ok(sub)
    }

    /// Debits a subscription's wallet for usage, advancing its period if
    /// due first so FIFO expiry is evaluated against the current instant
    /// (spec §4.B, §4.H).
    pub async fn charge_usage(
        &self,
        ctx: &Context,
        subscription_id: &str,
        credits: rust_decimal::Decimal,
        opts: crate::ledger::DebitOptions,
    ) -> Result<crate::ledger::WalletTransaction> {
        let now = self.clock.now();
        ctx.check_deadline(now)?;
        let tz = self.tz()?;

        let sub = self.advance_period(subscription_id, now, tz).await?;

        let wallet = self
            .store
            .find_active_wallet(&sub.customer_id, &sub.currency, "prepaid")
            .await?
            .ok_or_else(|| Error::not_found("wallet", &sub.customer_id))?;
        self.ledger.debit(&wallet.id, credits, opts, now).await
    }

    /// Runs every background poll this engine owns: due credit grant
    /// applications and due schedules (spec §4.F, §4.C "Background
    /// tasks"). Intended to be called on a fixed interval by the host
    /// application; this crate does not spawn its own timer.
    pub async fn run_background_tasks(&self) -> Result<()> {
        let now = self.clock.now();
        let tz = self.tz()?;
        let processed = self.credit_grants.process_due(now, tz).await?;
        let executed = self.schedules.run_due(now, tz).await?;
        let ticked = self.tick_due_subscriptions(now, tz).await?;
        info!(processed, executed, ticked, "background tasks polled");
        Ok(())
    }

    /// Advances every active/trialing/past-due subscription whose current
    /// period has ended, emitting period-boundary invoices and evaluating
    /// `auto_cancel_on_unpaid` for each (spec §4.E `period_tick`).
    async fn tick_due_subscriptions(&self, now: OffsetDateTime, tz: &'static Tz) -> Result<usize> {
        let mut ticked = 0;
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
        ] {
            let filter = SubscriptionFilter {
                status: Some(status),
                period_end_before: Some(now),
                ..Default::default()
            };
            let due = self.store.list_subscriptions(&filter).await?;
            for sub in due {
                self.advance_period(&sub.id, now, tz).await?;
                ticked += 1;
            }
        }
        Ok(ticked)
    }
}

/// Prices the unused-time credit for every line item still active in the
/// subscription's current period and transitions it to `cancelled` in one
/// unit of work (spec §4.D, §4.E "cancel(now)", §4.F "call
/// H.Cancel(immediate=true) respecting the configured proration
/// behaviour"). Shared by `Engine::cancel`'s immediate path and
/// `ScheduleExecutor`'s dispatch of a due `cancellation` schedule, so both
/// callers price and transition the subscription the same way.
pub(crate) async fn cancel_with_proration(
    store: &dyn Store,
    subscription_id: &str,
    proration_behavior: ProrationBehavior,
    now: OffsetDateTime,
) -> Result<(Subscription, crate::proration::ProrationResult)> {
    let sub = store.get_subscription(subscription_id).await?;
    let mut old_entitlements = Vec::new();
    for item in store.list_line_items(subscription_id).await? {
        if !item.intersects(sub.current_period_start, sub.current_period_end) {
            continue;
        }
        let price = store.get_price(&item.price_id).await?;
        old_entitlements.push(crate::proration::Entitlement {
            price,
            quantity: item.quantity,
            period_start: sub.current_period_start,
            period_end: sub.current_period_end,
        });
    }
    let proration = crate::proration::prorate(&old_entitlements, &[], now, proration_behavior);

    let tx = store.with_tx().await?;
    let mut sub = tx.get_subscription(subscription_id).await?;
    sub.cancel_immediate(now)?;
    let sub = tx.update_subscription(sub).await?;
    tx.commit().await?;

    Ok((sub, proration))
}

/// active -> paused, recording a `SubscriptionPause` row so the pause
/// survives the call and at most one can be active at a time (spec §4.H
/// `PauseImmediate`, §4.F pause-at-period-end schedule dispatch). Shared by
/// `Engine::pause_immediate` and `ScheduleExecutor`'s dispatch of a due
/// `pause` schedule.
pub(crate) async fn pause_subscription_immediate(
    store: &dyn Store,
    subscription_id: &str,
    mode: PauseMode,
    now: OffsetDateTime,
) -> Result<Subscription> {
    if store.get_active_pause(subscription_id).await?.is_some() {
        return Err(Error::InvalidTransition {
            entity: "subscription",
            from: "paused".to_string(),
            event: "pause",
        });
    }

    let pause_id = crate::ids::new_id();
    let tx = store.with_tx().await?;
    let mut sub = tx.get_subscription(subscription_id).await?;
    sub.pause_immediate(now, pause_id.clone())?;
    let sub = tx.update_subscription(sub).await?;
    tx.create_pause(SubscriptionPause {
        id: pause_id,
        subscription_id: subscription_id.to_string(),
        mode,
        started_at: now,
        resumes_at: None,
        status: PauseStatus::Active,
    })
    .await?;
    tx.commit().await?;
    Ok(sub)
}
