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

//! Deferred subscription changes: a schedule records what should happen
//! at a future instant and is executed by [`ScheduleExecutor`] when due
//! (spec §4.F).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::credit_grant::CreditGrantEngine;
use crate::error::{Error, Result};
use crate::ids::Id;
use crate::ports::{ScheduleFilter, Store};
use crate::subscription::CancellationSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    PlanChange,
    Cancellation,
    Pause,
}

impl ScheduleType {
    fn as_str(self) -> &'static str {
        match self {
            ScheduleType::PlanChange => "plan_change",
            ScheduleType::Cancellation => "cancellation",
            ScheduleType::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Executing,
    Executed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfiguration {
    PlanChange {
        new_plan_id: Id,
        proration_behavior: crate::subscription::ProrationBehavior,
    },
    Cancellation {
        snapshot: CancellationSnapshot,
        proration_behavior: crate::subscription::ProrationBehavior,
    },
    Pause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSchedule {
    pub id: Id,
    pub subscription_id: Id,
    pub schedule_type: ScheduleType,
    pub status: ScheduleStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    pub configuration: ScheduleConfiguration,
    #[serde(with = "time::serde::rfc3339::option")]
    pub executing_since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub executed_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
}

/// Creates a schedule, enforcing at most one `pending` schedule per
/// `(subscription_id, schedule_type)` (spec §4.F invariant).
pub async fn create_schedule(
    store: &dyn Store,
    subscription_id: &str,
    schedule_type: ScheduleType,
    scheduled_for: OffsetDateTime,
    configuration: ScheduleConfiguration,
) -> Result<SubscriptionSchedule> {
    let existing = store
        .list_schedules(&ScheduleFilter {
            subscription_id: Some(subscription_id.to_string()),
            status: Some(ScheduleStatus::Pending),
            ..Default::default()
        })
        .await?;
    if existing.iter().any(|s| s.schedule_type == schedule_type) {
        return Err(Error::ScheduleConflict {
            subscription_id: subscription_id.to_string(),
            schedule_type: schedule_type.as_str(),
        });
    }

    store
        .create_schedule(SubscriptionSchedule {
            id: crate::ids::new_id(),
            subscription_id: subscription_id.to_string(),
            schedule_type,
            status: ScheduleStatus::Pending,
            scheduled_for,
            configuration,
            executing_since: None,
            executed_at: None,
            failure_reason: None,
        })
        .await
}

/// Reverses a pending schedule, restoring whatever pre-change state its
/// configuration captured (spec §4.F reversibility, invariant 7). Only a
/// `pending` schedule can be cancelled; an `executing` or `executed` one
/// cannot be undone this way.
pub async fn cancel_schedule(store: &dyn Store, schedule_id: &str) -> Result<SubscriptionSchedule> {
    let mut schedule = store.get_schedule(schedule_id).await?;
    if schedule.status != ScheduleStatus::Pending {
        return Err(Error::InvalidTransition {
            entity: "schedule",
            from: format!("{:?}", schedule.status),
            event: "cancel",
        });
    }

    if let ScheduleConfiguration::Cancellation { snapshot, .. } = &schedule.configuration {
        let mut sub = store.get_subscription(&schedule.subscription_id).await?;
        sub.restore_cancellation_snapshot(snapshot);
        store.update_subscription(sub).await?;
    }

    schedule.status = ScheduleStatus::Cancelled;
    store.update_schedule(schedule).await
}

/// How long an `executing` schedule may remain unfinished before it's
/// considered stuck and eligible for recovery (spec §4.F "Background
/// tasks"). A crash between the compare-and-swap and the commit leaves a
/// schedule in this state forever otherwise.
pub const EXECUTING_GRACE_PERIOD: time::Duration = time::Duration::minutes(5);

/// Polls and executes due schedules, compare-and-swapping `pending` to
/// `executing` before doing any work so concurrent executors never race
/// on the same schedule (spec §4.F, §5).
pub struct ScheduleExecutor {
    store: Arc<dyn Store>,
    credit_grants: Arc<CreditGrantEngine>,
    batch_size: usize,
}

impl ScheduleExecutor {
    pub fn new(store: Arc<dyn Store>, credit_grants: Arc<CreditGrantEngine>, batch_size: usize) -> ScheduleExecutor {
        ScheduleExecutor { store, credit_grants, batch_size }
    }

    /// Recovers schedules stuck `executing` past the grace period back to
    /// `pending` so they are retried.
    pub async fn recover_stuck(&self, now: OffsetDateTime) -> Result<usize> {
        let executing = self
            .store
            .list_schedules(&ScheduleFilter {
                status: Some(ScheduleStatus::Executing),
                ..Default::default()
            })
            .await?;
        let mut recovered = 0;
        for mut schedule in executing {
            let stuck = schedule
                .executing_since
                .map(|since| now - since > EXECUTING_GRACE_PERIOD)
                .unwrap_or(false);
            if stuck {
                warn!(schedule_id = %schedule.id, "recovering stuck executing schedule");
                schedule.status = ScheduleStatus::Pending;
                schedule.executing_since = None;
                self.store.update_schedule(schedule).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Executes every `pending` schedule due at or before `now`, up to the
    /// configured batch size (spec §5 "bounded batches").
    pub async fn run_due(&self, now: OffsetDateTime, tz: &'static time_tz::Tz) -> Result<usize> {
        self.recover_stuck(now).await?;
        let due = self
            .store
            .list_schedules(&ScheduleFilter {
                status: Some(ScheduleStatus::Pending),
                due_before: Some(now),
                ..Default::default()
            })
            .await?;
        let mut executed = 0;
        for schedule in due.into_iter().take(self.batch_size) {
            if schedule.scheduled_for > now {
                continue;
            }
            if let Err(err) = self.execute_one(schedule, now, tz).await {
                warn!(error = %err, "schedule execution failed");
            } else {
                executed += 1;
            }
        }
        Ok(executed)
    }

    async fn execute_one(&self, mut schedule: SubscriptionSchedule, now: OffsetDateTime, tz: &'static time_tz::Tz) -> Result<()> {
        schedule.status = ScheduleStatus::Executing;
        schedule.executing_since = Some(now);
        let schedule = self.store.update_schedule(schedule).await?;

        let outcome = self.apply(&schedule, now, tz).await;
        let mut schedule = schedule;
        match outcome {
            Ok(()) => {
                schedule.status = ScheduleStatus::Executed;
                schedule.executed_at = Some(now);
                schedule.executing_since = None;
                info!(schedule_id = %schedule.id, "schedule executed");
            }
            Err(err) => {
                schedule.status = ScheduleStatus::Failed;
                schedule.failure_reason = Some(err.to_string());
                schedule.executing_since = None;
                self.store.update_schedule(schedule).await?;
                return Err(err);
            }
        }
        self.store.update_schedule(schedule).await?;
        Ok(())
    }

    /// Dispatches a due schedule (spec §4.F "Execution"). `plan_change`
    /// binds a new subscription and re-materialises its plan-scoped credit
    /// grants, mirroring what `Engine::change_plan`'s immediate path does
    /// for the same side effect. `cancellation` calls the same
    /// immediate-cancel-with-proration path as `Engine::cancel(immediate)`,
    /// respecting the proration behavior captured when the schedule was
    /// created (spec §4.F "call H.Cancel(immediate=true) respecting the
    /// configured proration behaviour"). `pause` runs the same
    /// immediate-pause path as `Engine::pause_immediate`.
    async fn apply(&self, schedule: &SubscriptionSchedule, now: OffsetDateTime, tz: &'static time_tz::Tz) -> Result<()> {
        match &schedule.configuration {
            ScheduleConfiguration::Cancellation { proration_behavior, .. } => {
                let (sub, proration) = crate::engine::cancel_with_proration(
                    self.store.as_ref(),
                    &schedule.subscription_id,
                    *proration_behavior,
                    now,
                )
                .await?;
                info!(
                    subscription_id = %sub.id,
                    net_amount = %proration.net_amount(),
                    "scheduled cancellation executed"
                );
            }
            ScheduleConfiguration::Pause => {
                let sub = crate::engine::pause_subscription_immediate(
                    self.store.as_ref(),
                    &schedule.subscription_id,
                    crate::subscription::PauseMode::AtPeriodEnd,
                    now,
                )
                .await?;
                info!(subscription_id = %sub.id, "scheduled pause executed");
            }
            ScheduleConfiguration::PlanChange { new_plan_id, .. } => {
                // billing_cadence/period/period_count/billing_cycle/currency are
                // immutable for a subscription's life, so a plan change that
                // takes effect at the period boundary binds a new subscription
                // id and ends the old one rather than mutating it in place.
                let mut sub = self.store.get_subscription(&schedule.subscription_id).await?;
                let mut new_sub = sub.clone();
                new_sub.id = crate::ids::new_id();
                new_sub.plan_id = new_plan_id.clone();
                let new_sub = self.store.create_subscription(new_sub).await?;
                sub.end(now);
                self.store.update_subscription(sub).await?;

                let grants = self.store.list_credit_grants(&new_sub.plan_id).await?;
                for grant in grants {
                    self.credit_grants.materialise(&grant, &new_sub, tz, now).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executing_grace_period_is_five_minutes() {
        assert_eq!(EXECUTING_GRACE_PERIOD, time::Duration::minutes(5));
    }
}
