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

//! A stateless evaluator emitting point-in-time balance/threshold alerts
//! (spec §4.G). The repo's source carries two `Alert` shapes; per spec §9
//! Open Question (a), this crate implements only the immutable,
//! point-in-time shape.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::ids::Id;
use crate::ledger::Wallet;
use crate::ports::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Ok,
    InAlarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    Below,
    Above,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInfo {
    pub threshold: Decimal,
    pub value_at_time: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Id,
    pub entity_type: String,
    pub entity_id: Option<Id>,
    pub alert_metric: String,
    pub alert_state: AlertState,
    pub alert_info: AlertInfo,
}

/// The pure evaluation function: `(entity, metric, value, threshold,
/// condition) -> alert_state`. No I/O, no side effects.
pub fn evaluate(value: Decimal, threshold: Decimal, condition: AlertCondition) -> AlertState {
    let in_alarm = match condition {
        AlertCondition::Below => value < threshold,
        AlertCondition::Above => value > threshold,
    };
    if in_alarm {
        AlertState::InAlarm
    } else {
        AlertState::Ok
    }
}

/// A per-wallet low-balance threshold, configured alongside the wallet.
/// The engine does not require one; wallets without a threshold never
/// alert.
pub const DEFAULT_LOW_BALANCE_THRESHOLD: Decimal = Decimal::ZERO;

/// Called by the ledger after every completed operation. Only a state
/// *transition* from the most recently stored alert emits a new row;
/// failure here is logged and never propagated (spec §4.B "best-effort").
pub async fn evaluate_wallet_threshold(store: &dyn Store, wallet: &Wallet, threshold: Decimal, now: OffsetDateTime) {
    if let Err(err) = try_evaluate_wallet_threshold(store, wallet, threshold, now).await {
        warn!(wallet_id = %wallet.id, error = %err, "alert evaluation failed (best-effort, ignored)");
    }
}

async fn try_evaluate_wallet_threshold(
    store: &dyn Store,
    wallet: &Wallet,
    threshold: Decimal,
    now: OffsetDateTime,
) -> crate::error::Result<()> {
    const METRIC: &str = "wallet_credit_balance";
    let new_state = evaluate(wallet.credit_balance, threshold, AlertCondition::Below);

    let previous = store.last_alert(&wallet.id, METRIC).await?;
    let changed = previous
        .as_ref()
        .map(|a| a.alert_state != new_state)
        .unwrap_or(true);
    if !changed {
        return Ok(());
    }

    store
        .create_alert(Alert {
            id: crate::ids::new_id(),
            entity_type: "wallet".into(),
            entity_id: Some(wallet.id.clone()),
            alert_metric: METRIC.into(),
            alert_state: new_state,
            alert_info: AlertInfo {
                threshold,
                value_at_time: wallet.credit_balance,
                timestamp: now,
            },
        })
        .await?;
    Ok(())
}

/// Evaluated by the subscription state machine when a subscription's
/// `past_due` duration exceeds its grace period (spec §4.G).
pub fn evaluate_past_due_grace(
    past_due_since: OffsetDateTime,
    now: OffsetDateTime,
    grace_period: time::Duration,
) -> AlertState {
    evaluate(
        Decimal::from((now - past_due_since).whole_seconds()),
        Decimal::from(grace_period.whole_seconds()),
        AlertCondition::Above,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn below_threshold_is_in_alarm() {
        assert_eq!(
            evaluate(dec!(5), dec!(10), AlertCondition::Below),
            AlertState::InAlarm
        );
        assert_eq!(
            evaluate(dec!(15), dec!(10), AlertCondition::Below),
            AlertState::Ok
        );
    }
}
