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

//! The proration calculator (spec §4.D): turns a mid-period quantity,
//! plan, or cancellation change into credit/charge line items, using
//! day-count proration factors from [`crate::time_grid`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::Price;
use crate::subscription::{InvoiceCadence, ProrationBehavior};
use crate::time_grid::proration_factor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    Credit,
    Charge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProrationLineItem {
    pub kind: LineItemKind,
    pub description: String,
    pub amount: Decimal,
    pub quantity: Decimal,
    pub proration_factor: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

/// The net effect of a change: a credit for what's un-consumed of the old
/// arrangement, a charge for what's newly consumed of the new one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProrationResult {
    pub line_items: Vec<ProrationLineItem>,
}

impl ProrationResult {
    pub fn net_amount(&self) -> Decimal {
        self.line_items.iter().fold(Decimal::ZERO, |acc, li| match li.kind {
            LineItemKind::Credit => acc - li.amount,
            LineItemKind::Charge => acc + li.amount,
        })
    }
}

/// A `[period_start, period_end)` window together with the `quantity` of
/// a given price in effect over it — the atomic unit proration reasons
/// about (spec §4.D "entitlement merging").
#[derive(Debug, Clone)]
pub struct Entitlement {
    pub price: Price,
    pub quantity: Decimal,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

/// Computes the credit owed for the unconsumed remainder of `entitlement`
/// once the change takes effect at `change_at` (spec §4.D step 1).
fn credit_for_remainder(entitlement: &Entitlement, change_at: OffsetDateTime) -> Option<ProrationLineItem> {
    if change_at >= entitlement.period_end {
        return None;
    }
    let change_at = change_at.max(entitlement.period_start);
    let factor = proration_factor(
        (entitlement.period_start, entitlement.period_end),
        (change_at, entitlement.period_end),
    );
    if factor.is_zero() {
        return None;
    }
    let full = entitlement.price.effective_amount(entitlement.quantity) * entitlement.quantity;
    Some(ProrationLineItem {
        kind: LineItemKind::Credit,
        description: format!("unused time on {}", entitlement.price.id),
        amount: full * factor,
        quantity: entitlement.quantity,
        proration_factor: factor,
        period_start: change_at,
        period_end: entitlement.period_end,
    })
}

/// Computes the charge owed for `entitlement`'s newly-consumed remainder
/// of the current period (spec §4.D step 2). Arrear-cadence prices defer
/// the charge to the next invoice instead, so they never produce a line
/// item here.
fn charge_for_remainder(entitlement: &Entitlement, change_at: OffsetDateTime) -> Option<ProrationLineItem> {
    if entitlement.price.invoice_cadence == InvoiceCadence::Arrear {
        return None;
    }
    if change_at >= entitlement.period_end {
        return None;
    }
    let change_at = change_at.max(entitlement.period_start);
    let factor = proration_factor(
        (entitlement.period_start, entitlement.period_end),
        (change_at, entitlement.period_end),
    );
    if factor.is_zero() {
        return None;
    }
    let full = entitlement.price.effective_amount(entitlement.quantity) * entitlement.quantity;
    Some(ProrationLineItem {
        kind: LineItemKind::Charge,
        description: format!("remaining time on {}", entitlement.price.id),
        amount: full * factor,
        quantity: entitlement.quantity,
        proration_factor: factor,
        period_start: change_at,
        period_end: entitlement.period_end,
    })
}

/// Prorates a change from `old` to `new` entitlements effective at
/// `change_at`, honoring `behavior` (spec §4.D).
///
/// `None` produces no line items (the change is free). `CreateProrations`
/// and `AlwaysInvoice` both produce the full credit/charge pair; they
/// differ only in whether the engine defers the resulting invoice to the
/// next period boundary or finalizes it immediately, which is an `engine`
/// concern, not a `proration` one.
pub fn prorate(
    old: &[Entitlement],
    new: &[Entitlement],
    change_at: OffsetDateTime,
    behavior: ProrationBehavior,
) -> ProrationResult {
    if behavior == ProrationBehavior::None {
        return ProrationResult::default();
    }
    let mut line_items = Vec::new();
    for entitlement in old {
        if let Some(li) = credit_for_remainder(entitlement, change_at) {
            line_items.push(li);
        }
    }
    for entitlement in new {
        if let Some(li) = charge_for_remainder(entitlement, change_at) {
            line_items.push(li);
        }
    }
    ProrationResult { line_items }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BillingModel, EntityType, PriceTier};
    use crate::subscription::{BillingCadence, InvoiceCadence, PriceType};
    use crate::time_grid::BillingPeriod;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn flat_price(id: &str, amount: Decimal) -> Price {
        Price {
            id: id.into(),
            entity_id: "plan_1".into(),
            entity_type: EntityType::Plan,
            price_type: PriceType::Fixed,
            billing_model: BillingModel::FlatFee,
            billing_cadence: BillingCadence::Recurring,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            invoice_cadence: InvoiceCadence::Advance,
            amount,
            currency: "USD".into(),
            tiers: None,
        }
    }

    #[test]
    fn none_behavior_produces_no_line_items() {
        let old = Entitlement {
            price: flat_price("p1", dec!(30)),
            quantity: Decimal::ONE,
            period_start: datetime!(2025-03-01 0:00 UTC),
            period_end: datetime!(2025-04-01 0:00 UTC),
        };
        let result = prorate(&[old], &[], datetime!(2025-03-16 0:00 UTC), ProrationBehavior::None);
        assert!(result.line_items.is_empty());
    }

    #[test]
    fn midpoint_plan_change_credits_half_old_and_charges_half_new() {
        let old = Entitlement {
            price: flat_price("old", dec!(30)),
            quantity: Decimal::ONE,
            period_start: datetime!(2025-03-01 0:00 UTC),
            period_end: datetime!(2025-03-31 0:00 UTC),
        };
        let new = Entitlement {
            price: flat_price("new", dec!(60)),
            quantity: Decimal::ONE,
            period_start: datetime!(2025-03-01 0:00 UTC),
            period_end: datetime!(2025-03-31 0:00 UTC),
        };
        let change_at = datetime!(2025-03-16 0:00 UTC);
        let result = prorate(&[old], &[new], change_at, ProrationBehavior::CreateProrations);
        assert_eq!(result.line_items.len(), 2);
        assert_eq!(result.line_items[0].kind, LineItemKind::Credit);
        assert_eq!(result.line_items[1].kind, LineItemKind::Charge);
        assert!(result.net_amount() > Decimal::ZERO);
    }

    #[test]
    fn arrear_cadence_addon_defers_charge_to_next_invoice() {
        let new = Entitlement {
            price: Price {
                invoice_cadence: InvoiceCadence::Arrear,
                ..flat_price("new", dec!(60))
            },
            quantity: Decimal::ONE,
            period_start: datetime!(2025-03-01 0:00 UTC),
            period_end: datetime!(2025-03-31 0:00 UTC),
        };
        let result = prorate(&[], &[new], datetime!(2025-03-16 0:00 UTC), ProrationBehavior::CreateProrations);
        assert!(result.line_items.is_empty());
    }

    #[test]
    fn tiered_price_expands_for_proration_base() {
        let price = Price {
            tiers: Some(vec![
                PriceTier { up_to: Some(dec!(10)), unit_amount: dec!(2) },
                PriceTier { up_to: None, unit_amount: dec!(1) },
            ]),
            billing_model: BillingModel::Tiered,
            ..flat_price("tiered", Decimal::ZERO)
        };
        let amount = price.effective_amount(dec!(20));
        assert!(amount > Decimal::ZERO && amount < dec!(2));
    }
}
