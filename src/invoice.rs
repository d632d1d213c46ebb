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

//! Invoice generation tied to period boundaries, and the unpaid-invoice
//! auto-cancellation it drives (spec §1, §3, §4.E).

use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::alert::{self, AlertState};
use crate::error::Result;
use crate::model::{Invoice, InvoiceLineItem, InvoiceStatus, PaymentStatus};
use crate::ports::Store;
use crate::subscription::{InvoiceCadence, PriceType, Subscription, SubscriptionStatus};

fn invoice_idempotency_key(
    subscription_id: &str,
    cadence: InvoiceCadence,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> String {
    crate::ids::derive_key(&[
        "invoice",
        subscription_id,
        &format!("{cadence:?}"),
        &period_start.unix_timestamp().to_string(),
        &period_end.unix_timestamp().to_string(),
    ])
}

/// Emits and finalises the invoice for `sub`'s fixed-price line items
/// billed at `cadence` over `[period_start, period_end)` (spec §4.E
/// "create first-period invoice (advance) or arm arrear invoice", "emit
/// first billing invoice", "emit period-boundary invoice"). Idempotent on
/// `(subscription_id, cadence, period_start, period_end)`. Returns `Ok(None)`
/// when no line item bills for this period at this cadence.
pub async fn emit_period_invoice(
    store: &dyn Store,
    sub: &Subscription,
    cadence: InvoiceCadence,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<Option<Invoice>> {
    let key = invoice_idempotency_key(&sub.id, cadence, period_start, period_end);
    if let Some(existing) = store.get_invoice_by_idempotency_key(&key).await? {
        return Ok(Some(existing));
    }

    let items = store.list_line_items(&sub.id).await?;
    let mut line_items = Vec::new();
    let mut subtotal = Decimal::ZERO;
    for item in items {
        if item.price_type != PriceType::Fixed || item.invoice_cadence != cadence {
            continue;
        }
        if !item.intersects(period_start, period_end) {
            continue;
        }
        let price = store.get_price(&item.price_id).await?;
        let amount = price.effective_amount(item.quantity) * item.quantity;
        subtotal += amount;
        line_items.push(InvoiceLineItem {
            description: format!("{} x {}", price.id, item.quantity),
            amount,
            quantity: item.quantity,
        });
    }
    if line_items.is_empty() {
        return Ok(None);
    }

    let mut invoice = Invoice {
        id: crate::ids::new_id(),
        customer_id: sub.customer_id.clone(),
        subscription_id: Some(sub.id.clone()),
        currency: sub.currency.clone(),
        status: InvoiceStatus::Draft,
        payment_status: PaymentStatus::NotPaid,
        period_start: Some(period_start),
        period_end: Some(period_end),
        amount_due: subtotal,
        amount_paid: Decimal::ZERO,
        total: subtotal,
        subtotal,
        due_date: Some(now),
        idempotency_key: Some(key),
        line_items,
    };
    invoice.finalize()?;
    let invoice = store.create_invoice(invoice).await?;
    Ok(Some(invoice))
}

/// How long a subscription may sit `past_due` before `auto_cancel_on_unpaid`
/// cancels it (spec §4.G grace period). Mirrors `schedule::EXECUTING_GRACE_PERIOD`
/// as an engineering default the spec text does not pin down numerically.
pub const PAST_DUE_GRACE_PERIOD: time::Duration = time::Duration::days(3);

/// Evaluates `Customer.auto_cancel_on_unpaid` against `sub`'s unpaid
/// invoices, transitioning it to `past_due` and, once the grace period
/// elapses, cancelling it (spec §3 `auto_cancel_on_unpaid`, §4.G). Mutates
/// `sub` in place; the caller persists it. Returns whether `sub` changed.
pub async fn evaluate_auto_cancel(store: &dyn Store, sub: &mut Subscription, now: OffsetDateTime) -> Result<bool> {
    if !matches!(
        sub.status,
        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
    ) {
        return Ok(false);
    }
    let customer = store.get_customer(&sub.customer_id).await?;
    if !customer.auto_cancel_on_unpaid {
        return Ok(false);
    }

    let invoices = store.list_invoices(&sub.id).await?;
    let past_due_since = invoices
        .iter()
        .filter(|i| i.status == InvoiceStatus::Finalized && i.payment_status != PaymentStatus::Paid)
        .filter_map(|i| i.due_date)
        .min();
    let Some(past_due_since) = past_due_since else {
        return Ok(false);
    };

    if matches!(sub.status, SubscriptionStatus::Active | SubscriptionStatus::Trialing) {
        sub.status = SubscriptionStatus::PastDue;
        return Ok(true);
    }

    if alert::evaluate_past_due_grace(past_due_since, now, PAST_DUE_GRACE_PERIOD) == AlertState::InAlarm {
        sub.cancel_immediate(now)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic_per_period() {
        use time::macros::datetime;
        let a = invoice_idempotency_key("sub_1", InvoiceCadence::Advance, datetime!(2025-03-01 0:00 UTC), datetime!(2025-04-01 0:00 UTC));
        let b = invoice_idempotency_key("sub_1", InvoiceCadence::Advance, datetime!(2025-03-01 0:00 UTC), datetime!(2025-04-01 0:00 UTC));
        let c = invoice_idempotency_key("sub_1", InvoiceCadence::Arrear, datetime!(2025-03-01 0:00 UTC), datetime!(2025-04-01 0:00 UTC));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
