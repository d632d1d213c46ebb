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

//! The external collaborators this crate only consumes: customers, plans,
//! prices, and invoices (spec §1, §3). Their full CRUD surface, REST
//! representation, and persistence schema live outside this crate; only
//! the shape the core reads or writes is modeled here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::Id;
use crate::subscription::{BillingCadence, InvoiceCadence, PriceType};
use crate::time_grid::BillingPeriod;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Id,
    pub external_id: Option<String>,
    pub currency_default: String,
    pub timezone: String,
    pub auto_cancel_on_unpaid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Plan,
    Addon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    FlatFee,
    Tiered,
    Package,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<Decimal>,
    pub unit_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: Id,
    pub entity_id: Id,
    pub entity_type: EntityType,
    pub price_type: PriceType,
    pub billing_model: BillingModel,
    pub billing_cadence: BillingCadence,
    pub billing_period: BillingPeriod,
    pub billing_period_count: u32,
    pub invoice_cadence: InvoiceCadence,
    pub amount: Decimal,
    pub currency: String,
    pub tiers: Option<Vec<PriceTier>>,
}

impl Price {
    /// The effective per-unit amount for `quantity`, expanding tiers when
    /// the billing model is `tiered` (spec §4.D).
    pub fn effective_amount(&self, quantity: Decimal) -> Decimal {
        match (&self.billing_model, &self.tiers) {
            (BillingModel::Tiered, Some(tiers)) => {
                let mut remaining = quantity;
                let mut total = Decimal::ZERO;
                let mut consumed = Decimal::ZERO;
                for tier in tiers {
                    if remaining <= Decimal::ZERO {
                        break;
                    }
                    let tier_cap = tier.up_to.map(|u| u - consumed).unwrap_or(remaining);
                    let tier_qty = remaining.min(tier_cap.max(Decimal::ZERO));
                    total += tier_qty * tier.unit_amount;
                    remaining -= tier_qty;
                    consumed += tier_qty;
                }
                if quantity.is_zero() {
                    Decimal::ZERO
                } else {
                    total / quantity
                }
            }
            _ => self.amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Id,
    pub price_ids: Vec<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NotPaid,
    Pending,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub description: String,
    pub amount: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Id,
    pub customer_id: Id,
    pub subscription_id: Option<Id>,
    pub currency: String,
    pub status: InvoiceStatus,
    pub payment_status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub total: Decimal,
    pub subtotal: Decimal,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub idempotency_key: Option<String>,
    pub line_items: Vec<InvoiceLineItem>,
}

impl Invoice {
    /// Finalising an invoice is a pure state transition from `draft`
    /// (spec §3).
    pub fn finalize(&mut self) -> crate::error::Result<()> {
        if self.status != InvoiceStatus::Draft {
            return Err(crate::error::Error::InvalidTransition {
                entity: "invoice",
                from: format!("{:?}", self.status),
                event: "finalize",
            });
        }
        self.status = InvoiceStatus::Finalized;
        Ok(())
    }
}
