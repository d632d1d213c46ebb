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

//! Fixed-precision decimal arithmetic.
//!
//! Every monetary and credit quantity in this crate is a [`Decimal`].
//! Arithmetic is exact; floating point never enters the core. Rounding is
//! applied only at presentation boundaries, via [`round_for_display`].

pub use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

use crate::error::{Error, Result};

/// Validates that `d` is usable as a money or credit quantity.
///
/// `Decimal` cannot represent NaN, but it can represent negative values;
/// callers that forbid negatives (e.g. a grant's `credits` field) should
/// pass `allow_negative = false`.
pub fn validate(d: Decimal, allow_negative: bool) -> Result<Decimal> {
    if !allow_negative && d.is_sign_negative() && !d.is_zero() {
        return Err(Error::validation(format!(
            "expected a non-negative amount, got {d}"
        )));
    }
    Ok(d)
}

/// Rounds `d` to `places` decimal places using banker's rounding
/// (round-half-to-even), the convention used when a value crosses from the
/// exact internal ledger into a presented `balance`.
pub fn round_for_display(d: Decimal, places: u32) -> Decimal {
    d.round_dp_with_strategy(places, RoundingStrategy::MidpointNearestEven)
}

/// Converts a credit quantity to its currency equivalent at `conversion_rate`,
/// rounding only at this boundary (spec §9).
pub fn credits_to_currency(credits: Decimal, conversion_rate: Decimal, places: u32) -> Decimal {
    round_for_display(credits * conversion_rate, places)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_negative_unless_allowed() {
        assert!(validate(dec!(-1), false).is_err());
        assert!(validate(dec!(-1), true).is_ok());
        assert!(validate(dec!(0), false).is_ok());
    }

    #[test]
    fn banker_rounding_rounds_half_to_even() {
        assert_eq!(round_for_display(dec!(2.005), 2), dec!(2.00));
        assert_eq!(round_for_display(dec!(2.015), 2), dec!(2.02));
    }

    #[test]
    fn currency_conversion_is_exact_until_rounded() {
        let out = credits_to_currency(dec!(100), dec!(0.013333), 2);
        assert_eq!(out, dec!(1.33));
    }
}
