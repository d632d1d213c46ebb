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

//! The error taxonomy shared by every component of the engine.
//!
//! Every fallible operation in this crate returns [`Error`]. The variants
//! are the abstract kinds a caller needs to branch on; each carries enough
//! context to explain itself without a backtrace.

use thiserror::Error;

/// An error returned by the engine.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// A request failed validation before any state was touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// The kind of entity that was looked up (e.g. `"subscription"`).
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// Creation would violate a uniqueness constraint.
    #[error("{kind} already exists: {detail}")]
    AlreadyExists {
        /// The kind of entity.
        kind: &'static str,
        /// A human-readable description of the conflict.
        detail: String,
    },

    /// The requested state transition is not legal from the entity's current state.
    #[error("invalid transition: cannot {event} a {entity} in state {from}")]
    InvalidTransition {
        /// The entity kind (e.g. `"subscription"`).
        entity: &'static str,
        /// The state it was in.
        from: String,
        /// The event that was attempted.
        event: &'static str,
    },

    /// A second pending schedule was attempted for a `(subscription_id, schedule_type)` pair.
    #[error("a pending {schedule_type} schedule already exists for subscription {subscription_id}")]
    ScheduleConflict {
        /// The subscription the schedule targets.
        subscription_id: String,
        /// The schedule type that conflicted.
        schedule_type: &'static str,
    },

    /// A ledger operation would leave the wallet in an inconsistent state.
    #[error("ledger invariant violated on wallet {wallet_id}: {detail}")]
    LedgerInvariant {
        /// The wallet that failed its invariant check.
        wallet_id: String,
        /// What was expected vs. observed.
        detail: String,
    },

    /// A debit could not be satisfied by the wallet's eligible credit.
    #[error("insufficient balance on wallet {wallet_id}: needed {needed}, available {available}")]
    InsufficientBalance {
        /// The wallet that was debited.
        wallet_id: String,
        /// The credits requested.
        needed: rust_decimal::Decimal,
        /// The credits actually eligible.
        available: rust_decimal::Decimal,
    },

    /// An operation was retried with a key that already succeeded; the stored
    /// result is returned to the caller and no new rows were written.
    #[error("idempotent replay of key {key}")]
    IdempotencyReplay {
        /// The idempotency key that was replayed.
        key: String,
    },

    /// The operation's caller-supplied deadline elapsed before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A collaborating port (store, lock, payment gateway, …) was unavailable.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// An unexpected internal error; the unit of work was rolled back.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Error {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for [`Error::Validation`].
    pub fn validation(detail: impl Into<String>) -> Error {
        Error::Validation(detail.into())
    }

    /// True for errors that are recovered locally and carry a caller hint,
    /// as opposed to ledger-invariant/internal errors that abort the unit of
    /// work and surface without retry (see spec §7).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::InvalidTransition { .. }
                | Error::ScheduleConflict { .. }
                | Error::InsufficientBalance { .. }
                | Error::IdempotencyReplay { .. }
        )
    }
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
