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

//! Opaque entity identifiers.
//!
//! Spec §3 allows ULIDs but does not require them; we generate v4 UUIDs
//! rendered as plain strings, since `uuid` is already part of the
//! dependency stack and nothing in this crate relies on a ULID's
//! lexicographic-sortability.

/// An opaque entity identifier.
pub type Id = String;

/// Generates a fresh opaque identifier.
pub fn new_id() -> Id {
    uuid::Uuid::new_v4().to_string()
}

/// Deterministically derives an idempotency key from a tuple of parts, used
/// by the credit-grant engine (spec §4.C) to guarantee at most one
/// successful application per `(grant, period)`.
pub fn derive_key(parts: &[&str]) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
        0u8.hash(&mut hasher); // separator, so ("ab","c") != ("a","bc")
    }
    format!("{:016x}", hasher.finish())
}
