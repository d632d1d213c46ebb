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

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::ports::{Clock, Lock, Store};

/// Configures the required collaborators of an [`crate::engine::Engine`].
pub struct EngineConfig {
    pub store: Arc<dyn Store>,
    pub lock: Arc<dyn Lock>,
    pub clock: Arc<dyn Clock>,
    pub timezone: String,
}

/// A builder for the optional, tunable parameters of an [`crate::engine::Engine`].
pub struct EngineBuilder {
    pub(crate) wallet_lock_timeout: Duration,
    pub(crate) schedule_batch_size: usize,
    pub(crate) low_balance_threshold: Decimal,
}

impl Default for EngineBuilder {
    fn default() -> EngineBuilder {
        EngineBuilder::DEFAULT
    }
}

impl EngineBuilder {
    /// The default tunables.
    ///
    /// Exposed as a constant for use in constant evaluation contexts.
    pub const DEFAULT: EngineBuilder = EngineBuilder {
        wallet_lock_timeout: Duration::from_secs(10),
        schedule_batch_size: 100,
        low_balance_threshold: crate::alert::DEFAULT_LOW_BALANCE_THRESHOLD,
    };

    /// How long a ledger operation waits to acquire a wallet's advisory
    /// lock before giving up (spec §5).
    pub const fn wallet_lock_timeout(mut self, timeout: Duration) -> Self {
        self.wallet_lock_timeout = timeout;
        self
    }

    /// The maximum number of due schedules or credit grant applications
    /// processed per poll (spec §5 "bounded batches").
    pub const fn schedule_batch_size(mut self, batch_size: usize) -> Self {
        self.schedule_batch_size = batch_size;
        self
    }

    /// The wallet credit balance below which an alert fires (spec §4.G).
    pub const fn low_balance_threshold(mut self, threshold: Decimal) -> Self {
        self.low_balance_threshold = threshold;
        self
    }

    pub fn build(self, config: EngineConfig) -> crate::engine::Engine {
        crate::engine::Engine::from_parts(config, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batch_size_is_bounded() {
        assert_eq!(EngineBuilder::DEFAULT.schedule_batch_size, 100);
    }
}
