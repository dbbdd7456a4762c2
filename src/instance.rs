/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Process-wide identity used to claim collections.
//!
//! An [`InstanceId`] is immutable once an [`crate::Engine`] is constructed:
//! it is stamped into the `taken_by_instance` column of every collection
//! this process claims, so a restart never silently reassigns ownership of
//! in-flight claims (a crashed instance's claims are recovered by the next
//! sweep's horizon check, not by identity reuse).

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A 64-bit identifier unique to one running engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub i64);

impl InstanceId {
    /// Builds an `InstanceId` from a caller-supplied value.
    ///
    /// Callers that coordinate instance identity externally (e.g. a
    /// Kubernetes pod ordinal) should use this instead of [`Self::generate`].
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Generates a random, process-scoped instance id.
    ///
    /// Collisions are possible but astronomically unlikely for the
    /// cardinality of cooperating instances this engine targets; the claim
    /// CAS is keyed on collection id, not instance id, so a collision only
    /// risks two instances sharing a label, not double-claiming.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self(rng.gen())
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for InstanceId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = InstanceId::generate();
        let b = InstanceId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn display_matches_inner_value() {
        let id = InstanceId::new(42);
        assert_eq!(id.to_string(), "42");
    }
}
