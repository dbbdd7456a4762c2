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

//! Domain types shared across the repository, task manager, and pipeline
//! stages. These are plain Rust types; backend-specific row shapes live in
//! [`crate::database::schema`] and are converted to/from these at the
//! repository boundary, matching the teacher's universal-type convention.

use serde::{Deserialize, Serialize};

use crate::database::universal_types::{UniversalTimestamp, UniversalUuid};
use crate::instance::InstanceId;

/// A unit of work scheduled to fire at `exec_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: UniversalUuid,
    pub exec_time: UniversalTimestamp,
    pub taken_by_instance: Option<InstanceId>,
}

impl Task {
    /// Builds a new, unclaimed task with a fresh id.
    pub fn new(exec_time: UniversalTimestamp) -> Self {
        Self {
            id: UniversalUuid::new_v4(),
            exec_time,
            taken_by_instance: None,
        }
    }

    pub fn is_taken(&self) -> bool {
        self.taken_by_instance.is_some()
    }
}

/// A bounded shard of tasks sharing a close execution window.
///
/// A collection is the unit of claim: the preloader claims an entire
/// collection atomically, so two concurrent sweepers across instances
/// never observe the same collection as unclaimed at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: UniversalUuid,
    pub exec_time: UniversalTimestamp,
    pub task_count: i64,
    pub taken_by_instance: Option<InstanceId>,
}

impl Collection {
    pub fn is_full(&self, max_count: i64) -> bool {
        self.task_count >= max_count
    }

    pub fn is_claimed(&self) -> bool {
        self.taken_by_instance.is_some()
    }
}

/// A collection together with the tasks a claim returned for it.
///
/// This is the unit `Repository::find_by_sec_to_exec_time`'s cursor
/// yields: by construction every task in `tasks` belongs to `collection`
/// and `collection` has already been claimed for the calling instance.
#[derive(Debug, Clone)]
pub struct ClaimedCollection {
    pub collection: Collection,
    pub tasks: Vec<Task>,
}
