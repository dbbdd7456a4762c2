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

//! Storage worker pool concurrency slots (§5).
//!
//! Client-facing `create`/`delete` calls, and the benchmark harness, go
//! through a fixed-size pool of storage workers rather than opening one
//! connection-pool checkout per caller. A [`SlotToken`] reserves one of
//! those workers for the duration of a storage call.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A handle on the storage worker pool's concurrency limit.
///
/// Cloning a [`StorageWorkerPool`] shares the same underlying semaphore, so
/// every clone observes the same `storage_workers` bound from
/// [`crate::config::PipelineConfig`].
#[derive(Clone)]
pub struct StorageWorkerPool {
    semaphore: Arc<Semaphore>,
}

impl StorageWorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Waits for a free worker slot and returns a token holding it.
    ///
    /// The token releases the slot back to the pool when dropped.
    pub async fn acquire(&self) -> SlotToken {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("storage worker pool semaphore is never closed");
        SlotToken { permit }
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held concurrency slot in the [`StorageWorkerPool`].
///
/// Dropping the token returns the slot immediately; there is no manual
/// release/reclaim cycle here because, unlike a deferred task executor,
/// a storage call either completes or the whole retry loop around it gives
/// up — there's no point in the call where releasing early helps.
pub struct SlotToken {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_bounds_concurrent_acquisitions() {
        let pool = StorageWorkerPool::new(2);
        assert_eq!(pool.available_slots(), 2);

        let a = pool.acquire().await;
        let b = pool.acquire().await;
        assert_eq!(pool.available_slots(), 0);

        drop(a);
        assert_eq!(pool.available_slots(), 1);
        drop(b);
        assert_eq!(pool.available_slots(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_free_slot() {
        let pool = StorageWorkerPool::new(1);
        let first = pool.acquire().await;

        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move {
            let _second = pool_clone.acquire().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }
}
