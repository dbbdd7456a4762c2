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

//! Terminal pipeline stage: batches ReadyChan into `confirm_execution`
//! calls and hands fired tasks to a delivery collaborator (§4.5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::database::universal_types::UniversalUuid;
use crate::models::Task;
use crate::sink::{ErrorSink, Extra, Level};
use crate::task_manager::TaskManager;

/// Hands a fired task to whatever downstream transport the caller of
/// [`crate::Engine::consume`] implements. Named as an external
/// collaborator (§6): the engine only needs to know a task fired in order
/// to durably remove it, not how it's transported onward. `async` so a
/// slow or backpressured delivery channel throttles the Sender the same
/// way a full PreloadedChan throttles the Preloader.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, task: &Task);
}

/// [`Delivery`] that does nothing beyond the confirm; used when a caller
/// only wants the [`crate::Engine::consume`] stream and has no separate
/// delivery collaborator to notify.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelivery;

#[async_trait]
impl Delivery for NoopDelivery {
    async fn deliver(&self, _task: &Task) {}
}

/// Consumes ReadyChan, confirming fired tasks in batches of
/// `batch_size` or every `batch_window`, whichever comes first (§4.5).
pub struct Sender {
    ready_rx: mpsc::Receiver<Task>,
    task_manager: Arc<TaskManager>,
    delivery: Arc<dyn Delivery>,
    error_sink: Arc<dyn ErrorSink>,
    batch_size: usize,
    batch_window: Duration,
    cancel: CancellationToken,
}

impl Sender {
    pub fn new(
        ready_rx: mpsc::Receiver<Task>,
        task_manager: Arc<TaskManager>,
        delivery: Arc<dyn Delivery>,
        error_sink: Arc<dyn ErrorSink>,
        batch_size: usize,
        batch_window: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ready_rx,
            task_manager,
            delivery,
            error_sink,
            batch_size: batch_size.max(1),
            batch_window,
            cancel,
        }
    }

    /// Runs the batch-confirm loop until ReadyChan closes or the engine is
    /// cancelled. On cancellation any partially-filled batch still in hand
    /// is confirmed (best-effort) before returning, per §5's cancellation
    /// contract: confirmations in flight get a grace period to finish.
    pub async fn run(&mut self) {
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.confirm_batch(&mut batch).await;
                    return;
                }
                received = self.fill_batch(&mut batch) => {
                    if !received {
                        self.confirm_batch(&mut batch).await;
                        return;
                    }
                    // `fill_batch` only returns `true` once the batch is full
                    // or the window has elapsed; either way whatever it
                    // collected is due for confirmation now (§4.5).
                    self.confirm_batch(&mut batch).await;
                }
            }
        }
    }

    /// Waits up to `batch_window` to accumulate up to `batch_size` tasks.
    /// Returns `false` when ReadyChan has closed and nothing more will
    /// arrive (the caller then flushes what it has and stops).
    async fn fill_batch(&mut self, batch: &mut Vec<Task>) -> bool {
        let first = match self.ready_rx.recv().await {
            Some(task) => task,
            None => return false,
        };
        self.delivery.deliver(&first).await;
        batch.push(first);

        let deadline = tokio::time::Instant::now() + self.batch_window;
        while batch.len() < self.batch_size {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                maybe_task = self.ready_rx.recv() => {
                    match maybe_task {
                        Some(task) => {
                            self.delivery.deliver(&task).await;
                            batch.push(task);
                        }
                        None => return true,
                    }
                }
            }
        }
        true
    }

    /// Confirms and clears the current batch. Failures after the
    /// TaskManager's retry budget are logged and swallowed: the durable
    /// record may briefly outlive the emission, which downstream
    /// idempotency absorbs (§4.5, §7).
    async fn confirm_batch(&self, batch: &mut Vec<Task>) {
        if batch.is_empty() {
            return;
        }
        let ids: Vec<UniversalUuid> = batch.iter().map(|t| t.id).collect();
        if let Err(err) = self.task_manager.confirm_execution(&ids).await {
            self.error_sink.record(
                Level::Error,
                &format!("confirm_execution failed for batch of {}: {err}", batch.len()),
                Extra::new(),
            );
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::universal_types::{UniversalTimestamp, UniversalUuid as Uuid};
    use crate::error::RepoError;
    use crate::models::ClaimedCollection;
    use crate::repository::Repository;
    use crate::sink::test_support::{RecordingErrorSink, RecordingMonitoringSink};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRepository {
        confirmed: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl Repository for RecordingRepository {
        async fn create(&self, _task: &Task, _is_taken: bool) -> Result<(), RepoError> {
            Ok(())
        }

        async fn delete(&self, _task_ids: &[Uuid]) -> Result<u64, RepoError> {
            Ok(0)
        }

        async fn confirm_execution(&self, task_ids: &[Uuid]) -> Result<u64, RepoError> {
            self.confirmed.lock().unwrap().extend_from_slice(task_ids);
            Ok(task_ids.len() as u64)
        }

        async fn claim_next_collection(
            &self,
            _horizon: Duration,
        ) -> Result<Option<ClaimedCollection>, RepoError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        delivered: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, task: &Task) {
            self.delivered.lock().unwrap().push(task.id);
        }
    }

    #[tokio::test]
    async fn confirms_on_batch_size() {
        let repo = Arc::new(RecordingRepository::default());
        let task_manager = Arc::new(TaskManager::new(
            repo.clone(),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
            3,
            CancellationToken::new(),
        ));
        let delivery = Arc::new(RecordingDelivery::default());
        let (ready_tx, ready_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let mut sender = Sender::new(
            ready_rx,
            task_manager,
            delivery.clone(),
            Arc::new(RecordingErrorSink::default()),
            2,
            Duration::from_secs(60),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { sender.run().await });

        let t1 = Task::new(UniversalTimestamp::now());
        let t2 = Task::new(UniversalTimestamp::now());
        ready_tx.send(t1.clone()).await.unwrap();
        ready_tx.send(t2.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(repo.confirmed.lock().unwrap().len(), 2);
        assert_eq!(delivery.delivered.lock().unwrap().len(), 2);

        cancel.cancel();
        drop(ready_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn confirms_on_window_expiry_with_partial_batch() {
        let repo = Arc::new(RecordingRepository::default());
        let task_manager = Arc::new(TaskManager::new(
            repo.clone(),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
            3,
            CancellationToken::new(),
        ));
        let delivery = Arc::new(RecordingDelivery::default());
        let (ready_tx, ready_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let mut sender = Sender::new(
            ready_rx,
            task_manager,
            delivery,
            Arc::new(RecordingErrorSink::default()),
            50,
            Duration::from_millis(50),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { sender.run().await });

        let task = Task::new(UniversalTimestamp::now());
        ready_tx.send(task.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(repo.confirmed.lock().unwrap().as_slice(), &[task.id]);

        cancel.cancel();
        drop(ready_tx);
        handle.await.unwrap();
    }
}
