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

//! Periodic sweep from durable storage into the in-memory pipeline (§4.3).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::database::universal_types::UniversalTimestamp;
use crate::error::TmError;
use crate::models::Task;
use crate::sink::{ErrorSink, Extra, Level, MonitoringSink};
use crate::task_manager::TaskManager;

/// Continuously feeds PreloadedChan with tasks whose `exec_time` falls
/// within `horizon` of now, and services the immediate-add fast path for
/// tasks created close enough to firing that they shouldn't wait for the
/// next sweep.
pub struct Preloader {
    task_manager: Arc<TaskManager>,
    preloaded_tx: mpsc::Sender<Task>,
    horizon: Duration,
    error_sink: Arc<dyn ErrorSink>,
    monitoring: Arc<dyn MonitoringSink>,
    cancel: CancellationToken,
}

impl Preloader {
    /// Builds a Preloader and its PreloadedChan, sized by `channel_capacity`.
    pub fn new(
        task_manager: Arc<TaskManager>,
        channel_capacity: usize,
        horizon: Duration,
        error_sink: Arc<dyn ErrorSink>,
        monitoring: Arc<dyn MonitoringSink>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Task>) {
        let (preloaded_tx, preloaded_rx) = mpsc::channel(channel_capacity.max(1));
        (
            Self {
                task_manager,
                preloaded_tx,
                horizon,
                error_sink,
                monitoring,
                cancel,
            },
            preloaded_rx,
        )
    }

    /// A clone of the PreloadedChan sender, for callers (the Engine) that
    /// need to push tasks in directly via [`Preloader::submit_task`]
    /// without going through the sweep loop.
    pub fn preloaded_sender(&self) -> mpsc::Sender<Task> {
        self.preloaded_tx.clone()
    }

    /// Runs the sweep loop (§4.3 steps 1-4) until cancelled.
    pub async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.task_manager.get_tasks_to_complete(self.horizon).await {
                Ok(Some(claimed)) => {
                    self.monitoring
                        .gauge("preload_lag_seconds", lag_seconds(&claimed.collection.exec_time));
                    for task in claimed.tasks {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            sent = self.preloaded_tx.send(task) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    // Cursor not yet exhausted for this sweep pass: loop immediately.
                }
                Ok(None) => {
                    if self.sleep_or_cancel(self.horizon / 2).await {
                        return;
                    }
                }
                Err(TmError::Cancelled) => return,
                Err(err) => {
                    self.error_sink.record(
                        Level::Error,
                        &format!("preloader sweep failed: {err}"),
                        Extra::new(),
                    );
                    if self.sleep_or_cancel(self.horizon / 2).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration` unless cancelled first. Returns `true` if
    /// cancellation won the race.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Immediate-add fast path (§4.3): a task due within `horizon` is
    /// claimed and pushed straight onto PreloadedChan instead of waiting
    /// for the next sweep to pick it up.
    pub async fn submit_task(&self, task: Task) -> Result<(), TmError> {
        let now = UniversalTimestamp::now();
        let relative = task.exec_time.as_secs() - now.as_secs();

        if relative <= self.horizon.as_secs() as i64 {
            self.task_manager.create_task(&task, true).await?;
            // Best-effort: if the pipeline is shutting down the durable
            // record still exists and will be picked up by a sweep on the
            // next instance that claims it, or by this one on restart.
            let _ = self.preloaded_tx.send(task).await;
        } else {
            self.task_manager.create_task(&task, false).await?;
        }
        Ok(())
    }
}

fn lag_seconds(exec_time: &UniversalTimestamp) -> f64 {
    (UniversalTimestamp::now().as_secs() - exec_time.as_secs()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::universal_types::UniversalUuid;
    use crate::error::RepoError;
    use crate::models::{ClaimedCollection, Collection};
    use crate::repository::Repository;
    use crate::sink::test_support::{RecordingErrorSink, RecordingMonitoringSink};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRepository {
        collections: Mutex<VecDeque<Option<ClaimedCollection>>>,
        create_calls: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Repository for ScriptedRepository {
        async fn create(&self, _task: &Task, is_taken: bool) -> Result<(), RepoError> {
            self.create_calls.lock().unwrap().push(is_taken);
            Ok(())
        }

        async fn delete(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
            Ok(1)
        }

        async fn confirm_execution(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
            Ok(0)
        }

        async fn claim_next_collection(
            &self,
            _horizon: Duration,
        ) -> Result<Option<ClaimedCollection>, RepoError> {
            let mut collections = self.collections.lock().unwrap();
            Ok(collections.pop_front().flatten())
        }
    }

    fn task_manager(repo: Arc<ScriptedRepository>) -> Arc<TaskManager> {
        Arc::new(TaskManager::new(
            repo,
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
            3,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn sweep_forwards_claimed_tasks_then_sleeps_on_empty() {
        let repo = Arc::new(ScriptedRepository::default());
        let collection = Collection {
            id: UniversalUuid::new_v4(),
            exec_time: UniversalTimestamp::now(),
            task_count: 2,
            taken_by_instance: None,
        };
        let tasks = vec![
            Task::new(UniversalTimestamp::now()),
            Task::new(UniversalTimestamp::now()),
        ];
        repo.collections.lock().unwrap().push_back(Some(ClaimedCollection {
            collection,
            tasks,
        }));
        // every subsequent sweep finds nothing more.
        for _ in 0..50 {
            repo.collections.lock().unwrap().push_back(None);
        }

        let cancel = CancellationToken::new();
        let (preloader, mut preloaded_rx) = Preloader::new(
            task_manager(repo),
            16,
            Duration::from_millis(20),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { preloader.run().await });

        let first = preloaded_rx.recv().await.expect("first task forwarded");
        let second = preloaded_rx.recv().await.expect("second task forwarded");
        assert_ne!(first.id, second.id);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn submit_task_within_horizon_takes_fast_path() {
        let repo = Arc::new(ScriptedRepository::default());
        let cancel = CancellationToken::new();
        let (preloader, mut preloaded_rx) = Preloader::new(
            task_manager(repo.clone()),
            16,
            Duration::from_secs(60),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
            cancel,
        );

        let due_soon = Task::new(UniversalTimestamp::now());
        preloader.submit_task(due_soon.clone()).await.unwrap();

        let forwarded = preloaded_rx.recv().await.expect("fast-pathed onto PreloadedChan");
        assert_eq!(forwarded.id, due_soon.id);
        assert_eq!(repo.create_calls.lock().unwrap().as_slice(), &[true]);
    }

    #[tokio::test]
    async fn submit_task_beyond_horizon_skips_fast_path() {
        let repo = Arc::new(ScriptedRepository::default());
        let cancel = CancellationToken::new();
        let (preloader, mut preloaded_rx) = Preloader::new(
            task_manager(repo.clone()),
            16,
            Duration::from_secs(5),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
            cancel,
        );

        let far_future = Task::new(UniversalTimestamp::from_secs(
            UniversalTimestamp::now().as_secs() + 3600,
        ));
        preloader.submit_task(far_future).await.unwrap();

        assert!(preloaded_rx.try_recv().is_err());
        assert_eq!(repo.create_calls.lock().unwrap().as_slice(), &[false]);
    }
}
