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

//! Policy wrapper around [`crate::repository::Repository`]: retry/backoff
//! on transient contention, error classification, and cancellation (§4.2).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::database::universal_types::UniversalUuid;
use crate::error::{RepoError, TmError};
use crate::models::{ClaimedCollection, Task};
use crate::repository::Repository;
use crate::sink::{ErrorSink, Extra, Level, MonitoringSink};

/// Internal outcome of the retry loop, before it's mapped onto the
/// operation-specific [`TmError`] variant by each public method.
enum TmFailure {
    Cancelled,
    /// The retry budget was exhausted on a transient [`RepoError`].
    Exhausted(RepoError),
    /// A non-transient [`RepoError`] that was never eligible for retry.
    Terminal(RepoError),
}

/// Retry/backoff and error-classification wrapper around a [`Repository`].
///
/// Up to `max_retries` attempts are made per operation (§4.2's `N_RETRY`).
/// Every attempt that fails with a transient [`RepoError`] emits one
/// Level-Error event; exhausting the budget emits one further event
/// restating the final error before the typed `Tm*` error is returned, so a
/// fully-exhausted call produces `max_retries` repository calls and
/// `max_retries + 1` error-sink events (§8, scenario 4).
pub struct TaskManager {
    repository: Arc<dyn Repository>,
    error_sink: Arc<dyn ErrorSink>,
    monitoring: Arc<dyn MonitoringSink>,
    max_retries: u32,
    cancel: CancellationToken,
}

impl TaskManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        error_sink: Arc<dyn ErrorSink>,
        monitoring: Arc<dyn MonitoringSink>,
        max_retries: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repository,
            error_sink,
            monitoring,
            max_retries: max_retries.max(1),
            cancel,
        }
    }

    async fn run_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, TmFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TmFailure::Cancelled);
            }
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    self.error_sink.record(
                        Level::Error,
                        &format!("repository call failed, attempt {attempt}/{}: {err}", self.max_retries),
                        Extra::new(),
                    );
                    if attempt >= self.max_retries {
                        self.error_sink.record(
                            Level::Error,
                            &format!("retry budget exhausted: {err}"),
                            Extra::new(),
                        );
                        return Err(TmFailure::Exhausted(err));
                    }
                }
                Err(err) => {
                    self.error_sink
                        .record(Level::Error, &format!("non-retryable repository error: {err}"), Extra::new());
                    return Err(TmFailure::Terminal(err));
                }
            }
        }
    }

    pub async fn create_task(&self, task: &Task, is_taken: bool) -> Result<(), TmError> {
        let repository = self.repository.clone();
        let task = task.clone();
        let result = self
            .run_with_retry(|| {
                let repository = repository.clone();
                let task = task.clone();
                async move { repository.create(&task, is_taken).await }
            })
            .await;

        match result {
            Ok(()) => {
                self.monitoring.counter("tasks_created", 1);
                Ok(())
            }
            Err(TmFailure::Cancelled) => Err(TmError::Cancelled),
            Err(TmFailure::Exhausted(e)) | Err(TmFailure::Terminal(e)) => Err(TmError::CreatingTasks(e)),
        }
    }

    pub async fn delete_task(&self, task_id: UniversalUuid) -> Result<(), TmError> {
        let repository = self.repository.clone();
        let result = self
            .run_with_retry(|| {
                let repository = repository.clone();
                async move { repository.delete(&[task_id]).await }
            })
            .await;

        match result {
            Ok(count) if count == 0 => Err(TmError::TaskNotFound(task_id.as_uuid())),
            Ok(_) => {
                self.monitoring.counter("tasks_deleted", 1);
                Ok(())
            }
            Err(TmFailure::Cancelled) => Err(TmError::Cancelled),
            Err(TmFailure::Exhausted(e)) | Err(TmFailure::Terminal(e)) => Err(TmError::DeletingTask(e)),
        }
    }

    pub async fn confirm_execution(&self, task_ids: &[UniversalUuid]) -> Result<u64, TmError> {
        let repository = self.repository.clone();
        let ids = task_ids.to_vec();
        let result = self
            .run_with_retry(|| {
                let repository = repository.clone();
                let ids = ids.clone();
                async move { repository.confirm_execution(&ids).await }
            })
            .await;

        match result {
            Ok(count) => {
                self.monitoring.counter("tasks_fired", count);
                Ok(count)
            }
            Err(TmFailure::Cancelled) => Err(TmError::Cancelled),
            Err(TmFailure::Exhausted(e)) | Err(TmFailure::Terminal(e)) => Err(TmError::ConfirmationTasks(e)),
        }
    }

    /// Sweeps for one Collection whose tasks are within `horizon` of firing.
    /// `Ok(None)` is the `NoTasksFound` case: the Preloader's cue to sleep.
    pub async fn get_tasks_to_complete(
        &self,
        horizon: Duration,
    ) -> Result<Option<ClaimedCollection>, TmError> {
        let repository = self.repository.clone();
        let result = self
            .run_with_retry(|| {
                let repository = repository.clone();
                async move { repository.claim_next_collection(horizon).await }
            })
            .await;

        match result {
            Ok(found) => Ok(found),
            Err(TmFailure::Cancelled) => Err(TmError::Cancelled),
            Err(TmFailure::Exhausted(e)) | Err(TmFailure::Terminal(e)) => Err(TmError::GetTasks(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::universal_types::UniversalTimestamp;
    use crate::sink::test_support::RecordingErrorSink;
    use crate::sink::test_support::RecordingMonitoringSink;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRepository {
        create_responses: Mutex<VecDeque<Result<(), RepoError>>>,
        delete_responses: Mutex<VecDeque<Result<u64, RepoError>>>,
        delete_calls: Mutex<u32>,
        create_calls: Mutex<u32>,
    }

    #[async_trait]
    impl Repository for ScriptedRepository {
        async fn create(&self, _task: &Task, _is_taken: bool) -> Result<(), RepoError> {
            *self.create_calls.lock().unwrap() += 1;
            self.create_responses.lock().unwrap().pop_front().expect("scripted response")
        }

        async fn delete(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
            *self.delete_calls.lock().unwrap() += 1;
            self.delete_responses.lock().unwrap().pop_front().expect("scripted response")
        }

        async fn confirm_execution(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
            unimplemented!("not exercised by these tests")
        }

        async fn claim_next_collection(
            &self,
            _horizon: Duration,
        ) -> Result<Option<ClaimedCollection>, RepoError> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn manager(
        repo: Arc<ScriptedRepository>,
    ) -> (TaskManager, Arc<RecordingErrorSink>, Arc<RecordingMonitoringSink>) {
        let error_sink = Arc::new(RecordingErrorSink::default());
        let monitoring = Arc::new(RecordingMonitoringSink::default());
        let manager = TaskManager::new(
            repo,
            error_sink.clone(),
            monitoring.clone(),
            3,
            CancellationToken::new(),
        );
        (manager, error_sink, monitoring)
    }

    #[tokio::test]
    async fn delete_retry_ladder_matches_scenario_3() {
        let repo = Arc::new(ScriptedRepository::default());
        repo.delete_responses.lock().unwrap().extend([
            Err(RepoError::Deadlock),
            Err(RepoError::Deadlock),
            Ok(0),
        ]);
        let (manager, error_sink, _monitoring) = manager(repo.clone());

        let err = manager
            .delete_task(UniversalUuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, TmError::TaskNotFound(_)));
        assert_eq!(*repo.delete_calls.lock().unwrap(), 3);
        assert_eq!(error_sink.error_count(), 2);
    }

    #[tokio::test]
    async fn create_retry_exhaustion_matches_scenario_4() {
        let repo = Arc::new(ScriptedRepository::default());
        repo.create_responses.lock().unwrap().extend([
            Err(RepoError::Deadlock),
            Err(RepoError::Deadlock),
            Err(RepoError::Deadlock),
            Err(RepoError::Deadlock),
        ]);
        let (manager, error_sink, _monitoring) = manager(repo.clone());

        let task = Task::new(UniversalTimestamp::now());
        let err = manager.create_task(&task, false).await.unwrap_err();

        assert!(matches!(err, TmError::CreatingTasks(_)));
        assert_eq!(*repo.create_calls.lock().unwrap(), 3);
        assert_eq!(error_sink.error_count(), 4);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_any_call() {
        let repo = Arc::new(ScriptedRepository::default());
        let error_sink = Arc::new(RecordingErrorSink::default());
        let monitoring = Arc::new(RecordingMonitoringSink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let manager = TaskManager::new(repo.clone(), error_sink, monitoring, 3, cancel);

        let err = manager
            .delete_task(UniversalUuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, TmError::Cancelled));
        assert_eq!(*repo.delete_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn successful_create_increments_tasks_created() {
        let repo = Arc::new(ScriptedRepository::default());
        repo.create_responses.lock().unwrap().push_back(Ok(()));
        let (manager, _error_sink, monitoring) = manager(repo);

        let task = Task::new(UniversalTimestamp::now());
        manager.create_task(&task, false).await.unwrap();

        assert_eq!(*monitoring.counters.lock().unwrap().get("tasks_created").unwrap(), 1);
    }
}
