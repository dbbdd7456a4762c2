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

//! Top-level composition (§4.6): wires Repository, TaskManager, Preloader,
//! WaitingStage and Sender into the three operations external callers
//! see — `create`, `delete`, `consume` — plus `run`, which drives the
//! pipeline until cancelled.
//!
//! Cyclic-reference risk between these layers (§9) is resolved by
//! constructor injection of trait objects rather than back-references:
//! `Engine` owns `Arc`s to each stage and nothing points back up at it.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::database::universal_types::UniversalUuid;
use crate::database::Database;
use crate::error::EngineError;
use crate::instance::InstanceId;
use crate::models::Task;
use crate::preloader::Preloader;
use crate::repository::{DieselRepository, Repository, RepositoryOptions};
use crate::sender::{Delivery, NoopDelivery, Sender};
use crate::sink::{ErrorSink, MonitoringSink, TracingErrorSink, TracingMonitoringSink};
use crate::task_manager::TaskManager;
use crate::waiting_stage::WaitingStage;

/// Delivers a fired task into the consumer-facing stream returned by
/// [`Engine::consume`], backpressuring the Sender the same way any other
/// [`Delivery`] would.
struct ChannelDelivery {
    tx: mpsc::Sender<Task>,
}

#[async_trait]
impl Delivery for ChannelDelivery {
    async fn deliver(&self, task: &Task) {
        // Best-effort: a closed consumer means nobody is listening, which
        // is not an error the Sender should retry or report — the task is
        // still durably confirmed either way.
        let _ = self.tx.send(task.clone()).await;
    }
}

/// Wraps a `tokio::sync::mpsc::Receiver` as a `futures::Stream`, exposed
/// by [`Engine::consume`] so callers aren't tied to `tokio::sync::mpsc`
/// directly.
pub struct TaskStream(mpsc::Receiver<Task>);

impl Stream for TaskStream {
    type Item = Task;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Task>> {
        self.0.poll_recv(cx)
    }
}

/// Composes the scheduling pipeline and exposes `create`/`delete`/`consume`/`run`.
pub struct Engine {
    task_manager: Arc<TaskManager>,
    preloader: Arc<Preloader>,
    waiting_stage: Arc<WaitingStage>,
    sender: Mutex<Option<Sender>>,
    consumer_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    instance: InstanceId,
    cancel: CancellationToken,
}

impl Engine {
    /// Builds an `Engine` from a validated [`EngineConfig`], using the
    /// default `tracing`-backed sinks and no separate delivery
    /// collaborator beyond the [`Engine::consume`] stream.
    ///
    /// Runs pending migrations against the configured database before
    /// returning, so a freshly-provisioned database is usable immediately.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_sinks(
            config,
            Arc::new(TracingErrorSink),
            Arc::new(TracingMonitoringSink),
        )
        .await
    }

    /// As [`Engine::new`], but with caller-supplied error and monitoring
    /// sinks — the seam named in §6 for operators who want metrics routed
    /// somewhere other than `tracing`.
    pub async fn with_sinks(
        config: EngineConfig,
        error_sink: Arc<dyn ErrorSink>,
        monitoring: Arc<dyn MonitoringSink>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(crate::config::ConfigError::from)?;

        let instance = config
            .instance
            .id
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::generate);

        let url = config
            .database
            .resolve_url()
            .map_err(crate::config::ConfigError::from)?;
        let database = Database::new(&url, config.database.pool_size);
        database
            .run_migrations()
            .await
            .map_err(EngineError::Migration)?;

        let repository_options = RepositoryOptions {
            max_count_tasks_in_collection: config.repository.max_count_tasks_in_collection as i64,
            max_retries_on_deadlock: config.repository.max_retries_on_deadlock,
        };
        let repository: Arc<dyn Repository> = Arc::new(DieselRepository::new(
            database,
            instance,
            repository_options,
        ));

        let cancel = CancellationToken::new();
        let task_manager = Arc::new(TaskManager::new(
            repository,
            error_sink.clone(),
            monitoring.clone(),
            config.pipeline.manager_max_retries,
            cancel.clone(),
        ));

        let (preloader, preloaded_rx) = Preloader::new(
            task_manager.clone(),
            config.preloader.preloaded_channel_capacity,
            Duration::from_secs(config.preloader.preload_horizon_secs),
            error_sink.clone(),
            monitoring.clone(),
            cancel.clone(),
        );

        let (waiting_stage, ready_rx) = WaitingStage::new(
            preloaded_rx,
            config.pipeline.ready_channel_capacity,
            monitoring.clone(),
            cancel.clone(),
        );

        let (consumer_tx, consumer_rx) = mpsc::channel(config.pipeline.ready_channel_capacity.max(1));
        let delivery: Arc<dyn Delivery> = Arc::new(ChannelDelivery { tx: consumer_tx });

        let sender = Sender::new(
            ready_rx,
            task_manager.clone(),
            delivery,
            error_sink,
            config.pipeline.sender_batch_size,
            Duration::from_millis(config.pipeline.sender_batch_window_ms),
            cancel.clone(),
        );

        Ok(Self {
            task_manager,
            preloader: Arc::new(preloader),
            waiting_stage: Arc::new(waiting_stage),
            sender: Mutex::new(Some(sender)),
            consumer_rx: Mutex::new(Some(consumer_rx)),
            instance,
            cancel,
        })
    }

    /// Builds an `Engine` directly from its parts without touching a
    /// database or config file, for callers (tests, benchmarks) that
    /// already have a [`Repository`] in hand.
    pub fn from_parts(
        repository: Arc<dyn Repository>,
        instance: InstanceId,
        preload_horizon: Duration,
        preloaded_channel_capacity: usize,
        ready_channel_capacity: usize,
        manager_max_retries: u32,
        sender_batch_size: usize,
        sender_batch_window: Duration,
        error_sink: Arc<dyn ErrorSink>,
        monitoring: Arc<dyn MonitoringSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_manager = Arc::new(TaskManager::new(
            repository,
            error_sink.clone(),
            monitoring.clone(),
            manager_max_retries,
            cancel.clone(),
        ));

        let (preloader, preloaded_rx) = Preloader::new(
            task_manager.clone(),
            preloaded_channel_capacity,
            preload_horizon,
            error_sink.clone(),
            monitoring.clone(),
            cancel.clone(),
        );

        let (waiting_stage, ready_rx) =
            WaitingStage::new(preloaded_rx, ready_channel_capacity, monitoring.clone(), cancel.clone());

        let (consumer_tx, consumer_rx) = mpsc::channel(ready_channel_capacity.max(1));
        let delivery: Arc<dyn Delivery> = Arc::new(ChannelDelivery { tx: consumer_tx });

        let sender = Sender::new(
            ready_rx,
            task_manager.clone(),
            delivery,
            error_sink,
            sender_batch_size,
            sender_batch_window,
            cancel.clone(),
        );

        Self {
            task_manager,
            preloader: Arc::new(preloader),
            waiting_stage: Arc::new(waiting_stage),
            sender: Mutex::new(Some(sender)),
            consumer_rx: Mutex::new(Some(consumer_rx)),
            instance,
            cancel,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Registers `task`. Tasks within the preload horizon take the
    /// immediate-add fast path (§4.3) instead of waiting for the next sweep.
    pub async fn create(&self, task: Task) -> Result<(), EngineError> {
        self.preloader.submit_task(task).await?;
        Ok(())
    }

    /// Removes `task_id` from durable state, from any lifecycle state. A
    /// task already preloaded into this instance's in-memory pipeline is
    /// still emitted once armed — consumers must tolerate this (§3).
    pub async fn delete(&self, task_id: Uuid) -> Result<(), EngineError> {
        self.task_manager
            .delete_task(UniversalUuid(task_id))
            .await?;
        Ok(())
    }

    /// Returns the stream of fired tasks. May only be called once per
    /// engine instance; the underlying channel has a single consumer.
    ///
    /// # Panics
    /// Panics if called more than once.
    pub fn consume(&self) -> TaskStream {
        let rx = self
            .consumer_rx
            .lock()
            .unwrap()
            .take()
            .expect("Engine::consume called more than once");
        TaskStream(rx)
    }

    /// Starts the Preloader, WaitingStage, and Sender loops and blocks
    /// until the engine is cancelled via [`Engine::shutdown`].
    ///
    /// # Panics
    /// Panics if called more than once.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut sender = self
            .sender
            .lock()
            .unwrap()
            .take()
            .expect("Engine::run called more than once");

        let preloader = self.preloader.clone();
        let waiting_stage = self.waiting_stage.clone();

        let preloader_handle = tokio::spawn(async move { preloader.run().await });
        let waiting_stage_handle = tokio::spawn(async move { waiting_stage.run().await });
        let sender_handle = tokio::spawn(async move { sender.run().await });

        self.cancel.cancelled().await;

        let _ = tokio::join!(preloader_handle, waiting_stage_handle, sender_handle);
        Ok(())
    }

    /// Cancels the engine: in-flight stages drain without emitting new
    /// work and `run` returns once they've unwound (§5).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::universal_types::UniversalTimestamp;
    use crate::error::RepoError;
    use crate::models::ClaimedCollection;
    use crate::sink::test_support::{RecordingErrorSink, RecordingMonitoringSink};
    use futures::StreamExt;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct InMemoryRepository {
        collections: Mutex<VecDeque<Option<ClaimedCollection>>>,
        created: Mutex<Vec<(Task, bool)>>,
    }

    #[async_trait]
    impl Repository for InMemoryRepository {
        async fn create(&self, task: &Task, is_taken: bool) -> Result<(), RepoError> {
            self.created.lock().unwrap().push((task.clone(), is_taken));
            Ok(())
        }

        async fn delete(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
            Ok(1)
        }

        async fn confirm_execution(&self, task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
            Ok(task_ids.len() as u64)
        }

        async fn claim_next_collection(
            &self,
            _horizon: Duration,
        ) -> Result<Option<ClaimedCollection>, RepoError> {
            Ok(self.collections.lock().unwrap().pop_front().flatten())
        }
    }

    fn engine(repo: Arc<InMemoryRepository>) -> Engine {
        Engine::from_parts(
            repo,
            InstanceId::new(1),
            Duration::from_secs(5),
            16,
            16,
            3,
            50,
            Duration::from_millis(100),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
        )
    }

    #[tokio::test]
    async fn near_immediate_task_is_emitted_and_confirmed() {
        let repo = Arc::new(InMemoryRepository::default());
        // No sweep backlog: the fast path alone should deliver this task.
        for _ in 0..50 {
            repo.collections.lock().unwrap().push_back(None);
        }
        let engine = Arc::new(engine(repo.clone()));
        let mut stream = engine.consume();

        let run_engine = engine.clone();
        let run_handle = tokio::spawn(async move { run_engine.run().await });

        let task = Task::new(UniversalTimestamp::now());
        engine.create(task.clone()).await.unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("task emitted before timeout")
            .expect("stream still open");
        assert_eq!(fired.id, task.id);

        engine.shutdown();
        run_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn create_and_delete_round_trip_leaves_no_trace() {
        let repo = Arc::new(InMemoryRepository::default());
        for _ in 0..10 {
            repo.collections.lock().unwrap().push_back(None);
        }
        let engine = engine(repo.clone());

        let task = Task::new(UniversalTimestamp::from_secs(
            UniversalTimestamp::now().as_secs() + 3600,
        ));
        engine.create(task.clone()).await.unwrap();
        engine.delete(task.id.as_uuid()).await.unwrap();

        assert_eq!(repo.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_unknown_task_surfaces_task_not_found() {
        struct EmptyDeleteRepository;

        #[async_trait]
        impl Repository for EmptyDeleteRepository {
            async fn create(&self, _task: &Task, _is_taken: bool) -> Result<(), RepoError> {
                Ok(())
            }
            async fn delete(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
                Ok(0)
            }
            async fn confirm_execution(&self, _task_ids: &[UniversalUuid]) -> Result<u64, RepoError> {
                Ok(0)
            }
            async fn claim_next_collection(
                &self,
                _horizon: Duration,
            ) -> Result<Option<ClaimedCollection>, RepoError> {
                Ok(None)
            }
        }

        let engine = Engine::from_parts(
            Arc::new(EmptyDeleteRepository),
            InstanceId::new(1),
            Duration::from_secs(5),
            16,
            16,
            3,
            50,
            Duration::from_millis(100),
            Arc::new(RecordingErrorSink::default()),
            Arc::new(RecordingMonitoringSink::default()),
        );

        let err = engine.delete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskManager(crate::error::TmError::TaskNotFound(_))));
    }
}
