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

//! Error taxonomy for the storage, retry, and engine layers.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced directly by the repository layer.
///
/// `Deadlock` is the only variant the [`crate::task_manager::TaskManager`]
/// retries; every other variant is terminal for the call that produced it.
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("transient contention on the backing store, retry")]
    Deadlock,

    #[error("task {0} already exists")]
    Dup(Uuid),

    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

impl RepoError {
    /// Whether this error represents transient contention that the
    /// [`crate::task_manager::TaskManager`] should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepoError::Deadlock)
    }
}

/// Typed outcomes surfaced by the [`crate::task_manager::TaskManager`]
/// once its retry budget on a [`RepoError::Deadlock`] is exhausted, or
/// immediately for non-transient conditions.
#[derive(Error, Debug)]
pub enum TmError {
    #[error("exhausted retries creating tasks: {0}")]
    CreatingTasks(#[source] RepoError),

    #[error("exhausted retries deleting task: {0}")]
    DeletingTask(#[source] RepoError),

    #[error("exhausted retries confirming execution: {0}")]
    ConfirmationTasks(#[source] RepoError),

    #[error("exhausted retries listing tasks to complete: {0}")]
    GetTasks(#[source] RepoError),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("operation cancelled")]
    Cancelled,
}

/// Top-level engine error, covering setup failures in addition to
/// whatever a [`TmError`] surfaces at runtime.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    TaskManager(#[from] TmError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to build the database connection pool: {0}")]
    PoolInit(String),

    #[error("failed to run database migrations: {0}")]
    Migration(String),
}
