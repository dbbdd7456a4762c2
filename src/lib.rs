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

//! `trigger_engine` moves deferred tasks from durable storage into a
//! strictly time-ordered emission stream, guaranteeing at-most-once
//! claim per task across cooperating engine instances.
//!
//! The pipeline, leaves first: [`repository`] (sharded storage),
//! [`task_manager`] (retry/classification wrapper), [`preloader`]
//! (periodic sweep into an in-memory queue), [`waiting_stage`] (timer
//! heap), [`sender`] (batched confirmation), composed by [`engine`].

// Enforce at least one database backend is selected.
#[cfg(not(any(feature = "postgres", feature = "sqlite")))]
compile_error!("Must enable at least one database backend: 'postgres' or 'sqlite'");

/// Dispatches to a backend-specific async expression based on a detected
/// [`database::BackendType`], compiling out the branch for any backend
/// feature that isn't enabled.
#[macro_export]
macro_rules! dispatch_backend {
    ($backend:expr, $postgres:expr, $sqlite:expr) => {
        match $backend {
            #[cfg(feature = "postgres")]
            $crate::database::BackendType::Postgres => $postgres,
            #[cfg(feature = "sqlite")]
            $crate::database::BackendType::Sqlite => $sqlite,
            #[allow(unreachable_patterns)]
            _ => panic!("database backend not compiled into this build"),
        }
    };
}

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod instance;
pub mod models;
pub mod preloader;
pub mod repository;
pub mod sender;
pub mod sink;
pub mod slot_token;
pub mod task_manager;
pub mod waiting_stage;

pub use engine::Engine;
pub use error::{EngineError, RepoError, TmError};
pub use instance::InstanceId;
pub use models::{Collection, Task};
