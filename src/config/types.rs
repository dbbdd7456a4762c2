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

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Top-level configuration surface, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub repository: RepositoryConfig,
    pub preloader: PreloaderConfig,
    pub pipeline: PipelineConfig,
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Database endpoint. Either a single DSN `url`, or the split
/// `user`/`password`/`host`/`db_name` form named in the core spec; when
/// both are present `url` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    pub pool_size: u32,
}

impl DatabaseConfig {
    /// Resolves the configured fields into a connection string, preferring
    /// an explicit `url` over the split fields.
    pub fn resolve_url(&self) -> Result<String, ValidationError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| ValidationError::InvalidDatabaseUrl {
                url: "<missing host>".to_string(),
            })?;
        let db_name = self.db_name.as_deref().unwrap_or("");
        let auth = match (&self.user, &self.password) {
            (Some(u), Some(p)) => format!("{}:{}@", u, p),
            (Some(u), None) => format!("{}@", u),
            _ => String::new(),
        };
        Ok(format!("postgres://{}{}/{}", auth, host, db_name))
    }
}

/// Sharding and retry knobs for the storage layer (§4.1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub max_count_tasks_in_collection: u32,
    pub max_retries_on_deadlock: u32,
}

/// Preloader cadence (§4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreloaderConfig {
    pub preload_horizon_secs: u64,
    pub preloaded_channel_capacity: usize,
}

/// Engine-wide pipeline sizing: ready-channel capacity, sender batching,
/// and the storage worker pool bound (§5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ready_channel_capacity: usize,
    pub sender_batch_size: usize,
    pub sender_batch_window_ms: u64,
    pub storage_workers: usize,
    pub manager_max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Explicit instance id; when absent one is generated at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl EngineConfig {
    /// Validates cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.repository.max_count_tasks_in_collection == 0 {
            return Err(ValidationError::InvalidMaxCollectionSize(
                self.repository.max_count_tasks_in_collection,
            ));
        }
        if self.preloader.preload_horizon_secs == 0 {
            return Err(ValidationError::InvalidHorizon(
                self.preloader.preload_horizon_secs,
            ));
        }
        if self.pipeline.manager_max_retries > self.repository.max_retries_on_deadlock {
            return Err(ValidationError::RetryBudgetMismatch {
                manager: self.pipeline.manager_max_retries,
                repo: self.repository.max_retries_on_deadlock,
            });
        }
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(ValidationError::InvalidLogLevel(other.to_string())),
        }
        Ok(())
    }
}
