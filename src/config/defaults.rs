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

use super::types::*;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            repository: RepositoryConfig::default(),
            preloader: PreloaderConfig::default(),
            pipeline: PipelineConfig::default(),
            instance: InstanceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: Some("${TRIGGER_ENGINE_DATABASE_URL:-sqlite://trigger_engine.db}".to_string()),
            user: None,
            password: None,
            host: None,
            db_name: None,
            pool_size: 10,
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_count_tasks_in_collection: 1000,
            max_retries_on_deadlock: 10,
        }
    }
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            preload_horizon_secs: 5,
            preloaded_channel_capacity: 4096,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ready_channel_capacity: 4096,
            sender_batch_size: 50,
            sender_batch_window_ms: 100,
            storage_workers: 8,
            manager_max_retries: 3,
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self { id: None }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Renders the default configuration as a TOML document, used by
/// `trigger-engine-bench config init` to seed a starter file.
pub fn generate_default_config_toml() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&EngineConfig::default())
}
