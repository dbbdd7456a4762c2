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

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found in any search location")]
    NotFound,

    #[error("failed to read configuration file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("environment variable substitution failed: {0}")]
    EnvSubstitutionError(String),

    #[error("configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("invalid database url: {url}")]
    InvalidDatabaseUrl { url: String },

    #[error("max_count_tasks_in_collection must be >= 1, got {0}")]
    InvalidMaxCollectionSize(u32),

    #[error("preload_horizon_secs must be >= 1, got {0}")]
    InvalidHorizon(u64),

    #[error("manager_max_retries must be <= repo_max_retries ({repo}), got manager={manager}")]
    RetryBudgetMismatch { manager: u32, repo: u32 },

    #[error("invalid log level: {0} (must be one of: error, warn, info, debug, trace)")]
    InvalidLogLevel(String),
}
