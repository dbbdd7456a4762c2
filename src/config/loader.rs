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

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use super::error::ConfigError;
use super::types::EngineConfig;

/// Locates and parses [`EngineConfig`] from a search path, applying
/// `${VAR}` / `${VAR:-default}` / `${VAR:?msg}` substitution before
/// parsing, matching the teacher's config loader.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("./trigger-engine.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("trigger-engine").join("config.toml"));
        }

        search_paths.push(PathBuf::from("/etc/trigger-engine/config.toml"));

        Self { search_paths }
    }

    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Loads configuration from an explicit path, the `TRIGGER_ENGINE_CONFIG`
    /// environment variable, or the first existing search-path entry, in
    /// that order of precedence.
    pub fn load(&self, config_file: Option<&Path>) -> Result<EngineConfig, ConfigError> {
        let config_path = if let Some(path) = config_file {
            path.to_path_buf()
        } else if let Ok(env_config) = env::var("TRIGGER_ENGINE_CONFIG") {
            PathBuf::from(env_config)
        } else {
            self.find_config_file().ok_or(ConfigError::NotFound)?
        };

        self.load_from_file(&config_path)
    }

    /// Loads configuration from a specific file, or falls back to defaults
    /// if no search path resolves and none was given explicitly.
    pub fn load_or_default(&self, config_file: Option<&Path>) -> Result<EngineConfig, ConfigError> {
        match self.load(config_file) {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound) if config_file.is_none() => {
                let config = EngineConfig::default();
                config.validate()?;
                Ok(config)
            }
            Err(err) => Err(err),
        }
    }

    pub fn load_from_file(&self, path: &Path) -> Result<EngineConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let substituted = self.substitute_env_vars(&content)?;
        let config: EngineConfig = toml::from_str(&substituted)?;
        config.validate()?;
        Ok(config)
    }

    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .find(|path| path.exists() && path.is_file())
            .cloned()
    }

    fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
        let re = Regex::new(r"\$\{([^}]+)\}").unwrap();
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_expr = &cap[1];
            let replacement = self.process_var_expression(var_expr)?;
            result = result.replace(full_match, &replacement);
        }

        Ok(result)
    }

    fn process_var_expression(&self, expr: &str) -> Result<String, ConfigError> {
        if let Some(pos) = expr.find(":-") {
            let var_name = &expr[..pos];
            let default_value = &expr[pos + 2..];
            Ok(env::var(var_name).unwrap_or_else(|_| default_value.to_string()))
        } else if let Some(pos) = expr.find(":?") {
            let var_name = &expr[..pos];
            let error_msg = &expr[pos + 2..];
            env::var(var_name).map_err(|_| {
                ConfigError::EnvSubstitutionError(format!(
                    "required environment variable '{}' is not set: {}",
                    var_name, error_msg
                ))
            })
        } else {
            env::var(expr).map_err(|_| {
                ConfigError::EnvSubstitutionError(format!(
                    "required environment variable '{}' is not set",
                    expr
                ))
            })
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_substitution_with_default() {
        let loader = ConfigLoader::new();
        env::remove_var("TRIGGER_ENGINE_TEST_VAR");

        let content = "url = \"${TRIGGER_ENGINE_TEST_VAR:-sqlite://fallback.db}\"";
        let result = loader.substitute_env_vars(content).unwrap();
        assert_eq!(result, "url = \"sqlite://fallback.db\"");
    }

    #[test]
    fn env_substitution_with_existing_var() {
        let loader = ConfigLoader::new();
        env::set_var("TRIGGER_ENGINE_TEST_VAR2", "custom_value");

        let content = "url = \"${TRIGGER_ENGINE_TEST_VAR2:-fallback}\"";
        let result = loader.substitute_env_vars(content).unwrap();
        assert_eq!(result, "url = \"custom_value\"");

        env::remove_var("TRIGGER_ENGINE_TEST_VAR2");
    }

    #[test]
    fn env_substitution_required_var_missing_errors() {
        let loader = ConfigLoader::new();
        env::remove_var("TRIGGER_ENGINE_REQUIRED_VAR");

        let content = "url = \"${TRIGGER_ENGINE_REQUIRED_VAR}\"";
        assert!(loader.substitute_env_vars(content).is_err());
    }

    #[test]
    fn load_or_default_falls_back_without_search_hit() {
        let loader = ConfigLoader::with_search_paths(vec![PathBuf::from(
            "/nonexistent/trigger-engine.toml",
        )]);
        let config = loader.load_or_default(None).unwrap();
        assert_eq!(config.repository.max_count_tasks_in_collection, 1000);
    }

    #[test]
    fn load_from_file_rejects_invalid_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        let mut config = EngineConfig::default();
        config.pipeline.manager_max_retries = 100;
        fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loader = ConfigLoader::new();
        let err = loader.load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
