//! Shell settings
//!
//! Loads settings from `.shellmux/config.toml` (or an explicit path).
//! A missing file yields the defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::Interpreter;
use crate::shell::DisplayLimits;

/// Configuration directory and file names
pub const CONFIG_DIR: &str = ".shellmux";
pub const CONFIG_FILE: &str = "config.toml";

/// Default time `run_command` waits before returning partial output
pub const DEFAULT_WAIT_BUDGET_MS: u64 = 5_000;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings applied to every shell created by the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Interpreter program
    pub interpreter: String,
    /// Arguments placed before the command line
    pub interpreter_args: Vec<String>,
    /// Working directory for commands
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Wait budget in milliseconds
    pub wait_budget_ms: u64,
    /// Number of history records shown when rendering a shell
    pub history_display_limit: usize,
    /// Characters of output shown per rendered record
    pub output_display_limit: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        let limits = DisplayLimits::default();
        let interpreter = Interpreter::default();
        Self {
            interpreter: interpreter.program,
            interpreter_args: interpreter.args,
            working_dir: None,
            env: HashMap::new(),
            wait_budget_ms: DEFAULT_WAIT_BUDGET_MS,
            history_display_limit: limits.max_records,
            output_display_limit: limits.max_output_chars,
        }
    }
}

impl ShellConfig {
    /// Check values that would make shells unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid("interpreter cannot be empty".to_string()));
        }
        if self.wait_budget_ms == 0 {
            return Err(ConfigError::Invalid(
                "wait_budget_ms must be greater than zero".to_string(),
            ));
        }
        if self.history_display_limit == 0 || self.output_display_limit == 0 {
            return Err(ConfigError::Invalid(
                "display limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Interpreter used to spawn commands
    pub fn interpreter(&self) -> Interpreter {
        Interpreter {
            program: self.interpreter.clone(),
            args: self.interpreter_args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
        }
    }

    /// How long `run_command` waits for completion
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }

    /// Rendering limits for shell history
    pub fn display_limits(&self) -> DisplayLimits {
        DisplayLimits {
            max_records: self.history_display_limit,
            max_output_chars: self.output_display_limit,
        }
    }
}

/// Root configuration file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Shell settings
    #[serde(default)]
    pub shell: ShellConfig,
}

impl Settings {
    /// Load settings from `<dir>/.shellmux/config.toml`
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        Self::load_file(&dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load settings from an explicit file, defaulting when it does not exist
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.shell.validate()?;
        Ok(settings)
    }
}
