//! Shell registry
//!
//! Maintains the set of named shells and broadcasts lifecycle events.
//! Names are unique; each shell sits behind its own async mutex so commands
//! in different shells run concurrently while one shell serializes its callers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::{Describe, Shell, STILL_RUNNING_SUFFIX};
use crate::config::ShellConfig;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Shell {0} already exists")]
    DuplicateName(String),

    #[error("Shell {0} does not exist")]
    NotFound(String),

    #[error("Invalid shell name: {0}")]
    InvalidName(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// A shell shared between the registry and its callers
pub type SharedShell = Arc<Mutex<Shell>>;

/// Maximum shell name length
pub const MAX_SHELL_NAME_LENGTH: usize = 256;

/// Event types broadcast by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// A shell was registered
    ShellCreated { name: String },
    /// A shell was removed
    ShellClosed { name: String },
    /// A command was submitted to a shell
    CommandStarted { shell: String, command: String },
    /// `run_command` returned, possibly leaving the command running
    CommandReturned { shell: String, still_running: bool },
}

/// Named collection of shells
pub struct Terminal {
    /// Settings for newly created shells
    config: ShellConfig,
    /// Registered shells by name
    shells: RwLock<HashMap<String, SharedShell>>,
    /// Channel for broadcasting registry events to subscribers
    event_tx: broadcast::Sender<TerminalEvent>,
}

impl Terminal {
    /// Create an empty registry with default shell settings
    pub fn new() -> Self {
        Self::with_config(ShellConfig::default())
    }

    /// Create an empty registry whose shells use `config`
    pub fn with_config(config: ShellConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            shells: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.event_tx.subscribe()
    }

    /// Settings applied to new shells
    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Number of registered shells
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shells.read().len()
    }

    /// Whether no shells are registered
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.shells.read().is_empty()
    }

    /// Check if a shell name is registered
    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.shells.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shells.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create and register a shell, returning its name
    ///
    /// Without a name, the shell's UUID is used.
    pub fn create_shell(&self, name: Option<&str>) -> RegistryResult<String> {
        let shell = Shell::with_config(&self.config);
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => shell.id().to_string(),
        };

        let shell = Arc::new(Mutex::new(shell));
        {
            let mut shells = self.shells.write();
            if shells.contains_key(&name) {
                return Err(RegistryError::DuplicateName(name));
            }
            shells.insert(name.clone(), shell);
        }

        info!("Shell {} created", name);
        let _ = self.event_tx.send(TerminalEvent::ShellCreated { name: name.clone() });

        Ok(name)
    }

    /// Look up a shell by name
    pub fn get(&self, name: &str) -> RegistryResult<SharedShell> {
        self.shells
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Remove a shell and terminate any command still running in it
    pub fn close_shell(&self, name: &str) -> RegistryResult<()> {
        let shell = self
            .shells
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        match shell.try_lock() {
            Ok(mut shell) => shell.terminate(),
            // Busy in run_command; the run is killed when the last handle drops
            Err(_) => debug!("Shell {} busy while closing, deferring termination", name),
        }

        info!("Shell {} closed", name);
        let _ = self.event_tx.send(TerminalEvent::ShellClosed {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Run a command in a registered shell
    pub async fn run_command(&self, name: &str, command: &str) -> RegistryResult<String> {
        let shell = self.get(name)?;

        let _ = self.event_tx.send(TerminalEvent::CommandStarted {
            shell: name.to_string(),
            command: command.to_string(),
        });

        let (output, still_running) = {
            let mut shell = shell.lock().await;
            let output = shell.run_command(command).await;
            let still_running = shell.has_active_command() && output.ends_with(STILL_RUNNING_SUFFIX);
            (output, still_running)
        };

        let _ = self.event_tx.send(TerminalEvent::CommandReturned {
            shell: name.to_string(),
            still_running,
        });
        Ok(output)
    }

    /// Drain new output from a shell's active command
    pub async fn current_output(&self, name: &str) -> RegistryResult<String> {
        let shell = self.get(name)?;
        let output = shell.lock().await.current_output();
        Ok(output)
    }

    /// Terminate a shell's active command
    pub async fn kill_command(&self, name: &str) -> RegistryResult<String> {
        let shell = self.get(name)?;
        let output = shell.lock().await.kill_command().await;
        Ok(output)
    }

    /// Render a shell's history
    pub async fn describe_shell(&self, name: &str) -> RegistryResult<String> {
        let shell = self.get(name)?;
        let view = shell.lock().await.describe();
        Ok(view)
    }

    /// Scroll the controlling terminal up one line
    pub async fn scroll_up(&self, name: &str) -> RegistryResult<()> {
        let shell = self.get(name)?;
        shell.lock().await.scroll_up();
        Ok(())
    }

    /// Scroll the controlling terminal down one line
    pub async fn scroll_down(&self, name: &str) -> RegistryResult<()> {
        let shell = self.get(name)?;
        shell.lock().await.scroll_down();
        Ok(())
    }

    /// Close every shell
    ///
    /// Used during server shutdown.
    pub fn shutdown_all(&self) {
        let names = self.names();
        info!("Closing {} shell(s)", names.len());
        for name in names {
            if let Err(e) = self.close_shell(&name) {
                warn!("Error closing shell {} during shutdown: {}", name, e);
            }
        }
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Describe for Terminal {
    fn describe(&self) -> String {
        let mut lines = vec!["Shells:".to_string()];
        lines.extend(self.names().into_iter().map(|name| format!("- {name}")));
        lines.join("\n")
    }
}

/// Reject names that cannot be displayed on one line
pub fn validate_name(name: &str) -> RegistryResult<()> {
    if name.is_empty() {
        return Err(RegistryError::InvalidName("name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_SHELL_NAME_LENGTH {
        return Err(RegistryError::InvalidName(format!(
            "name exceeds maximum length of {} characters",
            MAX_SHELL_NAME_LENGTH
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(RegistryError::InvalidName(
            "name cannot contain control characters".to_string(),
        ));
    }
    Ok(())
}
