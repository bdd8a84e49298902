//! Individual shell session
//!
//! Runs commands one at a time through the configured interpreter, waits up
//! to the wait budget for each, and keeps a rolling history. A command that
//! outlives the budget stays attached as the shell's active run until its
//! output has been drained.

use std::io::Write;
use std::time::Duration;

use chrono::Local;
use crossterm::{cursor, queue};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{render_history, CommandRecord, Describe, DisplayLimits};
use crate::config::ShellConfig;
use crate::process::{Interpreter, OutputEvent, ProcessRun};

/// Appended to the output of a command that outlived the wait budget
pub const STILL_RUNNING_SUFFIX: &str = "\nCommand is still running...";

/// Returned by `current_output` when nothing arrived since the last drain
pub const NO_NEW_OUTPUT: &str = "No new output.";

/// Returned by `current_output` once the active run has ended
pub const COMMAND_FINISHED: &str = "Command has finished.";

/// Returned when there is no active run to inspect or stop
pub const NO_ACTIVE_COMMAND: &str = "No command is running.";

/// Appended to the output of a command stopped by `kill_command`
pub const COMMAND_TERMINATED: &str = "Command was terminated.";

/// One OS-level execution context with history
pub struct Shell {
    /// Unique identifier for this shell
    id: Uuid,
    /// How commands are spawned
    interpreter: Interpreter,
    /// How long `run_command` waits before returning partial output
    wait_budget: Duration,
    /// Rendering limits for `describe`
    limits: DisplayLimits,
    /// Executed commands, oldest first
    history: Vec<CommandRecord>,
    /// Command still running or not yet drained
    active: Option<ProcessRun>,
}

impl Shell {
    /// Create a shell with default settings
    pub fn new() -> Self {
        Self::with_config(&ShellConfig::default())
    }

    /// Create a shell from explicit settings
    pub fn with_config(config: &ShellConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            interpreter: config.interpreter(),
            wait_budget: config.wait_budget(),
            limits: config.display_limits(),
            history: Vec::new(),
            active: None,
        }
    }

    /// Get the shell ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the wait budget
    #[cfg(test)]
    pub fn wait_budget(&self) -> Duration {
        self.wait_budget
    }

    /// Executed commands, oldest first
    #[cfg(test)]
    pub fn history(&self) -> &[CommandRecord] {
        &self.history
    }

    /// Whether a command is attached to this shell
    pub fn has_active_command(&self) -> bool {
        self.active.is_some()
    }

    /// Command line of the attached command, if any
    #[cfg(test)]
    pub fn active_command(&self) -> Option<&str> {
        self.active.as_ref().map(ProcessRun::command)
    }

    /// Run a command and return its output
    ///
    /// Returns the trimmed output when the command finishes within the wait
    /// budget, otherwise the output so far followed by
    /// [`STILL_RUNNING_SUFFIX`]. Spawn failures are returned as text.
    pub async fn run_command(&mut self, command: &str) -> String {
        if let Some(busy) = self.check_busy() {
            return busy;
        }

        let timestamp = Local::now();
        let deadline = Instant::now() + self.wait_budget;

        let mut run = match ProcessRun::spawn(&self.interpreter, command) {
            Ok(run) => run,
            Err(e) => {
                let message = e.to_string();
                warn!("Shell {} could not start `{}`: {}", self.id, command, message);
                self.history
                    .push(CommandRecord::new(timestamp, command, message.clone()));
                return message;
            }
        };

        let mut buffer = String::new();
        loop {
            match tokio::time::timeout_at(deadline, run.recv()).await {
                Ok(Some(OutputEvent::Output(chunk))) => buffer.push_str(&chunk.data),
                Ok(Some(OutputEvent::End { exit_code })) => {
                    debug!("Shell {} `{}` exited with code {:?}", self.id, command, exit_code);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    info!(
                        "Shell {} `{}` still running after {:?}",
                        self.id, command, self.wait_budget
                    );
                    buffer.push_str(STILL_RUNNING_SUFFIX);
                    self.history
                        .push(CommandRecord::new(timestamp, command, buffer.clone()));
                    self.active = Some(run);
                    return buffer;
                }
            }
        }

        let output = buffer.trim().to_string();
        self.history
            .push(CommandRecord::new(timestamp, command, output.clone()));
        output
    }

    /// Drain output produced since the last call
    ///
    /// Releases the active run once its end marker has been reached.
    pub fn current_output(&mut self) -> String {
        let Some(run) = self.active.as_mut() else {
            return NO_ACTIVE_COMMAND.to_string();
        };

        let mut output = String::new();
        let mut finished = false;
        while let Some(event) = run.try_recv() {
            match event {
                OutputEvent::Output(chunk) => output.push_str(&chunk.data),
                OutputEvent::End { exit_code } => {
                    debug!("Shell {} `{}` finished with {:?}", self.id, run.command(), exit_code);
                    finished = true;
                }
            }
        }

        if finished {
            self.active = None;
            let output = output.trim_end();
            if output.is_empty() {
                COMMAND_FINISHED.to_string()
            } else {
                format!("{}\n{}", output, COMMAND_FINISHED)
            }
        } else if output.is_empty() {
            NO_NEW_OUTPUT.to_string()
        } else {
            output
        }
    }

    /// Terminate the active command and return its remaining output
    pub async fn kill_command(&mut self) -> String {
        let Some(mut run) = self.active.take() else {
            return NO_ACTIVE_COMMAND.to_string();
        };

        run.kill();

        let mut output = String::new();
        let deadline = Instant::now() + self.wait_budget;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, run.recv()).await {
            if let OutputEvent::Output(chunk) = event {
                output.push_str(&chunk.data);
            }
        }
        if !run.is_finished() {
            warn!("Shell {} run {} did not confirm termination", self.id, run.id());
        }

        let output = output.trim_end();
        if output.is_empty() {
            COMMAND_TERMINATED.to_string()
        } else {
            format!("{}\n{}", output, COMMAND_TERMINATED)
        }
    }

    /// Signal the active command to stop without waiting for it
    pub fn terminate(&mut self) {
        if let Some(run) = self.active.take() {
            run.kill();
        }
    }

    /// Move the cursor of this program's terminal up one line
    ///
    /// Writes to stderr; stdout may be carrying protocol frames.
    pub fn scroll_up(&self) {
        let mut term = std::io::stderr();
        let _ = queue!(term, cursor::MoveUp(1)).and_then(|_| term.flush());
    }

    /// Move the cursor of this program's terminal down one line
    pub fn scroll_down(&self) {
        let mut term = std::io::stderr();
        let _ = queue!(term, cursor::MoveDown(1)).and_then(|_| term.flush());
    }

    /// Single active run: refuse while the previous command is still running,
    /// release it silently once it has exited.
    fn check_busy(&mut self) -> Option<String> {
        let run = self.active.as_ref()?;
        if run.has_exited() {
            debug!(
                "Shell {} releasing finished run {} before next command",
                self.id,
                run.id()
            );
            self.active = None;
            return None;
        }

        Some(format!(
            "Command `{}` is still running in this shell. Use get_current_output to follow it, \
             kill_command to stop it, or run the new command in another shell.",
            run.command()
        ))
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

impl Describe for Shell {
    fn describe(&self) -> String {
        render_history(&self.history, self.limits)
    }
}
