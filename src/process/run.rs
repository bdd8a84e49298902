//! A single command execution
//!
//! [`ProcessRun`] is the consumer side of an [`OutputReader`]: it owns the
//! output queue and the termination signal for one spawned command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use super::{OutputEvent, OutputReader};

/// Errors that can occur while starting a process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Process {0} pipe unavailable")]
    PipeUnavailable(&'static str),
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// How command lines are handed to the system shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    /// Interpreter program, e.g. `sh`
    pub program: String,
    /// Arguments placed before the command line, e.g. `-c`
    pub args: Vec<String>,
    /// Working directory for spawned commands (inherits when unset)
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

impl Interpreter {
    /// Build the tokio command that runs `command_line` verbatim
    pub fn command(&self, command_line: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(command_line);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env);
        cmd
    }
}

/// Handle to a spawned command and its output queue
pub struct ProcessRun {
    /// Unique identifier
    id: Uuid,
    /// The command line as submitted
    command: String,
    /// OS process id, if still known at spawn time
    pid: Option<u32>,
    /// When the command was spawned
    started_at: Instant,
    /// Queue fed by the reader task
    output_rx: mpsc::UnboundedReceiver<OutputEvent>,
    /// Termination signal for the reader task
    kill_tx: broadcast::Sender<()>,
    /// Set by the reader right before it pushes the end marker
    exited: Arc<AtomicBool>,
    /// Set once the end marker has been received
    finished: bool,
    reader: JoinHandle<()>,
}

impl ProcessRun {
    /// Spawn `command` through `interpreter` and start draining its output
    pub fn spawn(interpreter: &Interpreter, command: &str) -> ProcessResult<Self> {
        let id = Uuid::new_v4();

        let mut cmd = interpreter.command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(format!("{}: {}", interpreter.program, e)))?;
        if child.stdout.is_none() {
            return Err(ProcessError::PipeUnavailable("stdout"));
        }
        if child.stderr.is_none() {
            return Err(ProcessError::PipeUnavailable("stderr"));
        }
        let pid = child.id();

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = broadcast::channel(1);
        let exited = Arc::new(AtomicBool::new(false));

        let reader = OutputReader::new(id, child, output_tx, kill_rx, Arc::clone(&exited)).spawn();

        info!("Run {} started (pid {:?}): {}", id, pid, command);

        Ok(Self {
            id,
            command: command.to_string(),
            pid,
            started_at: Instant::now(),
            output_rx,
            kill_tx,
            exited,
            finished: false,
            reader,
        })
    }

    /// Get the run ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the submitted command line
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Time since spawn
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the process has exited (its end marker may still be queued)
    pub fn has_exited(&self) -> bool {
        self.finished || self.exited.load(Ordering::SeqCst)
    }

    /// Whether the end marker has been consumed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next queue item
    ///
    /// Returns `None` once the end marker has been delivered.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        let event = match self.output_rx.recv().await {
            Some(event) => event,
            // Reader went away without an end marker (task aborted or panicked)
            None => OutputEvent::End { exit_code: None },
        };
        self.observe(event)
    }

    /// Take the next queue item without waiting
    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }
        match self.output_rx.try_recv() {
            Ok(event) => self.observe(event),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.observe(OutputEvent::End { exit_code: None })
            }
        }
    }

    fn observe(&mut self, event: OutputEvent) -> Option<OutputEvent> {
        if let OutputEvent::End { exit_code } = event {
            self.finished = true;
            debug!(
                "Run {} drained after {:?} (exit code {:?})",
                self.id,
                self.elapsed(),
                exit_code
            );
        }
        Some(event)
    }

    /// Ask the reader to terminate the process
    ///
    /// Output produced before termination and the end marker still arrive on
    /// the queue.
    pub fn kill(&self) {
        if !self.has_exited() {
            info!("Terminating run {} (pid {:?})", self.id, self.pid);
        }
        let _ = self.kill_tx.send(());
    }
}

impl Drop for ProcessRun {
    fn drop(&mut self) {
        // Signal termination; the reader keeps running until the child is reaped
        if !self.reader.is_finished() {
            let _ = self.kill_tx.send(());
        }
    }
}
