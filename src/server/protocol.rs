//! Protocol message definitions
//!
//! Defines the JSON messages exchanged between tool clients (a conversation
//! engine, a test harness) and the shell server. Messages are tagged by
//! `type`; tool calls carry a nested `call` tagged by `tool`.

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::ToolSpec;
use crate::shell::{validate_name, TerminalEvent};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum command length (64KB)
pub const MAX_COMMAND_LENGTH: usize = 64 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope and its contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        self.message.validate()
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Request the tool catalog
    ListTools,

    /// Invoke one tool
    CallTool {
        /// Client correlation id, echoed in the result
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        /// The tool and its arguments
        #[serde(deserialize_with = "deserialize_call")]
        call: ToolCall,
    },
}

/// A tool invocation with typed arguments
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    /// Create a shell, optionally named
    CreateShell {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Close a shell by name
    CloseShell { name: String },
    /// List shell names
    ListShells {},
    /// Run a command in a shell
    RunCommand { shell: String, command: String },
    /// Drain new output of a still-running command
    GetCurrentOutput { shell: String },
    /// Terminate a still-running command
    KillCommand { shell: String },
    /// Render a shell's command history
    DescribeShell { shell: String },
    /// Move the terminal cursor up one line
    ScrollUp { shell: String },
    /// Move the terminal cursor down one line
    ScrollDown { shell: String },
}

impl ToolCall {
    /// Tool name as listed in the catalog
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::CreateShell { .. } => "create_shell",
            ToolCall::CloseShell { .. } => "close_shell",
            ToolCall::ListShells {} => "list_shells",
            ToolCall::RunCommand { .. } => "run_command",
            ToolCall::GetCurrentOutput { .. } => "get_current_output",
            ToolCall::KillCommand { .. } => "kill_command",
            ToolCall::DescribeShell { .. } => "describe_shell",
            ToolCall::ScrollUp { .. } => "scroll_up",
            ToolCall::ScrollDown { .. } => "scroll_down",
        }
    }

    /// Validate argument contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ToolCall::CreateShell { name: Some(name) } => check_name(name),
            ToolCall::CreateShell { name: None } | ToolCall::ListShells {} => Ok(()),
            ToolCall::CloseShell { name } => check_name(name),
            ToolCall::RunCommand { shell, command } => {
                check_name(shell)?;
                if command.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "command cannot be empty".to_string(),
                    ));
                }
                if command.len() > MAX_COMMAND_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "command exceeds maximum length of {} bytes",
                        MAX_COMMAND_LENGTH
                    )));
                }
                Ok(())
            }
            ToolCall::GetCurrentOutput { shell }
            | ToolCall::KillCommand { shell }
            | ToolCall::DescribeShell { shell }
            | ToolCall::ScrollUp { shell }
            | ToolCall::ScrollDown { shell } => check_name(shell),
        }
    }
}

/// Read a tool call, treating a missing `arguments` object as empty
fn deserialize_call<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ToolCall, D::Error> {
    let mut value = serde_json::Value::deserialize(deserializer)?;
    if let Some(call) = value.as_object_mut() {
        call.entry("arguments")
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
    ToolCall::deserialize(value).map_err(D::Error::custom)
}

fn check_name(name: &str) -> ProtocolResult<()> {
    validate_name(name).map_err(|e| ProtocolError::ValidationError(e.to_string()))
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. } | ClientMessage::ListTools => Ok(()),
            ClientMessage::CallTool { call, .. } => call.validate(),
        }
    }

    /// Create a Ping message
    #[cfg(test)]
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create a CallTool message without a correlation id
    #[cfg(test)]
    pub fn call(call: ToolCall) -> Self {
        ClientMessage::CallTool {
            call_id: None,
            call,
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Server identifier/name
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Tool catalog
    ToolList { tools: Vec<ToolSpec> },

    /// Text result of a tool call
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        /// Tool that produced the result
        tool: String,
        /// Text for display
        output: String,
    },

    /// A shell was created
    ShellCreated { name: String },

    /// A shell was closed
    ShellClosed { name: String },

    /// A command was submitted to a shell
    CommandStarted { shell: String, command: String },

    /// A `run_command` call returned
    CommandReturned { shell: String, still_running: bool },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Correlation id of the failed call
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Arguments failed validation
    InvalidArguments,
    /// Shell name not registered
    ShellNotFound,
    /// Shell name already registered
    DuplicateShell,
    /// Authentication required
    AuthRequired,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: None,
        }
    }

    /// Create a Welcome message with server ID
    pub fn welcome_with_id(server_id: impl Into<String>) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: Some(server_id.into()),
        }
    }

    /// Create a ToolResult message
    pub fn tool_result(
        call_id: Option<String>,
        tool: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        ServerMessage::ToolResult {
            call_id,
            tool: tool.into(),
            output: output.into(),
        }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            call_id: None,
        }
    }

    /// Create an Error message tied to a tool call
    pub fn call_error(call_id: Option<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            call_id,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidArguments,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

impl From<TerminalEvent> for ServerMessage {
    fn from(event: TerminalEvent) -> Self {
        match event {
            TerminalEvent::ShellCreated { name } => ServerMessage::ShellCreated { name },
            TerminalEvent::ShellClosed { name } => ServerMessage::ShellClosed { name },
            TerminalEvent::CommandStarted { shell, command } => {
                ServerMessage::CommandStarted { shell, command }
            }
            TerminalEvent::CommandReturned {
                shell,
                still_running,
            } => ServerMessage::CommandReturned {
                shell,
                still_running,
            },
        }
    }
}
