//! Tool dispatch
//!
//! Turns client messages into registry operations and registry results into
//! server messages. Shared by the WebSocket and stdio transports.

use std::sync::Arc;

use tracing::debug;

use super::protocol::{ClientEnvelope, ClientMessage, ErrorCode, ServerMessage, ToolCall};
use super::tool_catalog;
use crate::shell::{Describe, RegistryError, Terminal};

/// Dispatches client messages against one shell registry
#[derive(Clone)]
pub struct ConnectionHandler {
    terminal: Arc<Terminal>,
}

impl ConnectionHandler {
    /// Create a handler for `terminal`
    pub fn new(terminal: Arc<Terminal>) -> Self {
        Self { terminal }
    }

    /// The registry this handler operates on
    pub fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    /// Parse, validate and answer one raw JSON message
    pub async fn handle_text(&self, text: &str) -> ServerMessage {
        match ClientEnvelope::from_json(text) {
            Ok(envelope) => self.handle(envelope.message).await,
            Err(e) => {
                debug!("Rejected message: {}", e);
                e.into()
            }
        }
    }

    /// Answer one validated message
    pub async fn handle(&self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Ping { seq } => {
                debug!("Received ping with seq {}", seq);
                ServerMessage::Pong { seq }
            }
            ClientMessage::ListTools => ServerMessage::ToolList {
                tools: tool_catalog(self.terminal.config()),
            },
            ClientMessage::CallTool { call_id, call } => {
                let tool = call.name();
                debug!("Tool call {} (id {:?})", tool, call_id);
                match self.call(call).await {
                    Ok(output) => ServerMessage::tool_result(call_id, tool, output),
                    Err(e) => ServerMessage::call_error(call_id, e.to_string(), error_code(&e)),
                }
            }
        }
    }

    /// Execute one tool call
    pub async fn call(&self, call: ToolCall) -> Result<String, RegistryError> {
        let terminal = &self.terminal;
        match call {
            ToolCall::CreateShell { name } => terminal.create_shell(name.as_deref()),
            ToolCall::CloseShell { name } => {
                terminal.close_shell(&name)?;
                Ok(format!("Shell {} closed", name))
            }
            ToolCall::ListShells {} => Ok(terminal.describe()),
            ToolCall::RunCommand { shell, command } => terminal.run_command(&shell, &command).await,
            ToolCall::GetCurrentOutput { shell } => terminal.current_output(&shell).await,
            ToolCall::KillCommand { shell } => terminal.kill_command(&shell).await,
            ToolCall::DescribeShell { shell } => terminal.describe_shell(&shell).await,
            ToolCall::ScrollUp { shell } => {
                terminal.scroll_up(&shell).await?;
                Ok(String::new())
            }
            ToolCall::ScrollDown { shell } => {
                terminal.scroll_down(&shell).await?;
                Ok(String::new())
            }
        }
    }
}

fn error_code(err: &RegistryError) -> ErrorCode {
    match err {
        RegistryError::DuplicateName(_) => ErrorCode::DuplicateShell,
        RegistryError::NotFound(_) => ErrorCode::ShellNotFound,
        RegistryError::InvalidName(_) => ErrorCode::InvalidArguments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;

    fn handler() -> ConnectionHandler {
        ConnectionHandler::new(Arc::new(Terminal::with_config(ShellConfig {
            wait_budget_ms: 300,
            ..ShellConfig::default()
        })))
    }

    fn call_json(tool: &str, arguments: serde_json::Value) -> String {
        serde_json::json!({
            "type": "call_tool",
            "call_id": "t",
            "call": { "tool": tool, "arguments": arguments }
        })
        .to_string()
    }

    fn output_of(message: ServerMessage) -> String {
        match message {
            ServerMessage::ToolResult { output, .. } => output,
            other => panic!("Expected ToolResult, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_ping() {
        let response = handler().handle_text(r#"{"type": "ping", "seq": 42}"#).await;
        assert_eq!(response, ServerMessage::Pong { seq: 42 });
    }

    #[tokio::test]
    async fn test_list_tools() {
        match handler().handle(ClientMessage::ListTools).await {
            ServerMessage::ToolList { tools } => assert!(!tools.is_empty()),
            other => panic!("Expected ToolList, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_list_uses_registry_config() {
        match handler().handle(ClientMessage::ListTools).await {
            ServerMessage::ToolList { tools } => {
                let run = tools.iter().find(|tool| tool.name == "run_command").unwrap();
                assert!(run.description.contains("Waits up to 300 ms."));
            }
            other => panic!("Expected ToolList, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_shell_without_arguments() {
        let handler = handler();
        let response = handler
            .handle_text(r#"{"type": "call_tool", "call": {"tool": "create_shell"}}"#)
            .await;
        let name = output_of(response);
        assert!(uuid::Uuid::parse_str(&name).is_ok());
        assert!(handler.terminal().contains(&name));
    }

    #[tokio::test]
    async fn test_create_run_describe_close() {
        let handler = handler();

        let created = handler
            .handle_text(&call_json("create_shell", serde_json::json!({"name": "dev"})))
            .await;
        assert_eq!(output_of(created), "dev");

        let ran = handler
            .handle_text(&call_json(
                "run_command",
                serde_json::json!({"shell": "dev", "command": "echo hello"}),
            ))
            .await;
        assert_eq!(
            ran,
            ServerMessage::tool_result(Some("t".to_string()), "run_command", "hello")
        );

        let listed = handler.handle(ClientMessage::call(ToolCall::ListShells {})).await;
        assert_eq!(output_of(listed), "Shells:\n- dev");

        let described = handler
            .handle_text(&call_json("describe_shell", serde_json::json!({"shell": "dev"})))
            .await;
        assert!(output_of(described).contains("$ echo hello\nhello"));

        let closed = handler
            .handle_text(&call_json("close_shell", serde_json::json!({"name": "dev"})))
            .await;
        assert_eq!(output_of(closed), "Shell dev closed");
        assert!(handler.terminal().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_shell_error_code() {
        let handler = handler();
        handler
            .call(ToolCall::CreateShell { name: Some("x".to_string()) })
            .await
            .unwrap();

        let response = handler
            .handle_text(&call_json("create_shell", serde_json::json!({"name": "x"})))
            .await;
        match response {
            ServerMessage::Error { code, call_id, .. } => {
                assert_eq!(code, Some(ErrorCode::DuplicateShell));
                assert_eq!(call_id.as_deref(), Some("t"));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(handler.terminal().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_shell_error_code() {
        let response = handler()
            .handle_text(&call_json("get_current_output", serde_json::json!({"shell": "ghost"})))
            .await;
        match response {
            ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::ShellNotFound)),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_json() {
        match handler().handle_text("not json").await {
            ServerMessage::Error { code, .. } => assert_eq!(code, Some(ErrorCode::InvalidMessage)),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_long_running_flow() {
        let handler = handler();
        handler
            .call(ToolCall::CreateShell { name: Some("srv".to_string()) })
            .await
            .unwrap();

        let first = handler
            .call(ToolCall::RunCommand {
                shell: "srv".to_string(),
                command: "sleep 10 && echo done".to_string(),
            })
            .await
            .unwrap();
        assert!(first.ends_with("Command is still running..."));
        assert!(!first.contains("done"));

        let polled = handler
            .call(ToolCall::GetCurrentOutput { shell: "srv".to_string() })
            .await
            .unwrap();
        assert_eq!(polled, "No new output.");

        let killed = handler
            .call(ToolCall::KillCommand { shell: "srv".to_string() })
            .await
            .unwrap();
        assert!(killed.ends_with("Command was terminated."));
    }
}
