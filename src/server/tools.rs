//! Tool catalog
//!
//! Names, descriptions and parameter schemas a conversation engine uses to
//! pick and invoke shell tools.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ShellConfig;

/// Description of one callable tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    /// Tool name, matching the `tool` tag of a call
    pub name: String,
    /// What the tool does and what it returns
    pub description: String,
    /// JSON schema of the `arguments` object
    pub parameters: Value,
}

impl ToolSpec {
    fn new(name: &str, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
            parameters,
        }
    }
}

/// Human-readable wait budget, e.g. "5 seconds" or "300 ms"
fn budget_text(wait_budget_ms: u64) -> String {
    match (wait_budget_ms / 1000, wait_budget_ms % 1000) {
        (1, 0) => "1 second".to_string(),
        (secs, 0) => format!("{} seconds", secs),
        _ => format!("{} ms", wait_budget_ms),
    }
}

fn shell_param(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "shell": { "type": "string", "description": description }
        },
        "required": ["shell"]
    })
}

/// All tools served by this process, described for shells built from `config`
pub fn tool_catalog(config: &ShellConfig) -> Vec<ToolSpec> {
    let budget = budget_text(config.wait_budget_ms);
    vec![
        ToolSpec::new(
            "create_shell",
            "Create a new shell session. Without a name, a unique id is used as the name. \
             Returns the session name. Fails if the name is already taken.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Unique session name" }
                }
            }),
        ),
        ToolSpec::new(
            "close_shell",
            "Close a shell session by name and stop any command still running in it. \
             Fails if no session has that name.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Session to close" }
                },
                "required": ["name"]
            }),
        ),
        ToolSpec::new(
            "list_shells",
            "List the names of all open shell sessions, one per line.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolSpec::new(
            "run_command",
            format!(
                "Run a command line through `{} {}` in a shell session (pipes, redirects and && work). \
                 Waits up to {}. Returns the combined stdout/stderr, trimmed. If the command is \
                 still going after {}, returns the output so far followed by \
                 \"Command is still running...\" and the command keeps running; use get_current_output \
                 to follow it. A session runs one command at a time.",
                config.interpreter,
                config.interpreter_args.join(" "),
                budget,
                budget
            ),
            json!({
                "type": "object",
                "properties": {
                    "shell": { "type": "string", "description": "Session name" },
                    "command": { "type": "string", "description": "Command line to execute" }
                },
                "required": ["shell", "command"]
            }),
        ),
        ToolSpec::new(
            "get_current_output",
            "Return output produced by a still-running command since the last check. \
             Returns \"No new output.\" when nothing arrived, and ends with \
             \"Command has finished.\" once the command is done.",
            shell_param("Session name"),
        ),
        ToolSpec::new(
            "kill_command",
            "Stop the command still running in a shell session. Returns its last output \
             followed by \"Command was terminated.\"",
            shell_param("Session name"),
        ),
        ToolSpec::new(
            "describe_shell",
            format!(
                "Show a session's last {} commands with their outputs (each cut to {} characters).",
                config.history_display_limit, config.output_display_limit
            ),
            shell_param("Session name"),
        ),
        ToolSpec::new(
            "scroll_up",
            "Move the terminal cursor up one line.",
            shell_param("Session name"),
        ),
        ToolSpec::new(
            "scroll_down",
            "Move the terminal cursor down one line.",
            shell_param("Session name"),
        ),
    ]
}
