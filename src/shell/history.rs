//! Command history records and their text rendering

use chrono::{DateTime, Local};

/// Timestamp format used when rendering records
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Appended after an output that was cut for display
pub const CONTINUATION_MARKER: &str = "\n...\n";

/// Rendered when a shell has no history
pub const EMPTY_HISTORY: &str = "No commands executed yet";

/// One executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    timestamp: DateTime<Local>,
    command: String,
    output: String,
}

impl CommandRecord {
    /// Create a record
    pub fn new(
        timestamp: DateTime<Local>,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            command: command.into(),
            output: output.into(),
        }
    }

    /// The command line as submitted
    #[cfg(test)]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The full, untruncated output
    #[cfg(test)]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Render as `"<timestamp> $ <command>"` followed by the truncated output
    pub fn render(&self, max_output_chars: usize) -> String {
        let mut text = format!(
            "{} $ {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.command
        );
        if !self.output.is_empty() {
            text.push('\n');
            text.push_str(&truncate_chars(&self.output, max_output_chars));
        }
        text
    }
}

/// Limits applied when rendering history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayLimits {
    /// Most recent records shown
    pub max_records: usize,
    /// Characters shown per output
    pub max_output_chars: usize,
}

impl Default for DisplayLimits {
    fn default() -> Self {
        Self {
            max_records: 20,
            max_output_chars: 2000,
        }
    }
}

/// Render the most recent records, oldest first
pub fn render_history(records: &[CommandRecord], limits: DisplayLimits) -> String {
    if records.is_empty() {
        return EMPTY_HISTORY.to_string();
    }

    let start = records.len().saturating_sub(limits.max_records);
    records[start..]
        .iter()
        .map(|record| record.render(limits.max_output_chars))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cut `text` to `max_chars` characters, marking the cut
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}{}", &text[..byte_index], CONTINUATION_MARKER),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(second: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 1, 12, 0, second)
            .single()
            .unwrap()
    }

    #[test]
    fn test_render_record() {
        let record = CommandRecord::new(at(5), "echo hello", "hello");
        assert_eq!(record.render(2000), "2024-03-01 12:00:05 $ echo hello\nhello");
    }

    #[test]
    fn test_render_record_without_output() {
        let record = CommandRecord::new(at(0), "true", "");
        assert_eq!(record.render(2000), "2024-03-01 12:00:00 $ true");
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(render_history(&[], DisplayLimits::default()), EMPTY_HISTORY);
    }

    #[test]
    fn test_history_shows_most_recent_twenty() {
        let records: Vec<_> = (0..25)
            .map(|i| CommandRecord::new(at(i), format!("echo {i}"), format!("{i}")))
            .collect();

        let rendered = render_history(&records, DisplayLimits::default());
        assert_eq!(rendered.matches(" $ ").count(), 20);
        assert!(!rendered.contains("$ echo 4\n"));
        assert!(rendered.contains("$ echo 5\n"));
        assert!(rendered.ends_with("$ echo 24\n24"));
    }

    #[test]
    fn test_long_output_truncated_for_display_only() {
        let output = "x".repeat(5000);
        let record = CommandRecord::new(at(0), "yes x", output.clone());

        let rendered = record.render(2000);
        let shown = rendered.split_once('\n').unwrap().1;
        assert_eq!(shown, format!("{}{}", "x".repeat(2000), CONTINUATION_MARKER));
        assert_eq!(record.output().len(), 5000);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("ééé", 2), format!("éé{CONTINUATION_MARKER}"));
        assert_eq!(truncate_chars("ééé", 3), "ééé");
    }
}
