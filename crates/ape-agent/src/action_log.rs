//! Action log
//!
//! One executed action per line: `<clock millis> <json>`. The replay agent
//! reads the same format back.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use ape_common::{ActionType, AgentError, Rect, Result};
use ape_model::{Action, ActionPayload, FuzzEvent};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub action_type: ActionType,
    #[serde(default)]
    pub throttle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<FuzzEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogEntry {
    fn header(action: &Action) -> Self {
        Self {
            action_type: action.action_type,
            throttle: action.throttle,
            target: None,
            full: None,
            bounds: None,
            input_text: None,
            package_name: None,
            class_name: None,
            events: None,
            activity: None,
            message: None,
        }
    }
}

impl From<&Action> for LogEntry {
    fn from(action: &Action) -> Self {
        let mut entry = Self::header(action);
        match &action.payload {
            ActionPayload::Model(payload) => {
                entry.target = payload.target.clone();
                entry.full = payload.full.clone();
                entry.bounds = payload.bounds;
                entry.input_text = payload.input_text.clone();
            }
            ActionPayload::Start { package, class } => {
                entry.package_name = Some(package.clone());
                entry.class_name = Some(class.clone());
            }
            ActionPayload::Fuzz { events } => entry.events = Some(events.clone()),
            ActionPayload::Crash { activity, message } => {
                entry.activity = Some(activity.clone());
                entry.message = Some(message.clone());
            }
            ActionPayload::Nop | ActionPayload::Activate => {}
        }
        entry
    }
}

/// Parse one `<millis> <json>` line
pub fn parse_line(line: &str) -> Result<(i64, LogEntry)> {
    let (clock, json) = line
        .trim()
        .split_once(' ')
        .ok_or_else(|| AgentError::MalformedLogEntry(line.to_string()))?;
    let clock: i64 = clock
        .parse()
        .map_err(|_| AgentError::MalformedLogEntry(format!("bad timestamp `{}`", clock)))?;
    let entry: LogEntry = serde_json::from_str(json)
        .map_err(|e| AgentError::MalformedLogEntry(format!("{}: {}", e, json)))?;
    Ok((clock, entry))
}

/// Read a whole log; malformed lines are skipped
pub fn read_action_log(path: &Path) -> Result<Vec<LogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok((_, entry)) => entries.push(entry),
            Err(e) => warn!(line = number + 1, error = %e, "skipping action log entry"),
        }
    }
    Ok(entries)
}

/// Appends executed actions to a log file
pub struct ActionLogWriter {
    writer: BufWriter<File>,
}

impl ActionLogWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, clock_timestamp: i64, action: &Action) -> Result<()> {
        let json = serde_json::to_string(&LogEntry::from(action))?;
        writeln!(self.writer, "{} {}", clock_timestamp, json)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let (clock, entry) =
            parse_line(r#"1700000000000 {"actionType":"MODEL_CLICK","throttle":200,"target":"//*[@resource-id='ok']","bounds":"[0,0][10,10]"}"#)
                .unwrap();
        assert_eq!(clock, 1_700_000_000_000);
        assert_eq!(entry.action_type, ActionType::ModelClick);
        assert_eq!(entry.throttle, 200);
        assert_eq!(entry.bounds, Some(Rect::new(0, 0, 10, 10)));
        assert!(entry.full.is_none());
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(parse_line("not-a-number {}").is_err());
        assert!(parse_line("12").is_err());
        assert!(parse_line(r#"12 {"actionType":"JUMP"}"#).is_err());
    }

    #[test]
    fn test_write_then_read_skips_malformed() {
        let dir = std::env::temp_dir().join(format!("ape-log-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("actions.log");

        let mut writer = ActionLogWriter::create(&path).unwrap();
        writer
            .append(1, &Action::start(ActionType::EventStart, "com.example", "com.example.Main"))
            .unwrap();
        writer.append(2, &Action::nop(1000)).unwrap();
        drop(writer);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("garbage line\n");
        std::fs::write(&path, text).unwrap();

        let entries = read_action_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].package_name.as_deref(), Some("com.example"));
        assert_eq!(entries[1].action_type, ActionType::EventNop);
        assert_eq!(entries[1].throttle, 1000);
        std::fs::remove_dir_all(&dir).ok();
    }
}
