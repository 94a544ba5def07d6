//! Compiled-in capability table for character files.
//!
//! Character documents reference these by id; unknown ids are load errors
//! for that file, never a runtime surprise.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::chat::prompt::{PromptGenerator, ToolDispatch, ToolDispatchError, render_template};

/// Resolve a prompt generator id.
pub fn generator(id: &str) -> Option<Arc<dyn PromptGenerator>> {
    match id {
        "daily_greeter" => Some(Arc::new(DailyGreeter)),
        _ => None,
    }
}

/// Resolve a tool dispatcher id. Each call returns a fresh instance so
/// dispatcher state stays private to one registry load.
pub fn dispatcher(id: &str) -> Option<Arc<dyn ToolDispatch>> {
    match id {
        "journal" => Some(Arc::new(Journal::default())),
        _ => None,
    }
}

/// Template prompt seasoned with the time of day. Deliberately
/// non-deterministic across the day; rendered once per character selection.
struct DailyGreeter;

impl PromptGenerator for DailyGreeter {
    fn make_system_prompt(&self) -> String {
        let hour = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_secs() / 3600) % 24)
            .unwrap_or(12);
        let part_of_day = match hour {
            5..=11 => "morning",
            12..=17 => "afternoon",
            18..=22 => "evening",
            _ => "night",
        };
        render_template(
            None,
            Some(&format!(
                "It is currently {part_of_day} (UTC). Open with a greeting \
                 that fits the time of day, then get the conversation going."
            )),
        )
    }
}

/// In-memory event journal, the reference tool dispatcher. Characters
/// declare `log_event` and `recall_events` against it.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl ToolDispatch for Journal {
    fn handle_tool_call(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolDispatchError> {
        match name {
            "log_event" => {
                let event = arguments
                    .get("event")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ToolDispatchError::Failed {
                        kind: "MissingArgument".to_string(),
                        message: "event text is required".to_string(),
                    })?;
                let importance = arguments
                    .get("importance")
                    .and_then(|v| v.as_str())
                    .unwrap_or("normal");
                self.entries
                    .lock()
                    .push(format!("[{importance}] {event}"));
                Ok(format!("Logged: {event}"))
            }
            "recall_events" => {
                let entries = self.entries.lock();
                if entries.is_empty() {
                    Ok("No events logged yet.".to_string())
                } else {
                    Ok(entries.join("\n"))
                }
            }
            other => Err(ToolDispatchError::UnknownTool(other.to_string())),
        }
    }
}
