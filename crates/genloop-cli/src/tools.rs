//! Demo tools registered by the CLI host.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use genloop_engine::tools::TypedTool;
use genloop_engine::{EngineError, Result, ToolContext, ToolOutput, ToolRegistry};

/// Register every CLI tool.
pub fn registry(notes: Arc<NoteBook>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_typed(CurrentTime);
    registry.register_typed(SaveNote { notes });
    registry
}

// ---------------------------------------------------------------------------
// current_time
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CurrentTimeParams {
    /// Offset from UTC in whole hours, e.g. 8 or -5.  Defaults to UTC.
    #[serde(default)]
    pub utc_offset_hours: Option<i32>,
}

pub struct CurrentTime;

#[async_trait]
impl TypedTool for CurrentTime {
    type Params = CurrentTimeParams;

    const NAME: &'static str = "current_time";
    const DESCRIPTION: &'static str = "Get the current date and time.";

    async fn run(&self, params: CurrentTimeParams, _ctx: &ToolContext) -> Result<ToolOutput> {
        let hours = params.utc_offset_hours.unwrap_or(0);
        let offset = hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                EngineError::InvalidToolArguments {
                    tool_name: Self::NAME.into(),
                    reason: format!("utc_offset_hours out of range: {hours}"),
                }
            })?;
        let now = Utc::now().with_timezone(&offset);
        Ok(ToolOutput::json(json!({
            "iso8601": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
        })))
    }
}

// ---------------------------------------------------------------------------
// save_note
// ---------------------------------------------------------------------------

/// Notes kept per user for the lifetime of the process.
#[derive(Debug, Default)]
pub struct NoteBook {
    notes: Mutex<BTreeMap<String, Vec<String>>>,
}

impl NoteBook {
    pub fn add(&self, user_id: &str, note: String) -> usize {
        let mut notes = self.notes.lock().unwrap_or_else(|e| e.into_inner());
        let list = notes.entry(user_id.to_owned()).or_default();
        list.push(note);
        list.len()
    }

    pub fn for_user(&self, user_id: &str) -> Vec<String> {
        self.notes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SaveNoteParams {
    /// The user the note belongs to.
    pub user_id: String,
    /// What to remember.
    pub note: String,
}

pub struct SaveNote {
    notes: Arc<NoteBook>,
}

#[async_trait]
impl TypedTool for SaveNote {
    type Params = SaveNoteParams;

    const NAME: &'static str = "save_note";
    const DESCRIPTION: &'static str = "Remember a short note for the current user.";

    fn caller_bound_argument(&self) -> Option<&'static str> {
        Some("user_id")
    }

    fn per_user_exclusive(&self) -> bool {
        true
    }

    async fn run(&self, params: SaveNoteParams, _ctx: &ToolContext) -> Result<ToolOutput> {
        let note = params.note.trim();
        if note.is_empty() {
            return Err(EngineError::InvalidToolArguments {
                tool_name: Self::NAME.into(),
                reason: "note is empty".into(),
            });
        }
        let count = self.notes.add(&params.user_id, note.to_owned());
        Ok(ToolOutput::json(json!({ "saved": true, "notes": count })))
    }
}
