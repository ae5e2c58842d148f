//! File-touch extraction: which files did a message's tool calls read, write or edit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{ContentBlock, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Read,
    Write,
    Edit,
}

/// One observation that a tool call touched `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTouch {
    pub path: String,
    pub action: FileAction,
    pub timestamp: DateTime<Utc>,
}

/// Input fields that may carry the path, in priority order.
const PATH_FIELDS: [&str; 3] = ["file_path", "path", "notebook_path"];

/// Map a tool name to the file action it performs, if any.
fn file_action(tool_name: &str) -> Option<FileAction> {
    match tool_name.to_ascii_lowercase().as_str() {
        "read" | "notebookread" => Some(FileAction::Read),
        "write" => Some(FileAction::Write),
        "edit" | "multiedit" | "notebookedit" => Some(FileAction::Edit),
        _ => None,
    }
}

fn input_path(input: &Value) -> Option<&str> {
    PATH_FIELDS
        .iter()
        .find_map(|field| input.get(*field).and_then(|v| v.as_str()))
        .filter(|p| !p.is_empty())
}

/// Scan `message` for file-affecting tool uses. Touches come out in content order,
/// all stamped with the current time.
pub fn extract_file_touches(message: &Message) -> Vec<FileTouch> {
    let now = Utc::now();
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { name, input, .. } => {
                let action = file_action(name)?;
                let path = input_path(input)?;
                Some(FileTouch {
                    path: path.to_string(),
                    action,
                    timestamp: now,
                })
            }
            _ => None,
        })
        .collect()
}
