//! Open-tab cache persisted across restarts (e.g. ~/.conductor/state.json).
//! Best effort: the gateway remains the source of truth for sessions and messages.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::session::StoreState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabCache {
    #[serde(default)]
    pub active_sessions: Vec<String>,
    #[serde(default)]
    pub current_session_id: Option<String>,
}

impl TabCache {
    pub fn from_state(state: &StoreState) -> Self {
        Self {
            active_sessions: state.active_sessions.clone(),
            current_session_id: state.current_session_id.clone(),
        }
    }

    /// Load from a JSON file. A missing or unreadable file yields an empty cache.
    pub fn load(path: &Path) -> Self {
        let Ok(s) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&s) {
            Ok(cache) => cache,
            Err(e) => {
                log::warn!("ignoring unreadable tab cache {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save to a JSON file. Creates parent dirs if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        let s = serde_json::to_string_pretty(self).context("serializing tab cache")?;
        std::fs::write(path, s)
            .with_context(|| format!("writing tab cache to {}", path.display()))?;
        Ok(())
    }
}
