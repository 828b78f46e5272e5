use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::LoopMode;

/// Settings that survive daemon restarts.  Rewritten whenever volume, mute,
/// or loop mode change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub loop_mode: LoopMode,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            volume: 0.5,
            muted: false,
            loop_mode: LoopMode::All,
        }
    }
}

impl PersistentState {
    /// Load from `state_file`, falling back to defaults on any error; a
    /// corrupt state file must not stop the daemon from starting.
    pub fn load(state_file: &Path) -> Self {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(state) = serde_json::from_str::<PersistentState>(&content) {
                return state;
            }
            tracing::warn!("Ignoring unreadable state file {:?}", state_file);
        }
        PersistentState::default()
    }

    pub fn save(&self, state_file: &Path) -> anyhow::Result<()> {
        if let Some(parent) = state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(state_file, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let state = PersistentState::load(Path::new("/nonexistent/playdeck-state.json"));
        assert!((state.volume - 0.5).abs() < f32::EPSILON);
        assert!(!state.muted);
        assert_eq!(state.loop_mode, LoopMode::All);
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = std::env::temp_dir().join("playdeck-state-test.json");
        let state = PersistentState {
            volume: 0.8,
            muted: true,
            loop_mode: LoopMode::Shuffle,
        };
        state.save(&path).unwrap();
        let loaded = PersistentState::load(&path);
        assert!((loaded.volume - 0.8).abs() < f32::EPSILON);
        assert!(loaded.muted);
        assert_eq!(loaded.loop_mode, LoopMode::Shuffle);
        let _ = std::fs::remove_file(&path);
    }
}
