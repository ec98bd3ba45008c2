use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::router::CommandError;
use crate::state::GimbalPosition;

/// One entry of a preset: move to `position` over `duration` milliseconds,
/// after waiting `delay` milliseconds from the end of the previous step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedMoveStep {
    pub position: GimbalPosition,
    /// Time in milliseconds to interpolate or hold en route to `position`.
    pub duration: u64,
    /// Wait in milliseconds before this step starts.
    #[serde(default)]
    pub delay: u64,
}

/// A named, replayable sequence of timed moves. Steps are immutable once
/// stored; clients replace the whole record to change them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetMove {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<TimedMoveStep>,
}

/// In-memory key-value store of presets, keyed by name.
#[derive(Debug, Default)]
pub struct PresetCatalog {
    presets: Mutex<HashMap<String, PresetMove>>,
}

impl PresetCatalog {
    pub fn new() -> Self {
        PresetCatalog::default()
    }

    /// Creates or overwrites a preset.
    pub fn put(&self, preset: PresetMove) -> Result<(), CommandError> {
        if preset.name.is_empty() {
            return Err(CommandError::MalformedCommand(
                "preset name must not be empty".into(),
            ));
        }

        if preset.steps.is_empty() {
            return Err(CommandError::MalformedCommand(
                "preset must contain at least one step".into(),
            ));
        }

        if let Some(step) = preset.steps.iter().find(|s| !s.position.is_finite()) {
            return Err(CommandError::MalformedCommand(format!(
                "preset step has non-finite position {:?}",
                step.position
            )));
        }

        self.presets
            .lock()
            .unwrap()
            .insert(preset.name.clone(), preset);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PresetMove> {
        self.presets.lock().unwrap().get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.presets.lock().unwrap().remove(name).is_some()
    }

    pub fn list(&self) -> Vec<PresetMove> {
        self.presets.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep() -> PresetMove {
        PresetMove {
            name: "sweep".into(),
            description: Some("pan left to right".into()),
            steps: vec![
                TimedMoveStep {
                    position: GimbalPosition::new(10.0, 90.0, 90.0),
                    duration: 500,
                    delay: 100,
                },
                TimedMoveStep {
                    position: GimbalPosition::new(170.0, 90.0, 90.0),
                    duration: 500,
                    delay: 0,
                },
            ],
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let catalog = PresetCatalog::new();
        catalog.put(sweep()).unwrap();

        assert_eq!(catalog.get("sweep"), Some(sweep()));
        assert_eq!(catalog.list().len(), 1);
    }

    #[test]
    fn put_overwrites_existing_name() {
        let catalog = PresetCatalog::new();
        catalog.put(sweep()).unwrap();

        let mut replacement = sweep();
        replacement.steps.truncate(1);
        catalog.put(replacement.clone()).unwrap();

        assert_eq!(catalog.get("sweep"), Some(replacement));
        assert_eq!(catalog.list().len(), 1);
    }

    #[test]
    fn delete_then_get_is_none() {
        let catalog = PresetCatalog::new();
        catalog.put(sweep()).unwrap();

        assert!(catalog.delete("sweep"));
        assert_eq!(catalog.get("sweep"), None);
        assert!(!catalog.delete("sweep"));
    }

    #[test]
    fn rejects_empty_name_and_empty_steps() {
        let catalog = PresetCatalog::new();

        let mut nameless = sweep();
        nameless.name.clear();
        assert!(catalog.put(nameless).is_err());

        let mut stepless = sweep();
        stepless.steps.clear();
        assert!(catalog.put(stepless).is_err());
    }

    #[test]
    fn step_delay_defaults_to_zero() {
        let step: TimedMoveStep = serde_json::from_str(
            r#"{"position": {"yaw": 10, "pitch": 20, "roll": 30}, "duration": 250}"#,
        )
        .unwrap();
        assert_eq!(step.delay, 0);
        assert_eq!(step.duration, 250);
    }
}
