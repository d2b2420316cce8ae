use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Point-in-time view of a check-in session for the UI layer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub timestamp: f64,
    pub session_id: String,
    pub started_at: String,
    pub state: String,
    pub samples_ingested: u32,
    pub samples_rejected: u32,
    // Stabilized location
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy_meters: Option<f64>,
    // Presence against the gym
    pub checkin_radius_meters: f64,
    pub distance_meters: Option<f64>,
    pub display_distance: Option<String>,
    pub within_radius: bool,
    pub can_check_in: bool,
    pub failure_message: Option<String>,
}

impl SessionSnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// One-line summary for terminal output
    pub fn summary(&self) -> String {
        match (&self.display_distance, self.accuracy_meters) {
            (Some(distance), Some(accuracy)) => format!(
                "{} | {} away (±{:.0}m) | check-in {}",
                self.state,
                distance,
                accuracy,
                if self.can_check_in { "enabled" } else { "disabled" }
            ),
            _ => match &self.failure_message {
                Some(message) => format!("{} | {}", self.state, message),
                None => self.state.clone(),
            },
        }
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
