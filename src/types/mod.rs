use serde::{Deserialize, Serialize};

use crate::error::LocationError;

/// Raw reading from the platform location source
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// 68% confidence radius in meters, smaller is better
    #[serde(alias = "accuracyMeters", alias = "accuracy")]
    pub accuracy_meters: f64,
    #[serde(alias = "capturedAtMs", alias = "timestamp")]
    pub captured_at_ms: i64,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64, captured_at_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            captured_at_ms,
        }
    }

    /// Reject readings that would poison the distance math
    pub fn validate(&self) -> Result<(), LocationError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(LocationError::InvalidSample(format!(
                "latitude {} out of range",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(LocationError::InvalidSample(format!(
                "longitude {} out of range",
                self.longitude
            )));
        }
        if !self.accuracy_meters.is_finite() || self.accuracy_meters < 0.0 {
            return Err(LocationError::InvalidSample(format!(
                "accuracy {} must be a non-negative number",
                self.accuracy_meters
            )));
        }
        Ok(())
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.captured_at_ms)
    }
}

/// Stabilized location held by the estimator
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestEstimate {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub captured_at_ms: i64,
}

impl From<LocationSample> for BestEstimate {
    fn from(sample: LocationSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy_meters: sample.accuracy_meters,
            captured_at_ms: sample.captured_at_ms,
        }
    }
}

fn default_checkin_radius() -> f64 {
    500.0
}

/// Registered gym coordinate and its check-in radius
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GymTarget {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_checkin_radius", alias = "checkinRadiusMeters")]
    pub checkin_radius_meters: f64,
}

impl GymTarget {
    pub fn new(latitude: f64, longitude: f64, checkin_radius_meters: f64) -> Self {
        Self {
            latitude,
            longitude,
            checkin_radius_meters,
        }
    }

    /// Gym with the default 500 m radius
    pub fn with_default_radius(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude, default_checkin_radius())
    }
}

/// Presence decision handed to the UI layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceResult {
    pub distance_meters: f64,
    pub within_radius: bool,
    pub display_distance: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_normal_fix() {
        let sample = LocationSample::new(17.4239, 78.4483, 12.0, 0);
        assert!(sample.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nan_and_negative_accuracy() {
        assert!(LocationSample::new(f64::NAN, 0.0, 5.0, 0).validate().is_err());
        assert!(LocationSample::new(0.0, 181.0, 5.0, 0).validate().is_err());
        assert!(LocationSample::new(0.0, 0.0, -1.0, 0).validate().is_err());
    }

    #[test]
    fn test_age_saturates_on_extreme_timestamps() {
        assert_eq!(LocationSample::new(0.0, 0.0, 5.0, i64::MIN).age_ms(1_000), i64::MAX);
        assert_eq!(LocationSample::new(0.0, 0.0, 5.0, i64::MAX).age_ms(-1_000), i64::MIN);
        assert_eq!(LocationSample::new(0.0, 0.0, 5.0, 400).age_ms(1_000), 600);
    }

    #[test]
    fn test_gym_target_radius_defaults_when_missing() {
        let target: GymTarget =
            serde_json::from_str(r#"{"latitude": 17.4239, "longitude": 78.4483}"#).unwrap();
        assert_eq!(target.checkin_radius_meters, 500.0);
    }

    #[test]
    fn test_sample_reads_camel_case_fields() {
        let sample: LocationSample = serde_json::from_str(
            r#"{"latitude": 1.0, "longitude": 2.0, "accuracyMeters": 8.5, "capturedAtMs": 1200}"#,
        )
        .unwrap();
        assert_eq!(sample.accuracy_meters, 8.5);
        assert_eq!(sample.captured_at_ms, 1200);
    }
}
