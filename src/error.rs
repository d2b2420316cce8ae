use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Location failure kinds reported by the platform source
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable")]
    PositionUnavailable,

    #[error("Location request timed out")]
    Timeout,

    #[error("Invalid location sample: {0}")]
    InvalidSample(String),
}

impl LocationError {
    /// Only transient platform failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LocationError::PositionUnavailable | LocationError::Timeout
        )
    }

    /// Message shown to the user for this failure kind
    pub fn user_message(&self) -> &'static str {
        match self {
            LocationError::PermissionDenied => {
                "Location access is blocked. Enable location permission for GymGraph to check in."
            }
            LocationError::PositionUnavailable => {
                "We couldn't determine your location. Move near a window or step outside and try again."
            }
            LocationError::Timeout => "Getting your location took too long. Please try again.",
            LocationError::InvalidSample(_) => {
                "Your device reported an invalid location. Please try again."
            }
        }
    }
}

/// Check-in session errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Cannot {action} while session is {from}")]
    InvalidTransition { from: String, action: &'static str },

    #[error(transparent)]
    Location(#[from] LocationError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
