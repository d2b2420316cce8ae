use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::error::LocationError;
use crate::source::{LocationSource, PositionOptions};
use crate::types::LocationSample;

/// Ordered attempts for the first fix of a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPolicy {
    pub attempts: Vec<PositionOptions>,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        // Fast cached low-accuracy fix first, then one slower fallback that
        // tolerates an older cache. Precision comes later from the watch.
        AcquisitionPolicy {
            attempts: vec![
                PositionOptions {
                    enable_high_accuracy: false,
                    timeout_ms: 3_000,
                    max_cache_age_ms: 30_000,
                },
                PositionOptions {
                    enable_high_accuracy: false,
                    timeout_ms: 10_000,
                    max_cache_age_ms: 60_000,
                },
            ],
        }
    }
}

/// Run the policy's attempts in order until one yields a fix.
///
/// Permission denial ends the sequence at once. Unavailable and timed out
/// attempts fall through to the next one; if all of them fail the last
/// failure is returned.
pub async fn acquire_initial<S>(
    source: &S,
    policy: &AcquisitionPolicy,
) -> Result<LocationSample, LocationError>
where
    S: LocationSource + ?Sized,
{
    let total = policy.attempts.len();
    let mut last_error = LocationError::PositionUnavailable;

    for (idx, options) in policy.attempts.iter().enumerate() {
        let attempt = idx + 1;
        let result = match timeout(options.timeout(), source.current_position(*options)).await {
            Ok(result) => result,
            Err(_) => Err(LocationError::Timeout),
        };

        let err = match result {
            Ok(sample) => match sample.validate() {
                Ok(()) => {
                    log::info!(
                        "Initial fix on attempt {}/{}: accuracy {:.1}m",
                        attempt,
                        total,
                        sample.accuracy_meters
                    );
                    return Ok(sample);
                }
                Err(invalid) => {
                    log::warn!("Discarding initial fix: {}", invalid);
                    LocationError::PositionUnavailable
                }
            },
            Err(err) => err,
        };

        if !err.is_retryable() {
            log::warn!("Location acquisition stopped on attempt {}: {}", attempt, err);
            return Err(err);
        }

        if attempt < total {
            log::warn!(
                "Location attempt {}/{} failed ({}), retrying with {}ms timeout",
                attempt,
                total,
                err,
                policy.attempts[attempt].timeout_ms
            );
        }
        last_error = err;
    }

    log::warn!("Location acquisition exhausted {} attempt(s): {}", total, last_error);
    Err(last_error)
}
