//! GPS presence verification for gym check-ins.
//!
//! Turns a noisy stream of platform location fixes into one stable estimate
//! and answers whether the user is inside a gym's check-in radius. The
//! authoritative check-in decision is made server-side; `within_radius` only
//! gates the client-side action.

pub mod acquisition;
pub mod clock;
pub mod config;
pub mod error;
pub mod estimator;
pub mod geo;
pub mod replay;
pub mod session;
pub mod source;
pub mod status;
pub mod types;


pub use acquisition::{acquire_initial, AcquisitionPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PresenceConfig, StabilizationPolicy};
pub use error::{LocationError, SessionError, SessionResult};
pub use estimator::{distance_to, PresenceEstimator};
pub use session::{CheckinSession, SampleOrigin, SessionState, TrackingEnd};
pub use source::{LocationSource, LocationWatch, PositionOptions};
pub use status::SessionSnapshot;
pub use types::{BestEstimate, GymTarget, LocationSample, PresenceResult};
