use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

use crate::acquisition::acquire_initial;
use crate::clock::{Clock, SystemClock};
use crate::config::PresenceConfig;
use crate::error::{LocationError, SessionError, SessionResult};
use crate::estimator::{distance_to, PresenceEstimator};
use crate::source::LocationSource;
use crate::status::{current_timestamp, SessionSnapshot};
use crate::types::{BestEstimate, GymTarget, LocationSample, PresenceResult};

/// Check-in session state machine states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, no location requested yet
    Idle,
    /// Waiting for the first fix
    Acquiring,
    /// Estimate rests on the fast initial fix only
    Stabilizing,
    WithinRadius,
    OutOfRadius,
    /// Only an explicit retry leaves this state
    Failed(LocationError),
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Acquiring => "acquiring",
            SessionState::Stabilizing => "stabilizing",
            SessionState::WithinRadius => "within_radius",
            SessionState::OutOfRadius => "out_of_radius",
            SessionState::Failed(_) => "failed",
        }
    }

    /// States in which samples are accepted
    pub fn is_locating(&self) -> bool {
        matches!(
            self,
            SessionState::Acquiring
                | SessionState::Stabilizing
                | SessionState::WithinRadius
                | SessionState::OutOfRadius
        )
    }

    fn has_fix(&self) -> bool {
        matches!(
            self,
            SessionState::Stabilizing | SessionState::WithinRadius | SessionState::OutOfRadius
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where an ingested sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrigin {
    /// One-shot fast fix from acquisition
    Initial,
    /// Continuous watch delivery
    Watch,
}

/// Why `track` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEnd {
    Shutdown,
    WatchClosed,
    PermissionRevoked,
}

/// One check-in attempt at one gym
pub struct CheckinSession<C: Clock = SystemClock> {
    session_id: String,
    started_at: String,
    target: GymTarget,
    config: PresenceConfig,
    estimator: PresenceEstimator<C>,
    state: SessionState,
    samples_ingested: u32,
    samples_rejected: u32,
}

impl CheckinSession<SystemClock> {
    pub fn new(target: GymTarget, config: PresenceConfig) -> Self {
        Self::with_clock(target, config, SystemClock)
    }
}

impl<C: Clock> CheckinSession<C> {
    pub fn with_clock(target: GymTarget, config: PresenceConfig, clock: C) -> Self {
        let now = Utc::now();
        let estimator = PresenceEstimator::with_clock(config.stabilization.clone(), clock);
        CheckinSession {
            session_id: format!("checkin_{}", now.timestamp_millis()),
            started_at: now.to_rfc3339(),
            target,
            config,
            estimator,
            state: SessionState::Idle,
            samples_ingested: 0,
            samples_rejected: 0,
        }
    }

    /// Idle → Acquiring
    pub fn start(&mut self) -> SessionResult<()> {
        match self.state {
            SessionState::Idle => {
                self.transition(SessionState::Acquiring);
                Ok(())
            }
            _ => Err(self.invalid("start")),
        }
    }

    /// Failed → Acquiring, user triggered
    pub fn retry(&mut self) -> SessionResult<()> {
        match self.state {
            SessionState::Failed(_) => {
                self.transition(SessionState::Acquiring);
                Ok(())
            }
            _ => Err(self.invalid("retry")),
        }
    }

    /// Record a location failure
    pub fn fail(&mut self, reason: LocationError) -> SessionResult<()> {
        if !self.state.is_locating() {
            return Err(self.invalid("fail"));
        }
        log::warn!("Check-in {} failed: {}", self.session_id, reason);
        self.transition(SessionState::Failed(reason));
        Ok(())
    }

    /// Feed a sample and re-derive the presence decision
    pub fn ingest(
        &mut self,
        sample: LocationSample,
        origin: SampleOrigin,
    ) -> SessionResult<PresenceResult> {
        if !self.state.is_locating() {
            return Err(self.invalid("ingest"));
        }

        let estimate = match self.estimator.try_ingest(sample) {
            Ok(estimate) => estimate,
            Err(err) => {
                self.samples_rejected += 1;
                log::warn!("Rejected sample: {}", err);
                return Err(err.into());
            }
        };
        self.samples_ingested += 1;

        let result = distance_to(&estimate, &self.target);

        let next = match (origin, &self.state) {
            (SampleOrigin::Initial, SessionState::Acquiring) => SessionState::Stabilizing,
            (SampleOrigin::Initial, state) if state.has_fix() => state.clone(),
            _ => decision_state(&result),
        };
        self.transition(next);
        Ok(result)
    }

    /// Run the acquisition policy and ingest the first fix.
    /// Must be called in `Acquiring`; a failure moves the session to `Failed`.
    pub async fn acquire<S>(&mut self, source: &S) -> SessionResult<PresenceResult>
    where
        S: LocationSource + ?Sized,
    {
        if self.state != SessionState::Acquiring {
            return Err(self.invalid("acquire"));
        }

        match acquire_initial(source, &self.config.acquisition).await {
            Ok(sample) => self.ingest(sample, SampleOrigin::Initial),
            Err(err) => {
                self.fail(err.clone())?;
                Err(err.into())
            }
        }
    }

    /// Follow the continuous watch until `shutdown` resolves, the watch
    /// closes, or permission is revoked.
    ///
    /// The watch subscription is released on every way out of this call,
    /// including the returned future being dropped.
    pub async fn track<S, F, U>(
        &mut self,
        source: &S,
        shutdown: F,
        mut on_update: U,
    ) -> SessionResult<TrackingEnd>
    where
        S: LocationSource + ?Sized,
        F: Future<Output = ()>,
        U: FnMut(&SessionSnapshot),
    {
        if !self.state.has_fix() {
            return Err(self.invalid("track"));
        }

        let mut watch = match source.watch_position(self.config.watch) {
            Ok(watch) => watch,
            Err(err) => {
                if err == LocationError::PermissionDenied {
                    self.fail(err.clone())?;
                }
                return Err(err.into());
            }
        };
        log::info!("Check-in {} watching location", self.session_id);

        tokio::pin!(shutdown);
        let end = loop {
            tokio::select! {
                _ = &mut shutdown => break TrackingEnd::Shutdown,
                delivery = watch.next() => match delivery {
                    None => break TrackingEnd::WatchClosed,
                    Some(Ok(sample)) => {
                        if self.ingest(sample, SampleOrigin::Watch).is_ok() {
                            on_update(&self.snapshot());
                        }
                    }
                    Some(Err(LocationError::PermissionDenied)) => {
                        self.fail(LocationError::PermissionDenied)?;
                        on_update(&self.snapshot());
                        break TrackingEnd::PermissionRevoked;
                    }
                    Some(Err(err)) => {
                        // Individual watch requests time out routinely
                        log::warn!("Watch delivery failed, keeping estimate: {}", err);
                    }
                },
            }
        };

        watch.cancel();
        log::info!("Check-in {} stopped watching: {:?}", self.session_id, end);
        Ok(end)
    }

    /// Replace the gym target, e.g. after the registry refreshes
    pub fn set_target(&mut self, target: GymTarget) {
        self.target = target;
        if let (Some(result), true) = (self.presence(), self.state.has_fix()) {
            if self.state != SessionState::Stabilizing {
                self.transition(decision_state(&result));
            }
        }
    }

    pub fn presence(&self) -> Option<PresenceResult> {
        self.estimator.presence(&self.target)
    }

    pub fn best_estimate(&self) -> Option<BestEstimate> {
        self.estimator.best_estimate()
    }

    /// Coordinates attached to the check-in request
    pub fn checkin_coordinates(&self) -> Option<(f64, f64)> {
        self.best_estimate().map(|e| (e.latitude, e.longitude))
    }

    /// Client-side gate for the check-in action
    pub fn can_check_in(&self) -> bool {
        self.state == SessionState::WithinRadius
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn failure_message(&self) -> Option<&'static str> {
        match &self.state {
            SessionState::Failed(reason) => Some(reason.user_message()),
            _ => None,
        }
    }

    pub fn target(&self) -> &GymTarget {
        &self.target
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn estimator(&self) -> &PresenceEstimator<C> {
        &self.estimator
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let estimate = self.best_estimate();
        let presence = self.presence();
        SessionSnapshot {
            timestamp: current_timestamp(),
            session_id: self.session_id.clone(),
            started_at: self.started_at.clone(),
            state: self.state.label().to_string(),
            samples_ingested: self.samples_ingested,
            samples_rejected: self.samples_rejected,
            latitude: estimate.map(|e| e.latitude),
            longitude: estimate.map(|e| e.longitude),
            accuracy_meters: estimate.map(|e| e.accuracy_meters),
            checkin_radius_meters: self.target.checkin_radius_meters,
            distance_meters: presence.as_ref().map(|p| p.distance_meters),
            display_distance: presence.as_ref().map(|p| p.display_distance.clone()),
            within_radius: presence.as_ref().map(|p| p.within_radius).unwrap_or(false),
            can_check_in: self.can_check_in(),
            failure_message: self.failure_message().map(str::to_string),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::info!("Check-in {}: {} -> {}", self.session_id, self.state, next);
            self.state = next;
        }
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            from: self.state.label().to_string(),
            action,
        }
    }
}

fn decision_state(result: &PresenceResult) -> SessionState {
    if result.within_radius {
        SessionState::WithinRadius
    } else {
        SessionState::OutOfRadius
    }
}
