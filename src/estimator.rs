//! Location stabilization for gym check-in.
//!
//! GPS fixes indoors swing by tens to hundreds of meters between reads.
//! `PresenceEstimator` keeps a short window of recent fixes and only moves
//! its estimate when a reading is clearly better or the user clearly moved.

use std::collections::VecDeque;

use crate::clock::{Clock, SystemClock};
use crate::config::StabilizationPolicy;
use crate::error::LocationError;
use crate::geo::{format_distance, haversine_distance};
use crate::types::{BestEstimate, GymTarget, LocationSample, PresenceResult};

/// Distance and presence decision for an estimate against a gym
pub fn distance_to(estimate: &BestEstimate, target: &GymTarget) -> PresenceResult {
    let distance_meters = haversine_distance(
        estimate.latitude,
        estimate.longitude,
        target.latitude,
        target.longitude,
    );
    PresenceResult {
        distance_meters,
        within_radius: distance_meters <= target.checkin_radius_meters,
        display_distance: format_distance(distance_meters),
    }
}

pub struct PresenceEstimator<C: Clock = SystemClock> {
    history: VecDeque<LocationSample>,
    best: Option<BestEstimate>,
    /// Capture time of the fix that last won on movement
    moved_at: Option<i64>,
    policy: StabilizationPolicy,
    clock: C,
}

impl PresenceEstimator<SystemClock> {
    pub fn new(policy: StabilizationPolicy) -> Self {
        Self::with_clock(policy, SystemClock)
    }
}

impl Default for PresenceEstimator<SystemClock> {
    fn default() -> Self {
        Self::new(StabilizationPolicy::default())
    }
}

impl<C: Clock> PresenceEstimator<C> {
    pub fn with_clock(policy: StabilizationPolicy, clock: C) -> Self {
        let history_len = policy.history_len.max(1);
        PresenceEstimator {
            history: VecDeque::with_capacity(history_len + 1),
            best: None,
            moved_at: None,
            policy,
            clock,
        }
    }

    /// Feed one raw sample and return the (possibly unchanged) estimate.
    ///
    /// Samples are kept in capture order, so a late arrival is slotted in
    /// behind newer ones and is the first to be evicted.
    pub fn ingest(&mut self, sample: LocationSample) -> BestEstimate {
        let retained = self.insert(sample);
        if let (false, Some(current)) = (retained, self.best) {
            log::debug!(
                "Sample from {} ms is older than a full history, ignoring",
                sample.captured_at_ms
            );
            return current;
        }

        let now = self.clock.now_ms();
        let window = self.policy.freshness_window_ms;
        let candidate = self.candidate(now);

        let Some(candidate) = candidate else {
            // Nothing recent enough to stabilize against
            log::debug!(
                "No fresh samples (newest is {} ms old), using raw fix",
                sample.age_ms(now)
            );
            let estimate = BestEstimate::from(sample);
            self.best = Some(estimate);
            return estimate;
        };

        let current = match self.best {
            Some(current) if now.saturating_sub(current.captured_at_ms) < window => current,
            _ => {
                let estimate = BestEstimate::from(candidate);
                self.best = Some(estimate);
                return estimate;
            }
        };

        if candidate.accuracy_meters < current.accuracy_meters - self.policy.improvement_margin_meters {
            log::debug!(
                "Accepting better fix: {:.1}m -> {:.1}m",
                current.accuracy_meters,
                candidate.accuracy_meters
            );
            let estimate = BestEstimate::from(candidate);
            self.best = Some(estimate);
            return estimate;
        }

        // A reading older than the held estimate never overrides it
        let incoming_is_mover =
            sample.age_ms(now) < window && sample.captured_at_ms >= current.captured_at_ms;
        let mover = [Some(candidate), incoming_is_mover.then_some(sample)]
            .into_iter()
            .flatten()
            .find(|s| self.is_real_movement(&current, s));

        if let Some(mover) = mover {
            log::debug!(
                "Movement detected ({:.1}m), accepting {:.1}m fix",
                haversine_distance(current.latitude, current.longitude, mover.latitude, mover.longitude),
                mover.accuracy_meters
            );
            self.moved_at = Some(mover.captured_at_ms);
            let estimate = BestEstimate::from(mover);
            self.best = Some(estimate);
            return estimate;
        }

        current
    }

    /// Like `ingest`, but refuses malformed samples without touching state
    pub fn try_ingest(&mut self, sample: LocationSample) -> Result<BestEstimate, LocationError> {
        sample.validate()?;
        Ok(self.ingest(sample))
    }

    /// Presence decision for the held estimate, if any
    pub fn presence(&self, target: &GymTarget) -> Option<PresenceResult> {
        self.best.as_ref().map(|estimate| distance_to(estimate, target))
    }

    pub fn best_estimate(&self) -> Option<BestEstimate> {
        self.best
    }

    pub fn history(&self) -> impl Iterator<Item = &LocationSample> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Retained samples still inside the freshness window
    pub fn fresh_samples(&self) -> Vec<LocationSample> {
        let now = self.clock.now_ms();
        self.history
            .iter()
            .filter(|s| s.age_ms(now) < self.policy.freshness_window_ms)
            .copied()
            .collect()
    }

    pub fn policy(&self) -> &StabilizationPolicy {
        &self.policy
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.best = None;
        self.moved_at = None;
    }

    /// Most accurate fresh sample. Fixes captured before the last accepted
    /// movement only count when nothing newer is fresh, so a precise reading
    /// from the old spot cannot pull the estimate back.
    fn candidate(&self, now: i64) -> Option<LocationSample> {
        let window = self.policy.freshness_window_ms;
        let fresh: Vec<&LocationSample> = self
            .history
            .iter()
            .filter(|s| s.age_ms(now) < window)
            .collect();

        let since_move = fresh
            .iter()
            .filter(|s| self.moved_at.map_or(true, |t| s.captured_at_ms >= t))
            .min_by(|a, b| a.accuracy_meters.total_cmp(&b.accuracy_meters));
        since_move
            .or_else(|| {
                fresh
                    .iter()
                    .min_by(|a, b| a.accuracy_meters.total_cmp(&b.accuracy_meters))
            })
            .map(|s| **s)
    }

    /// Slot `sample` in by capture time. Returns false when it was the
    /// oldest entry of a full history and got evicted straight away.
    fn insert(&mut self, sample: LocationSample) -> bool {
        let at = self
            .history
            .iter()
            .rposition(|s| s.captured_at_ms <= sample.captured_at_ms)
            .map_or(0, |i| i + 1);
        self.history.insert(at, sample);

        let mut evicted = 0;
        while self.history.len() > self.policy.history_len.max(1) {
            self.history.pop_front();
            evicted += 1;
        }
        at >= evicted
    }

    fn is_real_movement(&self, current: &BestEstimate, sample: &LocationSample) -> bool {
        let moved = haversine_distance(
            current.latitude,
            current.longitude,
            sample.latitude,
            sample.longitude,
        );
        moved > self.policy.movement_threshold_meters
            && sample.accuracy_meters < self.policy.movement_accuracy_ceiling_meters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::geo::EARTH_RADIUS_M;
    use approx::assert_relative_eq;

    const GYM_LAT: f64 = 17.4239;
    const GYM_LON: f64 = 78.4483;

    fn estimator(clock: &ManualClock) -> PresenceEstimator<ManualClock> {
        PresenceEstimator::with_clock(StabilizationPolicy::default(), clock.clone())
    }

    /// Latitude offset for a northward displacement in meters
    fn north_of(lat: f64, meters: f64) -> f64 {
        lat + (meters / EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn test_first_sample_is_accepted() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        let best = est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 120.0, 0));
        assert_eq!(best.accuracy_meters, 120.0);
        assert_eq!(est.best_estimate(), Some(best));
    }

    #[test]
    fn test_history_never_exceeds_five() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        for i in 0..10 {
            clock.set(i * 1000);
            est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 20.0 + i as f64, i * 1000));
            assert!(est.history_len() <= 5);
        }
        let kept: Vec<i64> = est.history().map(|s| s.captured_at_ms).collect();
        assert_eq!(kept, vec![5000, 6000, 7000, 8000, 9000]);
    }

    #[test]
    fn test_stale_sample_is_never_candidate() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 5.0, 0));

        clock.set(40_000);
        let best = est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 40_000));
        assert_eq!(best.accuracy_meters, 30.0);
        assert_eq!(best.captured_at_ms, 40_000);
        assert_eq!(est.fresh_samples().len(), 1);
    }

    #[test]
    fn test_all_stale_falls_back_to_newest_raw_sample() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 5.0, 0));

        clock.set(40_000);
        let late = LocationSample::new(north_of(GYM_LAT, 100.0), GYM_LON, 50.0, 1_000);
        let best = est.ingest(late);
        assert_eq!(best, BestEstimate::from(late));
    }

    #[test]
    fn test_freshness_boundary_is_exclusive() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 5.0, 0));
        clock.set(29_999);
        assert_eq!(est.fresh_samples().len(), 1);
        clock.set(30_000);
        assert!(est.fresh_samples().is_empty());
    }

    #[test]
    fn test_small_improvement_does_not_flicker() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 20.0, 0));

        clock.set(1_000);
        let best = est.ingest(LocationSample::new(north_of(GYM_LAT, 3.0), GYM_LON, 18.0, 1_000));
        assert_eq!(best.accuracy_meters, 20.0);
        assert_eq!(best.captured_at_ms, 0);
    }

    #[test]
    fn test_improvement_beyond_margin_is_accepted() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 20.0, 0));

        clock.set(1_000);
        let best = est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 14.0, 1_000));
        assert_eq!(best.accuracy_meters, 14.0);
    }

    #[test]
    fn test_improvement_of_exactly_margin_is_rejected() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 20.0, 0));

        clock.set(1_000);
        let best = est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 15.0, 1_000));
        assert_eq!(best.accuracy_meters, 20.0);
    }

    #[test]
    fn test_movement_overrides_worse_accuracy() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 0));

        clock.set(2_000);
        let moved = LocationSample::new(north_of(GYM_LAT, 20.0), GYM_LON, 40.0, 2_000);
        let best = est.ingest(moved);
        assert_eq!(best, BestEstimate::from(moved));
    }

    #[test]
    fn test_movement_does_not_snap_back() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 0));

        let new_lat = north_of(GYM_LAT, 20.0);
        clock.set(2_000);
        est.ingest(LocationSample::new(new_lat, GYM_LON, 40.0, 2_000));
        clock.set(4_000);
        let best = est.ingest(LocationSample::new(new_lat, GYM_LON, 40.0, 4_000));
        assert_relative_eq!(best.latitude, new_lat, epsilon = 1e-12);
    }

    #[test]
    fn test_small_movement_is_noise() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 0));

        clock.set(2_000);
        let best = est.ingest(LocationSample::new(north_of(GYM_LAT, 10.0), GYM_LON, 40.0, 2_000));
        assert_eq!(best.captured_at_ms, 0);
    }

    #[test]
    fn test_movement_with_poor_accuracy_is_ignored() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 0));

        clock.set(2_000);
        let best = est.ingest(LocationSample::new(north_of(GYM_LAT, 200.0), GYM_LON, 50.0, 2_000));
        assert_eq!(best.captured_at_ms, 0);
    }

    #[test]
    fn test_out_of_order_sample_is_slotted_by_timestamp() {
        let clock = ManualClock::new(5_000);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 3_000));
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 5_000));
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 4_000));
        let order: Vec<i64> = est.history().map(|s| s.captured_at_ms).collect();
        assert_eq!(order, vec![3_000, 4_000, 5_000]);
    }

    #[test]
    fn test_late_sample_in_full_buffer_is_dropped() {
        let clock = ManualClock::new(10_000);
        let mut est = estimator(&clock);
        for t in [6_000, 7_000, 8_000, 9_000, 10_000] {
            est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, t));
        }
        let best = est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 1.0, 1_000));
        assert_eq!(best.accuracy_meters, 30.0);
        assert!(est.history().all(|s| s.captured_at_ms >= 6_000));
    }

    #[test]
    fn test_late_distant_sample_in_full_buffer_does_not_move_estimate() {
        let clock = ManualClock::new(10_000);
        let mut est = estimator(&clock);
        for t in [6_000, 7_000, 8_000, 9_000, 10_000] {
            est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, t));
        }
        let late = LocationSample::new(north_of(GYM_LAT, 100.0), GYM_LON, 40.0, 1_000);
        let best = est.ingest(late);

        assert_eq!(best.captured_at_ms, 6_000);
        assert_eq!(best.latitude, GYM_LAT);
        let kept: Vec<i64> = est.history().map(|s| s.captured_at_ms).collect();
        assert_eq!(kept, vec![6_000, 7_000, 8_000, 9_000, 10_000]);
    }

    #[test]
    fn test_late_distant_sample_older_than_estimate_is_not_movement() {
        let clock = ManualClock::new(5_000);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 30.0, 4_000));
        let best = est.ingest(LocationSample::new(north_of(GYM_LAT, 100.0), GYM_LON, 40.0, 2_000));
        assert_eq!(best.captured_at_ms, 4_000);
        assert_eq!(est.history_len(), 2);
    }

    #[test]
    fn test_movement_keeps_history_and_ignores_old_spot() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 10.0, 0));
        clock.set(1_000);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 12.0, 1_000));

        let new_lat = north_of(GYM_LAT, 40.0);
        clock.set(2_000);
        let best = est.ingest(LocationSample::new(new_lat, GYM_LON, 35.0, 2_000));
        assert_relative_eq!(best.latitude, new_lat, epsilon = 1e-12);

        clock.set(3_000);
        let best = est.ingest(LocationSample::new(new_lat, GYM_LON, 33.0, 3_000));
        assert_relative_eq!(best.latitude, new_lat, epsilon = 1e-12);
        assert_eq!(best.captured_at_ms, 2_000);

        let kept: Vec<i64> = est.history().map(|s| s.captured_at_ms).collect();
        assert_eq!(kept, vec![0, 1_000, 2_000, 3_000]);
        assert_eq!(est.fresh_samples().len(), 4);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let clock = ManualClock::new(10_000);
        let mut est = estimator(&clock);
        let ancient = LocationSample::new(17.0, 78.0, 10.0, i64::MIN);
        let best = est.try_ingest(ancient).unwrap();
        assert_eq!(best, BestEstimate::from(ancient));

        let future = LocationSample::new(17.0, 78.0, 10.0, i64::MAX);
        est.try_ingest(future).unwrap();
        assert!(est.fresh_samples().iter().any(|s| s.captured_at_ms == i64::MAX));
    }

    #[test]
    fn test_try_ingest_rejects_invalid_without_state_change() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        let err = est
            .try_ingest(LocationSample::new(f64::NAN, GYM_LON, 10.0, 0))
            .unwrap_err();
        assert!(matches!(err, LocationError::InvalidSample(_)));
        assert_eq!(est.history_len(), 0);
        assert!(est.best_estimate().is_none());
    }

    #[test]
    fn test_distance_to_zero_is_within_any_radius() {
        let estimate = BestEstimate::from(LocationSample::new(GYM_LAT, GYM_LON, 10.0, 0));
        for radius in [0.0, 1.0, 500.0] {
            let result = distance_to(&estimate, &GymTarget::new(GYM_LAT, GYM_LON, radius));
            assert_eq!(result.distance_meters, 0.0);
            assert!(result.within_radius);
            assert_eq!(result.display_distance, "0m");
        }
    }

    #[test]
    fn test_radius_boundary_is_inclusive() {
        let estimate = BestEstimate::from(LocationSample::new(north_of(GYM_LAT, 300.0), GYM_LON, 10.0, 0));
        let distance = haversine_distance(estimate.latitude, estimate.longitude, GYM_LAT, GYM_LON);

        let at_edge = distance_to(&estimate, &GymTarget::new(GYM_LAT, GYM_LON, distance));
        assert!(at_edge.within_radius);

        let radius_short = distance_to(&estimate, &GymTarget::new(GYM_LAT, GYM_LON, distance - 0.01));
        assert!(!radius_short.within_radius);
    }

    #[test]
    fn test_distance_to_is_idempotent() {
        let estimate = BestEstimate::from(LocationSample::new(17.4301, 78.4402, 10.0, 0));
        let target = GymTarget::with_default_radius(GYM_LAT, GYM_LON);
        let first = distance_to(&estimate, &target);
        let second = distance_to(&estimate, &target);
        assert_eq!(first.distance_meters.to_bits(), second.distance_meters.to_bits());
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_clears_state() {
        let clock = ManualClock::new(0);
        let mut est = estimator(&clock);
        est.ingest(LocationSample::new(GYM_LAT, GYM_LON, 10.0, 0));
        est.reset();
        assert_eq!(est.history_len(), 0);
        assert!(est.presence(&GymTarget::with_default_radius(GYM_LAT, GYM_LON)).is_none());
    }
}
