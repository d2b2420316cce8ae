//! Recorded or scripted location source.
//!
//! Backs the CLI and the tests. The first recorded reading answers the
//! one-shot request, the rest are streamed through the watch.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::clock::Clock;
use crate::error::LocationError;
use crate::source::{LocationSource, LocationWatch, PositionOptions};
use crate::types::{GymTarget, LocationSample};

/// Recorded check-in log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLog {
    #[serde(default)]
    pub gym: Option<GymTarget>,
    pub readings: Vec<LocationSample>,
}

/// Load a `.json` or `.json.gz` replay log
pub fn load_log(path: &Path) -> Result<ReplayLog> {
    let file = File::open(path).with_context(|| format!("opening log {}", path.display()))?;
    let log: ReplayLog = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        serde_json::from_reader(BufReader::new(gz))
    } else {
        serde_json::from_reader(BufReader::new(file))
    }
    .with_context(|| format!("parsing log {}", path.display()))?;
    Ok(log)
}

/// Answer to a one-shot position request
#[derive(Debug, Clone)]
pub enum ScriptedFix {
    Fix(LocationSample),
    Fail(LocationError),
    /// Never resolves; exercises request timeouts
    Hang,
}

pub struct ReplaySource {
    fixes: Mutex<VecDeque<ScriptedFix>>,
    watch_readings: Vec<Result<LocationSample, LocationError>>,
    /// Playback speed for recorded gaps; `None` streams without delay
    speed: Option<f64>,
    rebase_clock: Option<Arc<dyn Clock>>,
    /// Capture time of the first scripted fix, where pacing starts
    origin_ms: Option<i64>,
    requests: Mutex<Vec<PositionOptions>>,
    active_watches: Arc<AtomicUsize>,
    watches_opened: AtomicUsize,
}

impl ReplaySource {
    pub fn scripted(fixes: Vec<ScriptedFix>) -> Self {
        let origin_ms = fixes.iter().find_map(|f| match f {
            ScriptedFix::Fix(sample) => Some(sample.captured_at_ms),
            _ => None,
        });
        ReplaySource {
            fixes: Mutex::new(fixes.into()),
            watch_readings: Vec::new(),
            speed: None,
            rebase_clock: None,
            origin_ms,
            requests: Mutex::new(Vec::new()),
            active_watches: Arc::new(AtomicUsize::new(0)),
            watches_opened: AtomicUsize::new(0),
        }
    }

    pub fn from_log(log: &ReplayLog) -> Self {
        let mut readings = log.readings.iter().copied();
        let fixes = readings.next().map(ScriptedFix::Fix).into_iter().collect();
        Self::scripted(fixes).with_watch(readings.map(Ok).collect())
    }

    pub fn with_watch(mut self, readings: Vec<Result<LocationSample, LocationError>>) -> Self {
        self.watch_readings = readings;
        self
    }

    /// Pace the watch by recorded gaps divided by `speed`; zero or less
    /// disables pacing
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = (speed > 0.0).then_some(speed);
        self
    }

    /// Stamp delivered samples with `clock` instead of their recorded times
    pub fn rebased_to(mut self, clock: Arc<dyn Clock>) -> Self {
        self.rebase_clock = Some(clock);
        self
    }

    /// Options of every one-shot request made so far
    pub fn requests(&self) -> Vec<PositionOptions> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Watches opened and not yet released
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }

    pub fn watches_opened(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst)
    }

    fn rebase(&self, sample: LocationSample) -> LocationSample {
        rebase_with(self.rebase_clock.as_ref(), sample)
    }

    fn watch_delays(&self) -> Vec<Duration> {
        let Some(speed) = self.speed else {
            return vec![Duration::ZERO; self.watch_readings.len()];
        };

        // The first gap is measured from the initial fix when there is one
        let mut prev = self.origin_ms;
        self.watch_readings
            .iter()
            .map(|reading| match reading {
                Ok(sample) => {
                    let gap = prev.map_or(0, |p| sample.captured_at_ms.saturating_sub(p).max(0));
                    prev = Some(sample.captured_at_ms);
                    Duration::from_secs_f64(gap as f64 / 1000.0 / speed)
                }
                Err(_) => Duration::ZERO,
            })
            .collect()
    }
}

fn rebase_with(clock: Option<&Arc<dyn Clock>>, sample: LocationSample) -> LocationSample {
    match clock {
        Some(clock) => LocationSample {
            captured_at_ms: clock.now_ms(),
            ..sample
        },
        None => sample,
    }
}

impl LocationSource for ReplaySource {
    fn current_position(
        &self,
        options: PositionOptions,
    ) -> BoxFuture<'_, Result<LocationSample, LocationError>> {
        Box::pin(async move {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(options);
            }

            let next = self
                .fixes
                .lock()
                .map_err(|_| LocationError::PositionUnavailable)?
                .pop_front();

            match next {
                Some(ScriptedFix::Fix(sample)) => Ok(self.rebase(sample)),
                Some(ScriptedFix::Fail(err)) => Err(err),
                Some(ScriptedFix::Hang) => futures::future::pending().await,
                None => Err(LocationError::PositionUnavailable),
            }
        })
    }

    fn watch_position(&self, options: PositionOptions) -> Result<LocationWatch, LocationError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| LocationError::PositionUnavailable)?;

        let (tx, rx) = mpsc::channel(16);
        let steps: Vec<_> = self
            .watch_delays()
            .into_iter()
            .zip(self.watch_readings.iter().cloned())
            .collect();
        let clock = self.rebase_clock.clone();

        log::debug!(
            "Opening replay watch with {} readings (high accuracy: {})",
            steps.len(),
            options.enable_high_accuracy
        );

        let handle = runtime.spawn(async move {
            let mut delivered = 0u64;
            for (delay, reading) in steps {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                let reading = reading.map(|sample| rebase_with(clock.as_ref(), sample));
                if tx.send(reading).await.is_err() {
                    log::debug!("Replay watch closed after {} readings", delivered);
                    return;
                }
                delivered += 1;
            }
            log::debug!("Replay watch finished: {} readings", delivered);
        });

        self.watches_opened.fetch_add(1, Ordering::SeqCst);
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active_watches);

        Ok(LocationWatch::new(rx, move || {
            handle.abort();
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
