use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

use crate::error::LocationError;
use crate::types::LocationSample;

/// Options passed with each platform location request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    pub timeout_ms: u64,
    /// Oldest cached fix the platform may answer with
    pub max_cache_age_ms: u64,
}

impl PositionOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Platform geolocation capability
pub trait LocationSource: Send + Sync {
    /// One-shot position query
    fn current_position(
        &self,
        options: PositionOptions,
    ) -> BoxFuture<'_, Result<LocationSample, LocationError>>;

    /// Continuous subscription; the platform side is released when the
    /// returned handle is cancelled or dropped
    fn watch_position(&self, options: PositionOptions) -> Result<LocationWatch, LocationError>;
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// Handle to an active watch subscription
pub struct LocationWatch {
    rx: Receiver<Result<LocationSample, LocationError>>,
    cancel: Option<CancelHook>,
}

impl LocationWatch {
    pub fn new(
        rx: Receiver<Result<LocationSample, LocationError>>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next delivery, or `None` once the platform closes the subscription
    pub async fn next(&mut self) -> Option<Result<LocationSample, LocationError>> {
        self.rx.recv().await
    }

    pub fn cancel(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            self.rx.close();
            cancel();
        }
    }
}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.release();
    }
}
