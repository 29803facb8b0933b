//! One-shot location resolution
//!
//! Resolution never fails from the caller's point of view: a timeout,
//! permission denial or platform error all collapse to
//! [`LocationOutcome::Unavailable`], so dispatch is never held up by
//! location problems.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;

/// Base URL for map links in alert text
pub const MAPS_BASE_URL: &str = "https://maps.google.com/maps";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location unsupported on this platform")]
    Unsupported,

    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),
}

/// A resolved position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,

    /// Accuracy radius in meters, when the platform reports one
    pub accuracy: Option<f64>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, accuracy: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
        }
    }

    /// `lat, lng` at six decimal places
    pub fn coordinates(&self) -> String {
        format!("{:.6}, {:.6}", self.latitude, self.longitude)
    }

    pub fn maps_link(&self) -> String {
        format!("{}?q={:.6},{:.6}", MAPS_BASE_URL, self.latitude, self.longitude)
    }

    /// Accuracy rounded to whole meters
    pub fn accuracy_meters(&self) -> Option<i64> {
        self.accuracy
            .filter(|a| a.is_finite() && *a > 0.0)
            .map(|a| a.round() as i64)
    }
}

/// Outcome of a resolution attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LocationOutcome {
    Fix(LocationFix),
    Unavailable,
}

impl LocationOutcome {
    pub fn fix(&self) -> Option<&LocationFix> {
        match self {
            LocationOutcome::Fix(fix) => Some(fix),
            LocationOutcome::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, LocationOutcome::Fix(_))
    }
}

/// Platform location capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocationCapability: Send + Sync {
    /// Request a single fix; the timeout is advisory for the platform
    async fn request_fix(&self, timeout: Duration) -> Result<LocationFix, LocationError>;
}

/// Always reports the same position
pub struct FixedLocation {
    fix: LocationFix,
}

impl FixedLocation {
    pub fn new(fix: LocationFix) -> Self {
        Self { fix }
    }
}

#[async_trait]
impl LocationCapability for FixedLocation {
    async fn request_fix(&self, _timeout: Duration) -> Result<LocationFix, LocationError> {
        Ok(self.fix)
    }
}

/// No location hardware
pub struct NoLocation;

#[async_trait]
impl LocationCapability for NoLocation {
    async fn request_fix(&self, _timeout: Duration) -> Result<LocationFix, LocationError> {
        Err(LocationError::Unsupported)
    }
}

/// Wraps a capability with a hard timeout and error collapsing
#[derive(Clone)]
pub struct LocationResolver {
    capability: Arc<dyn LocationCapability>,
    alert_timeout: Duration,
    lookup_timeout: Duration,
}

impl LocationResolver {
    pub fn new(capability: Arc<dyn LocationCapability>, config: &MonitorConfig) -> Self {
        Self {
            capability,
            alert_timeout: config.alert_location_timeout(),
            lookup_timeout: config.lookup_location_timeout(),
        }
    }

    /// Resolve within `limit`; never fails
    pub async fn resolve(&self, limit: Duration) -> LocationOutcome {
        debug!("Requesting location fix (timeout {}ms)", limit.as_millis());

        match timeout(limit, self.capability.request_fix(limit)).await {
            Ok(Ok(fix)) => {
                info!("Location resolved: {}", fix.coordinates());
                LocationOutcome::Fix(fix)
            }
            Ok(Err(e)) => {
                warn!("Location unavailable: {}", e);
                LocationOutcome::Unavailable
            }
            Err(_) => {
                warn!(
                    "Location unavailable: {}",
                    LocationError::Timeout(limit.as_millis() as u64)
                );
                LocationOutcome::Unavailable
            }
        }
    }

    /// Bounded resolution used once the countdown has elapsed
    pub async fn resolve_for_alert(&self) -> LocationOutcome {
        self.resolve(self.alert_timeout).await
    }

    /// Resolution for a user-initiated lookup, with a longer budget
    pub async fn resolve_for_lookup(&self) -> LocationOutcome {
        self.resolve(self.lookup_timeout).await
    }
}
