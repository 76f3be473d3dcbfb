//! Pose smoothing filters.
//!
//! Marker poses jitter from frame to frame; these filters trade a little
//! latency for a steadier anchor. Each filter smooths a full rigid transform:
//! translation componentwise, rotation on the unit quaternion.

/// Moving average filter for simple smoothing
pub mod moving_average;

/// Exponential filter for responsive smoothing
pub mod exponential;

use crate::{Error, Result};
use nalgebra::Isometry3;

/// Trait for all pose filters
pub trait PoseFilter: Send {
    /// Apply filter to a new pose measurement
    fn apply(&mut self, pose: &Isometry3<f64>) -> Isometry3<f64>;

    /// Reset filter state
    fn reset(&mut self);

    /// Get filter name
    fn name(&self) -> &str;

    /// A new filter with the same parameters and empty state
    fn fresh(&self) -> Box<dyn PoseFilter>;
}

/// No-op filter that passes through poses unchanged
pub struct NoFilter;

impl PoseFilter for NoFilter {
    fn apply(&mut self, pose: &Isometry3<f64>) -> Isometry3<f64> {
        *pose
    }

    fn reset(&mut self) {}

    fn name(&self) -> &str {
        "NoFilter"
    }

    fn fresh(&self) -> Box<dyn PoseFilter> {
        Box::new(NoFilter)
    }
}

fn parse_param<T: std::str::FromStr>(filter_type: &str, param: Option<&str>, default: T) -> Result<T> {
    match param {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::FilterError(format!("Invalid parameter '{raw}' for filter {filter_type}"))),
    }
}

/// Create a pose filter by type name, optionally with a parameter
/// (`moving_average:10`, `exponential:0.3`)
pub fn create_filter(filter_type: &str) -> Result<Box<dyn PoseFilter>> {
    let lowered = filter_type.to_lowercase();
    let mut parts = lowered.splitn(2, ':');
    let name = parts.next().unwrap_or_default();
    let param = parts.next();

    match name {
        "none" | "nofilter" => Ok(Box::new(NoFilter)),
        "moving_average" | "movingaverage" => {
            let window = parse_param(filter_type, param, crate::constants::DEFAULT_MOVING_AVERAGE_WINDOW)?;
            Ok(Box::new(moving_average::MovingAverageFilter::new(window)?))
        }
        "exponential" => {
            let alpha = parse_param(filter_type, param, crate::constants::DEFAULT_EXPONENTIAL_ALPHA)?;
            Ok(Box::new(exponential::ExponentialFilter::new(alpha)?))
        }
        _ => Err(Error::FilterError(format!("Unknown filter type: {filter_type}"))),
    }
}
