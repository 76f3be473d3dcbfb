use super::PoseFilter;
use crate::constants::{EXPONENTIAL_ALPHA_MAX, EXPONENTIAL_ALPHA_MIN};
use crate::{Error, Result};
use nalgebra::{Isometry3, Translation3};

/// Exponential smoothing filter: lerp on translation, slerp on rotation
pub struct ExponentialFilter {
    alpha: f64,
    last: Option<Isometry3<f64>>,
}

impl ExponentialFilter {
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > EXPONENTIAL_ALPHA_MIN && alpha <= EXPONENTIAL_ALPHA_MAX) {
            return Err(Error::FilterError(format!("Alpha must be in (0, 1], got {alpha}")));
        }
        Ok(Self { alpha, last: None })
    }
}

impl PoseFilter for ExponentialFilter {
    fn apply(&mut self, pose: &Isometry3<f64>) -> Isometry3<f64> {
        let filtered = match &self.last {
            Some(last) => {
                let translation = last.translation.vector.lerp(&pose.translation.vector, self.alpha);
                let rotation = last
                    .rotation
                    .try_slerp(&pose.rotation, self.alpha, 1e-9)
                    .unwrap_or(pose.rotation);
                Isometry3::from_parts(Translation3::from(translation), rotation)
            }
            None => *pose,
        };

        self.last = Some(filtered);
        filtered
    }

    fn reset(&mut self) {
        self.last = None;
    }

    fn name(&self) -> &str {
        "ExponentialFilter"
    }

    fn fresh(&self) -> Box<dyn PoseFilter> {
        Box::new(Self {
            alpha: self.alpha,
            last: None,
        })
    }
}
