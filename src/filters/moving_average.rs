use super::PoseFilter;
use crate::{Error, Result};
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};
use std::collections::VecDeque;

/// Moving average filter over the last `window_size` poses
pub struct MovingAverageFilter {
    window_size: usize,
    buffer: VecDeque<Isometry3<f64>>,
}

impl MovingAverageFilter {
    pub fn new(window_size: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::FilterError("Window size must be greater than 0".to_string()));
        }
        Ok(Self {
            window_size,
            buffer: VecDeque::with_capacity(window_size),
        })
    }
}

impl PoseFilter for MovingAverageFilter {
    fn apply(&mut self, pose: &Isometry3<f64>) -> Isometry3<f64> {
        if self.buffer.len() >= self.window_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(*pose);

        let count = self.buffer.len() as f64;
        let translation = self
            .buffer
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.translation.vector)
            / count;

        // Quaternion mean, with each sample flipped into the newest sample's hemisphere
        let reference = pose.rotation.into_inner();
        let sum = self.buffer.iter().fold(Quaternion::new(0.0, 0.0, 0.0, 0.0), |acc, p| {
            let q = p.rotation.into_inner();
            if q.dot(&reference) < 0.0 {
                acc - q
            } else {
                acc + q
            }
        });
        let rotation = UnitQuaternion::try_new(sum, 1e-12).unwrap_or(pose.rotation);

        Isometry3::from_parts(Translation3::from(translation), rotation)
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn name(&self) -> &str {
        "MovingAverageFilter"
    }

    fn fresh(&self) -> Box<dyn PoseFilter> {
        Box::new(Self {
            window_size: self.window_size,
            buffer: VecDeque::with_capacity(self.window_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(z: f64) -> Isometry3<f64> {
        Isometry3::translation(0.0, 0.0, z)
    }

    #[test]
    fn test_moving_average() {
        let mut filter = MovingAverageFilter::new(3).unwrap();

        assert_eq!(filter.apply(&at(10.0)).translation.z, 10.0);
        assert_eq!(filter.apply(&at(20.0)).translation.z, 15.0);
        assert_eq!(filter.apply(&at(30.0)).translation.z, 20.0);

        // Window is full, oldest value should be dropped
        assert_eq!(filter.apply(&at(40.0)).translation.z, 30.0);
    }

    #[test]
    fn test_rotation_mean_handles_sign_flip() {
        let mut filter = MovingAverageFilter::new(2).unwrap();
        let q = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3);
        let flipped = UnitQuaternion::new_unchecked(-q.into_inner());
        filter.apply(&Isometry3::from_parts(Translation3::identity(), q));
        let mean = filter.apply(&Isometry3::from_parts(Translation3::identity(), flipped));
        assert!(mean.rotation.angle_to(&q) < 1e-9);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(MovingAverageFilter::new(0).is_err());
    }
}
