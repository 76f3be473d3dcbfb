//! Marker pose estimation: detection plus a per-marker planar pose solve.
//!
//! Poses are expressed in the vision camera frame (x right, y down, z forward).
//! [`MarkerObservation::gl_pose`] converts to the right-handed GL convention
//! used by the renderer.

use crate::{
    constants::{CAMERA_CENTER_FACTOR, EPSILON, MAX_REPROJECTION_ERROR_PX, UNDISTORT_ITERATIONS},
    filters::PoseFilter,
    Error, Frame, Result,
};
use log::{debug, warn};
use nalgebra::{
    Isometry3, Matrix3, Matrix4, Point2, Point3, Rotation3, SMatrix, SVector, Translation3, UnitQuaternion, Vector3,
};
use std::collections::HashMap;

/// Pinhole camera intrinsics in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    #[must_use]
    pub const fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Uncalibrated guess: focal length equal to the frame width, centered principal point
    #[must_use]
    pub fn estimated(width: u32, height: u32) -> Self {
        let focal_length = f64::from(width);
        Self {
            fx: focal_length,
            fy: focal_length,
            cx: f64::from(width) / CAMERA_CENTER_FACTOR,
            cy: f64::from(height) / CAMERA_CENTER_FACTOR,
        }
    }

    /// 3x3 camera matrix
    #[must_use]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Pixel to normalized image coordinates
    #[must_use]
    pub fn normalize(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    /// Normalized image coordinates to pixel
    #[must_use]
    pub fn to_pixel(&self, normalized: &Point2<f64>) -> Point2<f64> {
        Point2::new(normalized.x * self.fx + self.cx, normalized.y * self.fy + self.cy)
    }

    /// Project a camera-space point; `None` behind the camera
    #[must_use]
    pub fn project(&self, point: &Point3<f64>, distortion: &Distortion) -> Option<Point2<f64>> {
        if point.z <= EPSILON {
            return None;
        }
        let normalized = distortion.distort(&Point2::new(point.x / point.z, point.y / point.z));
        Some(self.to_pixel(&normalized))
    }
}

/// Brown-Conrady lens distortion (`k1 k2 p1 p2 k3`)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    #[must_use]
    pub const fn from_coefficients(c: [f64; 5]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
            .iter()
            .all(|c| c.abs() < EPSILON)
    }

    /// Apply distortion to a normalized point
    #[must_use]
    pub fn distort(&self, p: &Point2<f64>) -> Point2<f64> {
        if self.is_zero() {
            return *p;
        }
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        Point2::new(
            x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        )
    }

    /// Invert [`Distortion::distort`] by fixed-point iteration
    #[must_use]
    pub fn undistort(&self, p: &Point2<f64>) -> Point2<f64> {
        if self.is_zero() {
            return *p;
        }
        let (xd, yd) = (p.x, p.y);
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x * x + y * y;
            let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        Point2::new(x, y)
    }
}

/// How intrinsics are obtained for each frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraModel {
    /// Fixed calibration
    Calibrated(CameraIntrinsics, Distortion),
    /// Derived from the frame size, no distortion
    Estimated,
}

impl CameraModel {
    #[must_use]
    pub fn resolve(&self, width: u32, height: u32) -> (CameraIntrinsics, Distortion) {
        match self {
            Self::Calibrated(intrinsics, distortion) => (*intrinsics, *distortion),
            Self::Estimated => (CameraIntrinsics::estimated(width, height), Distortion::default()),
        }
    }
}

/// Raw marker detection: id and four pixel corners
/// (top-left, top-right, bottom-right, bottom-left)
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedMarker {
    pub id: i32,
    pub corners: [Point2<f64>; 4],
}

/// Finds fiducial markers in a frame
pub trait MarkerDetector {
    /// Detect all markers in the frame
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>>;
}

/// A marker with a solved camera-space pose
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerObservation {
    pub marker_id: i32,
    pub corners: [Point2<f64>; 4],
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

/// Vision (y down, z forward) to GL (y up, z backward) axis flip
#[must_use]
pub fn cv_to_gl() -> Matrix4<f64> {
    Matrix4::from_diagonal(&nalgebra::Vector4::new(1.0, -1.0, -1.0, 1.0))
}

impl MarkerObservation {
    /// Rotation as a Rodrigues vector
    #[must_use]
    pub fn axis_angle(&self) -> Vector3<f64> {
        self.rotation.scaled_axis()
    }

    #[must_use]
    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_rotation_matrix(&self.rotation),
        )
    }

    /// Marker-to-camera transform in the vision frame
    #[must_use]
    pub fn pose_matrix(&self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Marker-to-camera transform in the GL frame
    #[must_use]
    pub fn gl_pose(&self) -> Matrix4<f64> {
        cv_to_gl() * self.pose_matrix()
    }
}

/// Object-space corners of a square marker centered at the origin, lying in z = 0
#[must_use]
pub fn marker_object_points(marker_size: f64) -> [Point3<f64>; 4] {
    let h = marker_size / 2.0;
    [
        Point3::new(-h, h, 0.0),
        Point3::new(h, h, 0.0),
        Point3::new(h, -h, 0.0),
        Point3::new(-h, -h, 0.0),
    ]
}

/// Similarity transform moving points to zero mean and mean distance sqrt(2)
fn normalizing_transform(points: &[Point2<f64>; 4]) -> Result<Matrix3<f64>> {
    let (mx, my) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x / 4.0, sy + p.y / 4.0));
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mx).powi(2) + (p.y - my).powi(2)).sqrt())
        .sum::<f64>()
        / 4.0;
    if mean_dist < EPSILON {
        return Err(Error::PoseSolve("Degenerate point set".to_string()));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0))
}

fn apply(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    Point2::new(v.x / v.z, v.y / v.z)
}

/// Plane-to-image homography from four correspondences (normalized DLT, h33 = 1)
fn homography(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Result<Matrix3<f64>> {
    let t_src = normalizing_transform(src)?;
    let t_dst = normalizing_transform(dst)?;

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for i in 0..4 {
        let s = apply(&t_src, &src[i]);
        let d = apply(&t_dst, &dst[i]);
        let (r0, r1) = (2 * i, 2 * i + 1);
        a[(r0, 0)] = s.x;
        a[(r0, 1)] = s.y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -s.x * d.x;
        a[(r0, 7)] = -s.y * d.x;
        b[r0] = d.x;
        a[(r1, 3)] = s.x;
        a[(r1, 4)] = s.y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -s.x * d.y;
        a[(r1, 7)] = -s.y * d.y;
        b[r1] = d.y;
    }

    let h = a
        .lu()
        .solve(&b)
        .ok_or_else(|| Error::PoseSolve("Singular homography system".to_string()))?;
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| Error::PoseSolve("Singular normalization".to_string()))?;
    Ok(t_dst_inv * hn * t_src)
}

/// Closest rotation matrix (Frobenius norm) via SVD
fn orthonormalize(m: &Matrix3<f64>) -> Result<Rotation3<f64>> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(Error::PoseSolve("SVD failed".to_string())),
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        r = u * v_t;
    }
    Ok(Rotation3::from_matrix_unchecked(r))
}

/// Twice the signed area of the corner quadrilateral (shoelace)
fn quad_area(corners: &[Point2<f64>; 4]) -> f64 {
    let mut area = 0.0;
    for i in 0..4 {
        let (a, b) = (corners[i], corners[(i + 1) % 4]);
        area += a.x * b.y - b.x * a.y;
    }
    area / 2.0
}

/// Solve the pose of a square marker of known size from its four pixel corners
///
/// # Errors
///
/// Returns `PoseSolve` if the corners are degenerate, the homography is
/// singular, the solved marker lies behind the camera, or the reprojection
/// error exceeds the acceptance bound.
pub fn solve_marker_pose(
    corners: &[Point2<f64>; 4],
    marker_size: f64,
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Result<(Rotation3<f64>, Vector3<f64>)> {
    check_corners(corners)?;

    let object = marker_object_points(marker_size);
    let plane = object.map(|p| Point2::new(p.x, p.y));
    let image = corners.map(|c| distortion.undistort(&intrinsics.normalize(&c)));
    let h = homography(&plane, &image)?;

    let (h1, h2, h3) = (h.column(0).into_owned(), h.column(1).into_owned(), h.column(2).into_owned());
    let norm = h1.norm() + h2.norm();
    if norm < EPSILON {
        return Err(Error::PoseSolve("Degenerate homography".to_string()));
    }
    let mut lambda = 2.0 / norm;
    // H is defined up to sign; the marker must be in front of the camera.
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let translation = h3 * lambda;
    let r3 = r1.cross(&r2);
    let rotation = orthonormalize(&Matrix3::from_columns(&[r1, r2, r3]))?;

    check_solution(corners, marker_size, &rotation, &translation, intrinsics, distortion)?;
    Ok((rotation, translation))
}

/// Reject non-finite or collapsed corner quadrilaterals before solving
///
/// # Errors
///
/// Returns `PoseSolve` for NaN/infinite corners or a near-zero area.
pub fn check_corners(corners: &[Point2<f64>; 4]) -> Result<()> {
    if corners.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(Error::PoseSolve("Non-finite corner".to_string()));
    }
    if quad_area(corners).abs() < 1.0 {
        return Err(Error::PoseSolve("Marker corners are degenerate".to_string()));
    }
    Ok(())
}

/// Accept a solved pose only if it lies in front of the camera and reprojects
/// onto the observed corners
///
/// # Errors
///
/// Returns `PoseSolve` if the translation is invalid or the mean reprojection
/// error exceeds the acceptance bound.
pub fn check_solution(
    corners: &[Point2<f64>; 4],
    marker_size: f64,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Result<()> {
    if translation.iter().any(|v| !v.is_finite()) || translation.z <= EPSILON {
        return Err(Error::PoseSolve(format!(
            "Invalid translation {:?}",
            translation.as_slice()
        )));
    }
    let object = marker_object_points(marker_size);
    let error = reprojection_error(&object, corners, rotation, translation, intrinsics, distortion)?;
    if error > MAX_REPROJECTION_ERROR_PX {
        return Err(Error::PoseSolve(format!(
            "Reprojection error {error:.2}px exceeds {MAX_REPROJECTION_ERROR_PX}px"
        )));
    }
    Ok(())
}

/// Solves a square marker's pose from its four pixel corners
pub trait PoseSolver {
    /// Marker-to-camera rotation and translation in the vision frame
    ///
    /// # Errors
    ///
    /// Returns `PoseSolve` when no acceptable pose exists for the corners.
    fn solve(
        &self,
        corners: &[Point2<f64>; 4],
        marker_size: f64,
        intrinsics: &CameraIntrinsics,
        distortion: &Distortion,
    ) -> Result<(Rotation3<f64>, Vector3<f64>)>;
}

/// Homography-based solver built on nalgebra, for builds without `OpenCV`
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanarPoseSolver;

impl PoseSolver for PlanarPoseSolver {
    fn solve(
        &self,
        corners: &[Point2<f64>; 4],
        marker_size: f64,
        intrinsics: &CameraIntrinsics,
        distortion: &Distortion,
    ) -> Result<(Rotation3<f64>, Vector3<f64>)> {
        solve_marker_pose(corners, marker_size, intrinsics, distortion)
    }
}

/// Mean pixel distance between projected object points and observed corners
pub fn reprojection_error(
    object: &[Point3<f64>; 4],
    corners: &[Point2<f64>; 4],
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Result<f64> {
    let mut total = 0.0;
    for (point, corner) in object.iter().zip(corners) {
        let camera = rotation * point + translation;
        let projected = intrinsics
            .project(&camera, distortion)
            .ok_or_else(|| Error::PoseSolve("Corner projects behind camera".to_string()))?;
        total += (projected - corner).norm();
    }
    Ok(total / 4.0)
}

/// Detects markers and solves each marker's pose independently
pub struct PoseEstimator {
    detector: Box<dyn MarkerDetector>,
    solver: Box<dyn PoseSolver>,
    camera: CameraModel,
    marker_size: f64,
    filter_prototype: Option<Box<dyn PoseFilter>>,
    filters: HashMap<i32, Box<dyn PoseFilter>>,
}

impl PoseEstimator {
    /// Create a new pose estimator
    ///
    /// # Errors
    ///
    /// Returns an error if the marker size is not finite and positive.
    pub fn new(detector: Box<dyn MarkerDetector>, camera: CameraModel, marker_size: f64) -> Result<Self> {
        if !marker_size.is_finite() || marker_size <= 0.0 {
            return Err(Error::InvalidInput(format!("Invalid marker size: {marker_size}")));
        }
        log::info!("Initializing PoseEstimator with marker size {marker_size} m");
        Ok(Self {
            detector,
            solver: Box::new(PlanarPoseSolver),
            camera,
            marker_size,
            filter_prototype: None,
            filters: HashMap::new(),
        })
    }

    /// Replace the default [`PlanarPoseSolver`]
    #[must_use]
    pub fn with_solver(mut self, solver: Box<dyn PoseSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Smooth each marker's pose with a fresh copy of `filter`
    #[must_use]
    pub fn with_filter(mut self, filter: Box<dyn PoseFilter>) -> Self {
        self.filter_prototype = Some(filter);
        self
    }

    /// Detect markers in the frame and solve their poses.
    ///
    /// Markers whose pose cannot be solved are dropped; the rest are returned.
    ///
    /// # Errors
    ///
    /// Returns an error only when the detector itself fails.
    pub fn estimate(&mut self, frame: &Frame) -> Result<Vec<MarkerObservation>> {
        let detections = self.detector.detect(frame)?;
        let (intrinsics, distortion) = self.camera.resolve(frame.width(), frame.height());

        let mut observations = Vec::with_capacity(detections.len());
        for marker in detections {
            match self
                .solver
                .solve(&marker.corners, self.marker_size, &intrinsics, &distortion)
            {
                Ok((rotation, translation)) => observations.push(MarkerObservation {
                    marker_id: marker.id,
                    corners: marker.corners,
                    rotation,
                    translation,
                }),
                Err(e) => warn!("Dropping marker {}: {}", marker.id, e),
            }
        }

        self.smooth(&mut observations);
        debug!("Solved {} marker pose(s)", observations.len());
        Ok(observations)
    }

    fn smooth(&mut self, observations: &mut [MarkerObservation]) {
        let Some(prototype) = &self.filter_prototype else {
            return;
        };
        // Markers that left the view restart from scratch when they return.
        self.filters
            .retain(|id, _| observations.iter().any(|o| o.marker_id == *id));
        for observation in observations.iter_mut() {
            let filter = self
                .filters
                .entry(observation.marker_id)
                .or_insert_with(|| prototype.fresh());
            let smoothed = filter.apply(&observation.isometry());
            observation.rotation = smoothed.rotation.to_rotation_matrix();
            observation.translation = smoothed.translation.vector;
        }
    }

    /// Intrinsics used for a frame of the given size
    #[must_use]
    pub fn intrinsics_for(&self, width: u32, height: u32) -> (CameraIntrinsics, Distortion) {
        self.camera.resolve(width, height)
    }

    #[must_use]
    pub const fn marker_size(&self) -> f64 {
        self.marker_size
    }
}

/// Project a marker pose's object corners to pixels (test and overlay helper)
#[must_use]
pub fn project_marker(
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    marker_size: f64,
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Option<[Point2<f64>; 4]> {
    let object = marker_object_points(marker_size);
    let mut corners = [Point2::origin(); 4];
    for (corner, point) in corners.iter_mut().zip(object.iter()) {
        *corner = intrinsics.project(&(rotation * point + translation), distortion)?;
    }
    Some(corners)
}
