//! `OpenCV` implementations of the camera, window, face and marker seams.

use crate::app::{Display, FrameSource};
use crate::auth::{FaceBox, FaceDetector, FacePredictor};
use crate::error::{Error, Result};
use crate::persistence::FaceModelBackend;
use crate::pose_estimation::{
    check_corners, check_solution, marker_object_points, CameraIntrinsics, DetectedMarker, Distortion, MarkerDetector,
    PoseSolver,
};
use crate::session::{Hud, Key, Tone};
use crate::utils::image_conversion::{frame_to_mat, gray_to_mat, mat_to_frame};
use crate::utils::safe_cast::{f64_to_i32_clamp, i32_to_u32, u32_to_i32};
use crate::Frame;
use image::GrayImage;
use log::{debug, info};
use nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use opencv::core::{Mat, Point, Point2d, Point2f, Point3d, Ptr, Rect, Scalar, Size, Vector};
use opencv::face::LBPHFaceRecognizer;
use opencv::objdetect::{self, ArucoDetector, CascadeClassifier, PredefinedDictionaryType};
use opencv::prelude::*;
use opencv::{calib3d, highgui, imgproc, videoio};
use std::path::Path;

/// Webcam frames through `VideoCapture`
pub struct CameraSource {
    capture: videoio::VideoCapture,
}

impl CameraSource {
    /// Open a capture device
    ///
    /// # Errors
    ///
    /// Returns `Camera` if the device cannot be opened.
    pub fn open(device: i32) -> Result<Self> {
        info!("Opening camera {device}");
        let mut capture = videoio::VideoCapture::new(device, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(Error::Camera(format!("Could not open camera {device}")));
        }
        // Reduce buffer size for lower latency
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;
        Ok(Self { capture })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Frame> {
        let mut mat = Mat::default();
        if !self.capture.read(&mut mat)? || mat.empty() {
            return Err(Error::Camera("Failed to read frame".to_string()));
        }
        mat_to_frame(&mat)
    }
}

fn tone_color(tone: Tone) -> Scalar {
    // BGR
    match tone {
        Tone::Title => Scalar::new(255.0, 255.0, 0.0, 0.0),
        Tone::Info => Scalar::new(255.0, 255.0, 255.0, 0.0),
        Tone::Hint => Scalar::new(0.0, 255.0, 255.0, 0.0),
        Tone::Success => Scalar::new(0.0, 255.0, 0.0, 0.0),
        Tone::Alert => Scalar::new(0.0, 150.0, 255.0, 0.0),
    }
}

fn to_cv_point(p: &Point2<f64>) -> Point {
    Point::new(
        f64_to_i32_clamp(p.x, i32::MIN / 2, i32::MAX / 2),
        f64_to_i32_clamp(p.y, i32::MIN / 2, i32::MAX / 2),
    )
}

fn put_text(mat: &mut Mat, text: &str, origin: Point, scale: f64, color: Scalar) -> Result<()> {
    imgproc::put_text(
        mat,
        text,
        origin,
        imgproc::FONT_HERSHEY_SIMPLEX,
        scale,
        color,
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// `highgui` window that draws the HUD
pub struct HighguiDisplay {
    window: String,
    delay_ms: i32,
}

impl HighguiDisplay {
    /// Create the window
    ///
    /// # Errors
    ///
    /// Returns an error if no GUI backend is available.
    pub fn new(window: &str, delay_ms: i32) -> Result<Self> {
        highgui::named_window(window, highgui::WINDOW_NORMAL)?;
        Ok(Self {
            window: window.to_string(),
            delay_ms: delay_ms.max(1),
        })
    }

    fn draw(mat: &mut Mat, hud: &[Hud]) -> Result<()> {
        let mut line = 0;
        for item in hud {
            match item {
                Hud::Status { text, tone } => {
                    line += 1;
                    let scale = if *tone == Tone::Title { 0.7 } else { 0.55 };
                    put_text(mat, text, Point::new(10, 30 * line), scale, tone_color(*tone))?;
                }
                Hud::Face {
                    bounds,
                    label,
                    accepted,
                } => {
                    let rect = Rect::new(
                        u32_to_i32(bounds.x)?,
                        u32_to_i32(bounds.y)?,
                        u32_to_i32(bounds.width)?,
                        u32_to_i32(bounds.height)?,
                    );
                    let color = if *accepted {
                        Scalar::new(0.0, 255.0, 0.0, 0.0)
                    } else {
                        Scalar::new(0.0, 0.0, 255.0, 0.0)
                    };
                    imgproc::rectangle(mat, rect, color, 2, imgproc::LINE_8, 0)?;
                    if !label.is_empty() {
                        put_text(mat, label, Point::new(rect.x, (rect.y - 10).max(10)), 0.6, color)?;
                    }
                }
                Hud::Marker { id, corners } => {
                    let outline: Vector<Point> = corners.iter().map(to_cv_point).collect();
                    let mut polygons: Vector<Vector<Point>> = Vector::new();
                    polygons.push(outline);
                    imgproc::polylines(mat, &polygons, true, Scalar::new(0.0, 255.0, 0.0, 0.0), 2, imgproc::LINE_8, 0)?;
                    put_text(mat, &format!("id={id}"), to_cv_point(&corners[0]), 0.5, Scalar::new(0.0, 0.0, 255.0, 0.0))?;
                }
                Hud::MenuOverlay { anchor, entries } => {
                    let right = anchor.iter().map(|p| p.x).fold(f64::MIN, f64::max);
                    let top = anchor.iter().map(|p| p.y).fold(f64::MAX, f64::min);
                    let origin = to_cv_point(&Point2::new(right + 20.0, top));
                    put_text(mat, "=== CAR SHOWROOM ===", origin, 0.7, tone_color(Tone::Title))?;
                    for (row, entry) in (1..).zip(entries) {
                        let color = if entry.highlighted {
                            tone_color(Tone::Success)
                        } else {
                            tone_color(Tone::Info)
                        };
                        let at = Point::new(origin.x + 10, origin.y + 45 * row);
                        put_text(mat, &format!("{}. {}", entry.ordinal, entry.label), at, 0.6, color)?;
                        if !entry.description.is_empty() {
                            put_text(mat, &entry.description, Point::new(at.x + 20, at.y + 20), 0.45, color)?;
                        }
                    }
                }
                Hud::Diagnostic(text) => {
                    let center = Point::new(mat.cols() / 3, mat.rows() / 2);
                    put_text(mat, text, center, 0.8, Scalar::new(0.0, 0.0, 255.0, 0.0))?;
                }
            }
        }
        Ok(())
    }
}

impl Display for HighguiDisplay {
    fn show(&mut self, frame: &Frame, hud: &[Hud]) -> Result<()> {
        let mut mat = frame_to_mat(frame)?;
        Self::draw(&mut mat, hud)?;
        highgui::imshow(&self.window, &mat)?;
        Ok(())
    }

    fn poll_key(&mut self) -> Result<Option<Key>> {
        let code = highgui::wait_key(self.delay_ms)?;
        if code < 0 {
            return Ok(None);
        }
        Ok(Key::from_code(code & 0xFF))
    }
}

impl Drop for HighguiDisplay {
    fn drop(&mut self) {
        let _ = highgui::destroy_window(&self.window);
    }
}

/// Haar cascade face detector
pub struct HaarFaceDetector {
    classifier: CascadeClassifier,
}

impl HaarFaceDetector {
    /// Load a cascade file
    ///
    /// # Errors
    ///
    /// Returns `FaceDetection` if the cascade cannot be loaded.
    pub fn new(cascade: &Path) -> Result<Self> {
        let path = cascade
            .to_str()
            .ok_or_else(|| Error::FaceDetection(format!("Non UTF-8 cascade path: {}", cascade.display())))?;
        let classifier = CascadeClassifier::new(path)?;
        if classifier.empty()? {
            return Err(Error::FaceDetection(format!("Could not load cascade {path}")));
        }
        Ok(Self { classifier })
    }
}

impl FaceDetector for HaarFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>> {
        let bgr = frame_to_mat(frame)?;
        let mut gray = Mat::default();
        imgproc::cvt_color(&bgr, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;

        let mut faces: Vector<Rect> = Vector::new();
        self.classifier
            .detect_multi_scale(&gray, &mut faces, 1.1, 5, 0, Size::new(30, 30), Size::default())?;

        faces
            .iter()
            .map(|rect| {
                Ok(FaceBox::new(
                    i32_to_u32(rect.x)?,
                    i32_to_u32(rect.y)?,
                    i32_to_u32(rect.width)?,
                    i32_to_u32(rect.height)?,
                ))
            })
            .collect()
    }
}

/// ArUco `DICT_6X6_250` marker detector
pub struct ArucoMarkerDetector {
    detector: ArucoDetector,
}

impl ArucoMarkerDetector {
    /// # Errors
    ///
    /// Returns an error if the dictionary cannot be created.
    pub fn new() -> Result<Self> {
        let dictionary = objdetect::get_predefined_dictionary(PredefinedDictionaryType::DICT_6X6_250)?;
        let parameters = objdetect::DetectorParameters::default()?;
        let refine = objdetect::RefineParameters::new(10.0, 3.0, true)?;
        let detector = ArucoDetector::new(&dictionary, &parameters, refine)?;
        info!("ArUco detector ready (DICT_6X6_250)");
        Ok(Self { detector })
    }
}

impl MarkerDetector for ArucoMarkerDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedMarker>> {
        let bgr = frame_to_mat(frame)?;
        let mut corners: Vector<Vector<Point2f>> = Vector::new();
        let mut ids: Vector<i32> = Vector::new();
        let mut rejected: Vector<Vector<Point2f>> = Vector::new();
        self.detector
            .detect_markers(&bgr, &mut corners, &mut ids, &mut rejected)?;

        let mut markers = Vec::with_capacity(ids.len());
        for (id, quad) in ids.iter().zip(corners.iter()) {
            if quad.len() != 4 {
                debug!("Marker {id} has {} corners", quad.len());
                continue;
            }
            let mut points = [Point2::origin(); 4];
            for (point, corner) in points.iter_mut().zip(quad.iter()) {
                *point = Point2::new(f64::from(corner.x), f64::from(corner.y));
            }
            markers.push(DetectedMarker { id, corners: points });
        }
        Ok(markers)
    }
}

/// `solvePnP` with the square-marker IPPE method
#[derive(Debug, Default, Clone, Copy)]
pub struct PnpPoseSolver;

impl PoseSolver for PnpPoseSolver {
    fn solve(
        &self,
        corners: &[Point2<f64>; 4],
        marker_size: f64,
        intrinsics: &CameraIntrinsics,
        distortion: &Distortion,
    ) -> Result<(Rotation3<f64>, Vector3<f64>)> {
        check_corners(corners)?;

        // IPPE_SQUARE expects the corner order of `marker_object_points`.
        let object_points: Vector<Point3d> = marker_object_points(marker_size)
            .iter()
            .map(|p| Point3d::new(p.x, p.y, p.z))
            .collect();
        let image_points: Vector<Point2d> = corners.iter().map(|c| Point2d::new(c.x, c.y)).collect();
        let camera_matrix = Mat::from_slice_2d(&[
            [intrinsics.fx, 0.0, intrinsics.cx],
            [0.0, intrinsics.fy, intrinsics.cy],
            [0.0, 0.0, 1.0],
        ])?;
        let dist_coeffs = Mat::from_slice_2d(&[[
            distortion.k1,
            distortion.k2,
            distortion.p1,
            distortion.p2,
            distortion.k3,
        ]])?;

        let mut rvec = Mat::default();
        let mut tvec = Mat::default();
        let solved = calib3d::solve_pnp(
            &object_points,
            &image_points,
            &camera_matrix,
            &dist_coeffs,
            &mut rvec,
            &mut tvec,
            false,
            calib3d::SOLVEPNP_IPPE_SQUARE,
        )?;
        if !solved {
            return Err(Error::PoseSolve("solvePnP found no solution".to_string()));
        }

        let mut rotation_mat = Mat::default();
        calib3d::rodrigues(&rvec, &mut rotation_mat, &mut Mat::default())?;

        let mut rotation = Matrix3::zeros();
        for (row, r) in (0..3).zip(0_i32..) {
            for (col, c) in (0..3).zip(0_i32..) {
                rotation[(row, col)] = *rotation_mat.at_2d::<f64>(r, c)?;
            }
        }
        let translation = Vector3::new(
            *tvec.at_2d::<f64>(0, 0)?,
            *tvec.at_2d::<f64>(1, 0)?,
            *tvec.at_2d::<f64>(2, 0)?,
        );
        let rotation = Rotation3::from_matrix_unchecked(rotation);

        check_solution(corners, marker_size, &rotation, &translation, intrinsics, distortion)?;
        Ok((rotation, translation))
    }
}

/// Trained LBPH model for one identity
pub struct LbphPredictor {
    recognizer: Ptr<LBPHFaceRecognizer>,
}

impl FacePredictor for LbphPredictor {
    fn predict(&self, face: &GrayImage) -> Result<f64> {
        let mat = gray_to_mat(face)?;
        let mut label = -1;
        let mut confidence = 0.0;
        self.recognizer
            .predict(&mat, &mut label, &mut confidence)
            .map_err(|e| Error::Prediction(e.to_string()))?;
        Ok(confidence)
    }
}

/// Trains and loads one LBPH model file per identity
#[derive(Debug, Default, Clone, Copy)]
pub struct LbphBackend;

fn utf8_path(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Persistence(format!("Non UTF-8 path: {}", path.display())))
}

impl FaceModelBackend for LbphBackend {
    fn train(&self, samples: &[GrayImage], label: i32, path: &Path) -> Result<()> {
        let mut images: Vector<Mat> = Vector::new();
        let mut labels: Vector<i32> = Vector::new();
        for sample in samples {
            images.push(gray_to_mat(sample)?);
            labels.push(label);
        }
        let mut recognizer = LBPHFaceRecognizer::create(1, 8, 8, 8, f64::MAX)?;
        recognizer.train(&images, &labels)?;
        recognizer.write(utf8_path(path)?)?;
        info!("Trained LBPH model with {} samples -> {}", samples.len(), path.display());
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Box<dyn FacePredictor>> {
        if !path.exists() {
            return Err(Error::Persistence(format!("Model not found: {}", path.display())));
        }
        let mut recognizer = LBPHFaceRecognizer::create(1, 8, 8, 8, f64::MAX)?;
        recognizer.read(utf8_path(path)?)?;
        Ok(Box::new(LbphPredictor { recognizer }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose_estimation::project_marker;

    #[test]
    fn test_pnp_recovers_tilted_marker() {
        let intrinsics = CameraIntrinsics::estimated(640, 480);
        let distortion = Distortion::from_coefficients([0.05, -0.01, 0.0, 0.0, 0.0]);
        let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
            * Rotation3::from_euler_angles(0.3, -0.2, 0.5);
        let translation = Vector3::new(0.03, -0.02, 0.45);
        let corners = project_marker(&rotation, &translation, 0.05, &intrinsics, &distortion).unwrap();

        let (r, t) = PnpPoseSolver.solve(&corners, 0.05, &intrinsics, &distortion).unwrap();
        assert!((t - translation).norm() < 1e-3);
        assert!(r.angle_to(&rotation) < 1e-2);
    }

    #[test]
    fn test_pnp_rejects_degenerate_corners() {
        let intrinsics = CameraIntrinsics::estimated(640, 480);
        let p = Point2::new(50.0, 50.0);
        let result = PnpPoseSolver.solve(&[p; 4], 0.05, &intrinsics, &Distortion::default());
        assert!(matches!(result, Err(Error::PoseSolve(_))));
    }
}
