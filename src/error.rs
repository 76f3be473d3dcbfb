//! Error types for the AR showroom library.

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// `OpenCV` operation failed
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCV(#[from] opencv::Error),

    /// File I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image processing operation failed
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input parameters provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Frame acquisition failed; ends the session loop
    #[error("Camera error: {0}")]
    Camera(String),

    /// Marker detection failed for the whole frame
    #[error("Marker detection error: {0}")]
    MarkerDetection(String),

    /// Planar pose solve failed for one marker
    #[error("Pose solve error: {0}")]
    PoseSolve(String),

    /// Face detection failed
    #[error("Face detection error: {0}")]
    FaceDetection(String),

    /// A face predictor rejected its input
    #[error("Prediction error: {0}")]
    Prediction(String),

    /// Asset path did not resolve
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    /// Asset could not be parsed or normalized
    #[error("Asset load error: {0}")]
    AssetLoad(String),

    /// Off-screen render pass or scene setup failed
    #[error("Render error: {0}")]
    Render(String),

    /// Audio capture or transcription failed
    #[error("Voice error: {0}")]
    Voice(String),

    /// Id map or model storage failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Filter initialization or processing error
    #[error("Filter error: {0}")]
    FilterError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic I/O error with description
    #[error("I/O error: {0}")]
    IoError(String),
}

impl Error {
    /// Whether the error must end the outer frame loop
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Camera(_))
    }
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_camera_errors_are_fatal() {
        assert!(Error::Camera("unplugged".to_string()).is_fatal());
        assert!(!Error::Render("texture".to_string()).is_fatal());
        assert!(!Error::PoseSolve("degenerate".to_string()).is_fatal());
        assert!(!Error::Voice("offline".to_string()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("missing"));
    }
}
