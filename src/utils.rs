//! Numeric and image conversion helpers.

pub mod safe_cast;

/// Conversions between `image` buffers and `OpenCV` matrices
#[cfg(feature = "opencv")]
pub mod image_conversion;
