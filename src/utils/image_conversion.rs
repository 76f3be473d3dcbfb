//! Conversions between `image` buffers and `OpenCV` matrices.
//!
//! `OpenCV` frames are BGR; [`Frame`] buffers are RGB.

use crate::utils::safe_cast::{i32_to_u32, u32_to_i32};
use crate::{Error, Frame, Result};
use image::GrayImage;
use opencv::core::{Mat, Scalar, CV_8UC1, CV_8UC3};
use opencv::prelude::*;

fn continuous(mat: &Mat) -> Result<std::borrow::Cow<'_, Mat>> {
    if mat.is_continuous() {
        Ok(std::borrow::Cow::Borrowed(mat))
    } else {
        Ok(std::borrow::Cow::Owned(mat.try_clone()?))
    }
}

/// Convert a BGR `CV_8UC3` matrix into an RGB frame
///
/// # Errors
///
/// Returns an error if the matrix is empty or not 8-bit, 3-channel.
pub fn mat_to_frame(mat: &Mat) -> Result<Frame> {
    if mat.empty() {
        return Err(Error::InvalidInput("Empty Mat".to_string()));
    }
    if mat.typ() != CV_8UC3 {
        return Err(Error::InvalidInput(format!("Expected CV_8UC3 Mat, got type {}", mat.typ())));
    }
    let width = i32_to_u32(mat.cols())?;
    let height = i32_to_u32(mat.rows())?;
    let mat = continuous(mat)?;

    let mut data = mat.data_bytes()?.to_vec();
    for pixel in data.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    Frame::from_raw(width, height, data)
        .ok_or_else(|| Error::InvalidInput(format!("Mat data does not fill {width}x{height}")))
}

/// Convert an RGB frame into a BGR `CV_8UC3` matrix
///
/// # Errors
///
/// Returns an error if the frame is too large or allocation fails.
pub fn frame_to_mat(frame: &Frame) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(
        u32_to_i32(frame.height())?,
        u32_to_i32(frame.width())?,
        CV_8UC3,
        Scalar::all(0.0),
    )?;
    let bytes = mat.data_bytes_mut()?;
    for (dst, src) in bytes.chunks_exact_mut(3).zip(frame.as_raw().chunks_exact(3)) {
        dst[0] = src[2];
        dst[1] = src[1];
        dst[2] = src[0];
    }
    Ok(mat)
}

/// Convert a grayscale image into a `CV_8UC1` matrix
///
/// # Errors
///
/// Returns an error if the image is too large or allocation fails.
pub fn gray_to_mat(image: &GrayImage) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(
        u32_to_i32(image.height())?,
        u32_to_i32(image.width())?,
        CV_8UC1,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}
