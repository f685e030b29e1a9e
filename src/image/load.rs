//! Image loading utilities.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Load an image from disk and convert to a normalized tensor.
///
/// The image is converted to RGB if necessary, normalized to [-1, 1] and
/// returned as an NCHW tensor at its own resolution, along with the pixel
/// dimensions as `(width, height)`.
///
/// # Errors
///
/// Returns an error if the image cannot be loaded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<(ImageTensor, (u32, u32))> {
    let path = path.as_ref();

    let img = image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;

    let (width, height) = img.dimensions();
    let tensor = image_to_tensor(&img, width, height);

    Ok((tensor, (width, height)))
}

/// Convert a `DynamicImage` to a normalized NCHW tensor of the given size.
///
/// The image is resized to exactly `width`x`height` using Lanczos3; aspect
/// ratio is not preserved, the target dimensions win.
#[allow(clippy::cast_possible_truncation)]
pub fn image_to_tensor(img: &DynamicImage, width: u32, height: u32) -> ImageTensor {
    let resized = if img.dimensions() == (width, height) {
        img.clone()
    } else {
        img.resize_exact(width, height, FilterType::Lanczos3)
    };
    let rgb = resized.to_rgb8();

    let (width, height) = (width as usize, height as usize);

    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, height, width));

    for y in 0..height {
        for x in 0..width {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            // Normalize from [0, 255] to [-1, 1]
            tensor[[0, 0, y, x]] = (f32::from(pixel[0]) / 127.5) - 1.0;
            tensor[[0, 1, y, x]] = (f32::from(pixel[1]) / 127.5) - 1.0;
            tensor[[0, 2, y, x]] = (f32::from(pixel[2]) / 127.5) - 1.0;
        }
    }

    tensor
}
