//! Image saving utilities.

use std::path::Path;

use image::{ImageBuffer, Rgb};

use crate::error::{Error, Result};

use super::ImageTensor;

/// Save a tensor as an image file.
///
/// The tensor is denormalized from [-1, 1] to [0, 255] and saved to the
/// specified path, with the format inferred from the extension.
///
/// # Arguments
///
/// * `tensor` - NCHW tensor with values in [-1, 1]
/// * `path` - Output file path
/// * `quality` - JPEG quality (1-100), ignored for other formats
///
/// # Errors
///
/// Returns an error if the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(tensor: &ImageTensor, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();

    let img = tensor_to_image(tensor);
    let final_img = image::DynamicImage::ImageRgb8(img);

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let mut output = std::fs::File::create(path)?;
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            final_img
                .write_with_encoder(encoder)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        _ => {
            final_img.save(path).map_err(|source| Error::ImageSave {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    Ok(())
}

/// Convert a normalized NCHW tensor to an RGB image.
#[allow(clippy::cast_possible_truncation)]
pub fn tensor_to_image(tensor: &ImageTensor) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let height = tensor.shape()[2];
    let width = tensor.shape()[3];

    let mut img = ImageBuffer::new(width as u32, height as u32);

    for y in 0..height {
        for x in 0..width {
            // Denormalize from [-1, 1] to [0, 255]
            let r = denormalize(tensor[[0, 0, y, x]]);
            let g = denormalize(tensor[[0, 1, y, x]]);
            let b = denormalize(tensor[[0, 2, y, x]]);

            img.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
        }
    }

    img
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    // Safe: clamped to [0, 255] range before casting
    let scaled = (value + 1.0) * 127.5;
    scaled.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denormalize() {
        assert_eq!(denormalize(-1.0), 0);
        assert_eq!(denormalize(0.0), 127);
        assert_eq!(denormalize(1.0), 255);
    }

    #[test]
    fn test_denormalize_clamp() {
        assert_eq!(denormalize(-2.0), 0);
        assert_eq!(denormalize(2.0), 255);
    }

    #[test]
    fn test_tensor_to_image_dimensions() {
        let tensor = ImageTensor::zeros((1, 3, 16, 24));
        let img = tensor_to_image(&tensor);

        assert_eq!(img.dimensions(), (24, 16));
    }
}
