//! Image decoding and normalization.
//!
//! Every image goes through the same pipeline: decode, convert to RGB, pad to a square,
//! scale to `[0, 1]` and reorder to channel-first.

use std::path::Path;

use image::{
    imageops::{self, FilterType},
    RgbImage,
};

use super::DataError;

/// Decode the image at `path` and turn it into a padded `3 x num_pixel x num_pixel` buffer.
pub fn load_padded(path: &Path, num_pixel: u32) -> Result<Vec<f32>, DataError> {
    let image = image::open(path)
        .map_err(|source| DataError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    Ok(to_chw(&pad_square(&image, num_pixel)))
}

/// Fit `image` in a `size x size` square, preserving its aspect ratio.
///
/// The image is resized (bicubic) so that its longest side is `size`, then pasted in the
/// middle of a black canvas.
pub fn pad_square(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == height {
        return resize(image, size, size);
    }

    let mut canvas = RgbImage::new(size, size);
    if width > height {
        let new_height = round_half_even(height as f64 / width as f64 * size as f64) as u32;
        let resized = resize(image, size, new_height);
        let y = round_half_even((size - new_height) as f64 * 0.5) as i64;
        imageops::replace(&mut canvas, &resized, 0, y);
    } else {
        let new_width = round_half_even(width as f64 / height as f64 * size as f64) as u32;
        let resized = resize(image, new_width, size);
        let x = round_half_even((size - new_width) as f64 * 0.5) as i64;
        imageops::replace(&mut canvas, &resized, x, 0);
    }
    canvas
}

/// Resize to exactly `width x height`, skipping the work when nothing changes.
pub fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width.max(1), height.max(1), FilterType::CatmullRom)
    }
}

/// Scale the pixels to `[0, 1]` and lay them out channel-first.
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in image.enumerate_pixels() {
        let base = (y * width + x) as usize;
        chw[base] = pixel[0] as f32 / 255.0;
        chw[plane + base] = pixel[1] as f32 / 255.0;
        chw[2 * plane + base] = pixel[2] as f32 / 255.0;
    }
    chw
}

/// Round to the nearest integer, ties to even.
fn round_half_even(value: f64) -> f64 {
    let rounded = value.round();
    if (value - value.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - value.signum()
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use image::Rgb;

    use super::*;

    const RED: Rgb<u8> = Rgb([255, 0, 0]);

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(2.5), 2.0);
        assert_eq!(round_half_even(3.5), 4.0);
        assert_eq!(round_half_even(20.0), 20.0);
        assert_eq!(round_half_even(1.4), 1.0);
    }

    #[test]
    fn test_pad_wide_image() {
        let image = RgbImage::from_pixel(4, 2, RED);
        let padded = pad_square(&image, 4);
        assert_eq!(padded.dimensions(), (4, 4));
        for x in 0..4 {
            assert_eq!(*padded.get_pixel(x, 0), Rgb([0, 0, 0]));
            assert_eq!(*padded.get_pixel(x, 1), RED);
            assert_eq!(*padded.get_pixel(x, 2), RED);
            assert_eq!(*padded.get_pixel(x, 3), Rgb([0, 0, 0]));
        }
    }

    #[test]
    fn test_pad_tall_image() {
        // same aspect ratio as the aligned CelebA crops
        let image = RgbImage::from_pixel(178, 218, RED);
        let padded = pad_square(&image, 218);
        assert_eq!(padded.dimensions(), (218, 218));
        assert_eq!(*padded.get_pixel(19, 100), Rgb([0, 0, 0]));
        assert_eq!(*padded.get_pixel(20, 100), RED);
        assert_eq!(*padded.get_pixel(197, 100), RED);
        assert_eq!(*padded.get_pixel(198, 100), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_to_chw() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 51]));
        image.put_pixel(1, 0, Rgb([0, 255, 0]));
        assert_eq!(to_chw(&image), vec![1.0, 0.0, 0.0, 1.0, 0.2, 0.0]);
    }

    #[test]
    fn test_load_padded() {
        let dir = env::temp_dir().join(format!("fedrun-image-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("face.png");
        RgbImage::from_pixel(6, 9, Rgb([10, 20, 30])).save(&path).unwrap();

        let values = load_padded(&path, 8).unwrap();
        assert_eq!(values.len(), 3 * 8 * 8);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        assert!(matches!(
            load_padded(&dir.join("missing.png"), 8),
            Err(DataError::Image { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
