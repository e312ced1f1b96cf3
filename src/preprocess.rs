use std::io::Cursor;

use image::{DynamicImage, ImageError, ImageReader, imageops::FilterType};
use ndarray::Array4;

use crate::error::ServiceError;

/// Side length of the square input the network was trained on.
pub const IMAGE_SIZE: u32 = 198;

pub const CHANNELS: usize = 3;

/// Decodes an uploaded image and turns it into a `(1, 198, 198, 3)` tensor
/// with channel values scaled to `[0, 1]`.
pub fn preprocess_image(bytes: &[u8]) -> Result<Array4<f32>, ServiceError> {
    let image = decode_image(bytes)?;

    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom);

    let side = IMAGE_SIZE as usize;
    let values: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|v| f32::from(v) / 255.0)
        .collect();

    Array4::from_shape_vec((1, side, side, CHANNELS), values)
        .map_err(|e| ServiceError::Inference(format!("invalid input tensor shape: {e}")))
}

fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Decode("upload is empty".into()));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ServiceError::Decode(format!("failed to sniff format: {e}")))?;

    if reader.format().is_none() {
        return Err(ServiceError::Decode("unrecognized image format".into()));
    }

    let image = reader.decode().map_err(decode_error)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ServiceError::Decode("image has no pixels".into()));
    }

    Ok(image)
}

fn decode_error(err: ImageError) -> ServiceError {
    let reason = match &err {
        ImageError::Decoding(_) => "malformed image data",
        ImageError::Unsupported(_) => "unsupported image feature",
        ImageError::IoError(_) => "truncated or unreadable image stream",
        ImageError::Limits(_) => "image exceeds decoder limits",
        ImageError::Parameter(_) => "invalid image parameters",
        ImageError::Encoding(_) => "image encoding error",
    };
    ServiceError::Decode(format!("{reason}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, ImageFormat, Luma, Rgb, Rgba, RgbaImage};

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    fn assert_normalized(tensor: &Array4<f32>) {
        assert_eq!(tensor.shape(), &[1, 198, 198, 3]);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn grayscale_png_becomes_rgb_tensor() {
        let gray = GrayImage::from_fn(400, 300, |x, _| Luma([(x % 256) as u8]));
        let bytes = encode(DynamicImage::ImageLuma8(gray), ImageFormat::Png);

        let tensor = preprocess_image(&bytes).unwrap();

        assert_normalized(&tensor);
        // grayscale expands to three identical channels
        for y in [0, 99, 197] {
            for x in [0, 50, 197] {
                let r = tensor[[0, y, x, 0]];
                assert_eq!(r, tensor[[0, y, x, 1]]);
                assert_eq!(r, tensor[[0, y, x, 2]]);
            }
        }
    }

    #[test]
    fn rgba_alpha_channel_is_dropped() {
        let rgba = RgbaImage::from_pixel(64, 32, Rgba([255, 0, 0, 10]));
        let bytes = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Png);

        let tensor = preprocess_image(&bytes).unwrap();

        assert_normalized(&tensor);
        assert!(tensor[[0, 100, 100, 0]] > 0.99);
        assert!(tensor[[0, 100, 100, 1]] < 0.01);
        assert!(tensor[[0, 100, 100, 2]] < 0.01);
    }

    #[test]
    fn solid_color_is_scaled_by_255() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(250, 250, Rgb([51, 102, 255]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Jpeg);

        let tensor = preprocess_image(&bytes).unwrap();

        assert_normalized(&tensor);
        let blue = tensor[[0, 10, 10, 2]];
        assert!(blue > 0.95, "blue channel was {blue}");
    }

    #[test]
    fn tiny_image_is_upscaled() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(1, 1, Rgb([0, 0, 0]));
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Bmp);

        let tensor = preprocess_image(&bytes).unwrap();

        assert_normalized(&tensor);
        assert!(tensor.iter().all(|v| *v < 0.01));
    }

    #[test]
    fn text_file_is_a_decode_error() {
        let err = preprocess_image(b"this is definitely not a photo").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[test]
    fn empty_upload_is_a_decode_error() {
        let err = preprocess_image(&[]).unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[test]
    fn truncated_png_is_a_decode_error() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(120, 80, |x, y| {
            Rgb([x as u8, y as u8, (x ^ y) as u8])
        });
        let bytes = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);
        let truncated = &bytes[..bytes.len() / 2];

        let err = preprocess_image(truncated).unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }
}
