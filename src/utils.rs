//! Utility functions and helpers shared by the pipeline stages

use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, DynamicImage};

use crate::error::Result;

/// Encode an image as JPEG bytes at the given quality
pub(crate) fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(&rgb)?;
    Ok(buffer.into_inner())
}

/// Encode an image as a base64 JPEG string, the form both remote services accept
pub(crate) fn encode_image_base64(image: &DynamicImage, quality: u8) -> Result<String> {
    Ok(STANDARD.encode(encode_jpeg(image, quality)?))
}

/// Ensure a directory exists, creating it if necessary
pub(crate) fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// File name for a saved crop, e.g. `frame_000003_crop_0007_person.jpg`
pub(crate) fn crop_filename(frame_index: usize, crop_index: usize, label: Option<&str>) -> String {
    match label.map(sanitize_label).filter(|l| !l.is_empty()) {
        Some(label) => format!("frame_{:06}_crop_{:04}_{}.jpg", frame_index, crop_index, label),
        None => format!("frame_{:06}_crop_{:04}.jpg", frame_index, crop_index),
    }
}

/// Keep only characters that are safe in file names
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Trim trailing slashes so paths can be appended to a base URL
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_crop_filename() {
        assert_eq!(crop_filename(3, 7, Some("person")), "frame_000003_crop_0007_person.jpg");
        assert_eq!(crop_filename(0, 0, None), "frame_000000_crop_0000.jpg");
        assert_eq!(
            crop_filename(1, 2, Some("traffic light")),
            "frame_000001_crop_0002_traffic_light.jpg"
        );
        assert_eq!(crop_filename(1, 2, Some("")), "frame_000001_crop_0002.jpg");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://localhost:8761/", "/detect/"), "http://localhost:8761/detect/");
        assert_eq!(join_url("http://localhost:8762", "encode-image/"), "http://localhost:8762/encode-image/");
    }

    #[test]
    fn test_encode_image_base64_round_trips_through_decoder() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, image::Rgb([200, 10, 10])));
        let encoded = encode_image_base64(&img, 90).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn test_ensure_dir_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        ensure_dir_exists(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir_exists(&nested).unwrap();
    }
}
