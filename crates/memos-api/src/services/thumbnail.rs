//! Thumbnail derivation for raster image attachments.
//!
//! Images are decoded, shrunk with nearest-neighbour sampling to fit within
//! a square bound (never enlarged) and re-encoded as JPEG.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use memos_core::defaults::{
    THUMBNAIL_JPEG_QUALITY, THUMBNAIL_KEY_SUFFIX, THUMBNAIL_MAX_DIMENSION,
};
use memos_core::{Error, Result};

const RASTER_CONTENT_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/gif",
    "image/webp",
];

const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Whether the content type or filename extension names a supported raster image.
pub fn is_thumbnailable(content_type: &str, filename: &str) -> bool {
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if RASTER_CONTENT_TYPES.contains(&content_type.as_str()) {
        return true;
    }
    filename
        .rsplit_once('.')
        .map(|(_, ext)| RASTER_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Storage key of the thumbnail of the object at `storage_key`.
pub fn thumbnail_key(storage_key: &str) -> String {
    format!("{}{}", storage_key, THUMBNAIL_KEY_SUFFIX)
}

/// Display filename of the thumbnail of `filename`.
pub fn thumbnail_filename(filename: &str) -> String {
    format!("{}{}", filename, THUMBNAIL_KEY_SUFFIX)
}

/// Target dimensions fitting `(width, height)` inside `bound`, preserving
/// aspect ratio without upscaling.
pub fn fit_within(width: u32, height: u32, bound: u32) -> (u32, u32) {
    if width <= bound && height <= bound {
        return (width, height);
    }
    let scale = f64::min(bound as f64 / width as f64, bound as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, bound);
    let h = ((height as f64 * scale).round() as u32).clamp(1, bound);
    (w, h)
}

/// Decode `source` and encode its thumbnail as JPEG.
pub fn generate(source: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(source)
        .map_err(|e| Error::InvalidInput(format!("undecodable image: {}", e)))?;
    let (w, h) = fit_within(img.width(), img.height(), THUMBNAIL_MAX_DIMENSION);
    let img = if (w, h) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(w, h, FilterType::Nearest)
    };

    let rgb = img.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, THUMBNAIL_JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| Error::Internal(format!("jpeg encode failed: {}", e)))?;
    Ok(out.into_inner())
}

/// [`generate`] on the blocking pool.
pub async fn generate_async(source: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || generate(&source))
        .await
        .map_err(|e| Error::Internal(format!("thumbnail task failed: {}", e)))?
}
