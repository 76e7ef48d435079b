//! Image ingestion: multipart upload, local path, remote URL.
//!
//! Every source decodes to an `RgbImage`; sizing is left entirely to the
//! aligner.

use image::RgbImage;
use std::path::Path;

use crate::error::ApiError;

const ALLOWED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "tiff"];

fn allowed_file(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn decode(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Decode an uploaded image after checking its file extension.
pub fn decode_upload(filename: &str, bytes: &[u8]) -> Result<RgbImage, ApiError> {
    if filename.is_empty() {
        return Err(ApiError::BadRequest("No file selected".into()));
    }
    if !allowed_file(filename) {
        return Err(ApiError::BadRequest(
            "Invalid file type. Allowed: png, jpg, jpeg, gif, bmp, tiff".into(),
        ));
    }
    decode(bytes)
        .map_err(|e| ApiError::BadRequest(format!("Error processing uploaded image: {e}")))
}

/// Load an image from a path on the daemon's filesystem.
pub async fn load_from_path(path: &str) -> Result<RgbImage, ApiError> {
    if !Path::new(path).exists() {
        return Err(ApiError::NotFound(path.to_string()));
    }
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Unable to load image from {path}: {e}")))?;
    decode(&bytes).map_err(|e| ApiError::BadRequest(format!("Unable to load image from {path}: {e}")))
}

/// Fetch and decode an image over HTTP(S).
pub async fn fetch_from_url(client: &reqwest::Client, url: &str) -> Result<RgbImage, ApiError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ApiError::BadRequest(format!("Invalid URL: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::BadRequest(format!(
            "Unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }

    let response = client
        .get(parsed)
        .send()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Error loading image from URL: {e}")))?;
    if !response.status().is_success() {
        return Err(ApiError::BadRequest(format!(
            "Error loading image from URL: HTTP {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Error loading image from URL: {e}")))?;
    decode(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("Unable to decode image from URL: {e}")))
}
