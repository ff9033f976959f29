//! Loading and encoding images for vision requests.

use crate::error::{LlmError, Result};
use crate::types::{ContentPart, ImageInput};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MEDIA_TYPE: &str = "image/jpeg";

const SUPPORTED: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Turn an image reference into a base64 content part with a media type.
pub fn process_image(input: &ImageInput) -> Result<ContentPart> {
    match input {
        ImageInput::Path(path) => load_path(path),
        ImageInput::Data(data) => load_data(data),
    }
}

/// `data:<media>;base64,<payload>` for vendors that take image URLs.
pub fn data_url(data: &str, media_type: &str) -> String {
    format!("data:{media_type};base64,{data}")
}

fn load_path(path: &Path) -> Result<ContentPart> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| LlmError::InvalidInput(format!("image {}: {e}", path.display())))?;
    if metadata.len() > MAX_IMAGE_BYTES as u64 {
        return Err(LlmError::InvalidInput(format!(
            "image {} is {} bytes; limit is {MAX_IMAGE_BYTES}",
            path.display(),
            metadata.len()
        )));
    }
    let bytes = std::fs::read(path)?;
    let media_type = sniff_media_type(&bytes)
        .or_else(|| media_type_from_extension(path))
        .ok_or_else(|| {
            LlmError::InvalidInput(format!("unsupported image format: {}", path.display()))
        })?;
    Ok(ContentPart::Image {
        data: STANDARD.encode(&bytes),
        media_type: media_type.to_string(),
    })
}

fn load_data(data: &str) -> Result<ContentPart> {
    let data = data.trim();
    let (declared, payload) = match data.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest.split_once(',').ok_or_else(|| {
                LlmError::InvalidInput("data URL is missing its payload".to_string())
            })?;
            let media = header.strip_suffix(";base64").ok_or_else(|| {
                LlmError::InvalidInput("only base64 data URLs are supported".to_string())
            })?;
            (Some(media.to_ascii_lowercase()), payload)
        }
        None => (None, data),
    };

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| LlmError::InvalidInput(format!("image is not valid base64: {e}")))?;
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(LlmError::InvalidInput(format!(
            "image is {} bytes; limit is {MAX_IMAGE_BYTES}",
            bytes.len()
        )));
    }

    let media_type = match declared {
        Some(media) if SUPPORTED.contains(&media.as_str()) => media,
        Some(media) => {
            return Err(LlmError::InvalidInput(format!(
                "unsupported image media type: {media}"
            )));
        }
        None => sniff_media_type(&bytes)
            .unwrap_or(DEFAULT_MEDIA_TYPE)
            .to_string(),
    };

    Ok(ContentPart::Image {
        data: payload.to_string(),
        media_type,
    })
}

pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn media_type_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
