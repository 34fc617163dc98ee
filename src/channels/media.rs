//! Eager image encoding for the channel layer.
//!
//! Channels own short-lived temp files; images must be read and encoded
//! before the channel-side cleanup deletes them.

use std::path::Path;

use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::bus::EncodedImage;

/// Upper bound (20 MiB) for a single image file. Larger files are
/// silently skipped to protect memory and API limits.
const MAX_IMAGE_SIZE: u64 = 20 * 1024 * 1024;

/// MIME types accepted by vision-capable LLMs.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Read image files from disk, sniff their MIME type, and return
/// base64-encoded representations. Non-image files, oversized files, and
/// unreadable paths are silently skipped.
pub async fn encode_image_media(media_paths: &[String]) -> Vec<EncodedImage> {
    let mut images = Vec::new();
    for path in media_paths {
        if let Some(img) = encode_one_image(Path::new(path)).await {
            images.push(img);
        }
    }
    images
}

async fn encode_one_image(path: &Path) -> Option<EncodedImage> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipping unreadable media file");
            return None;
        }
    };

    if meta.len() > MAX_IMAGE_SIZE {
        warn!(
            path = %path.display(),
            size_mb = meta.len() / (1024 * 1024),
            limit_mb = MAX_IMAGE_SIZE / (1024 * 1024),
            "skipping oversized media file"
        );
        return None;
    }

    let data = match tokio::fs::read(path).await {
        Ok(d) => d,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read media file");
            return None;
        }
    };

    let media_type = detect_image_type(&data)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
    info!(
        path = %path.display(),
        media_type = %media_type,
        size_bytes = data.len(),
        "encoded image for LLM"
    );

    Some(EncodedImage {
        media_type: media_type.to_string(),
        data: encoded,
    })
}

/// Sniff the file content for a supported image MIME type. Returns
/// `None` for non-image or unsupported types.
fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    let head = &data[..data.len().min(512)];
    if head.is_empty() {
        return None;
    }

    let sniffed = crate::attachments::sniff_content_type(head);
    SUPPORTED_IMAGE_TYPES
        .iter()
        .find(|&&t| t == sniffed)
        .copied()
}
