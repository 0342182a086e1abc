//! Base64 helpers for `b64_json` image payloads

use base64::{engine::general_purpose::STANDARD, Engine};
use crate::error::{AppError, RemoteErrorKind, Result};

/// Decode an image payload returned by the provider
pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    // Handle data URL format (e.g., "data:image/png;base64,...")
    let data = match encoded.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };

    STANDARD.decode(data.trim()).map_err(|e| {
        AppError::remote(
            RemoteErrorKind::InvalidResponse,
            format!("Invalid base64 image data: {}", e),
        )
    })
}
