//! File storage for generated images

use chrono::Utc;
use png::text_metadata::{EncodableTextChunk, ITXtChunk, TEXtChunk};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::client::types::GeneratedImage;
use crate::error::{AppError, Result};

/// Longest full path we are willing to produce
pub const MAX_PATH_LEN: usize = 200;

/// Room always left for the prompt part of a file name
pub const LEAST_NAME_LEN: usize = 10;

const INVALID_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|'];

/// PNG signature plus the IHDR chunk, which must stay first
const PNG_HEADER_LEN: usize = 8 + 4 + 4 + 13 + 4;

/// Metadata written next to every saved image
#[derive(Debug, Serialize)]
struct ImageMetadata<'a> {
    prompt: &'a str,
    revised_prompt: Option<&'a str>,
    saved_at: String,
}

/// Writes generated images into the configured save directory
pub struct ImageStore {
    save_dir: PathBuf,
}

impl ImageStore {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    /// Ensure the save directory exists
    pub async fn ensure_save_dir(&self) -> Result<()> {
        if !self.save_dir.exists() {
            fs::create_dir_all(&self.save_dir).await?;
            debug!(path = ?self.save_dir, "Created save directory");
        }
        Ok(())
    }

    /// Build the target path for an image, truncating the prompt so the
    /// whole path stays under [`MAX_PATH_LEN`] characters.
    pub fn prepare_path(&self, prompt: &str, stamp: &str, ext: &str) -> Result<PathBuf> {
        let suffix = format!("-{}.{}", stamp, ext);
        let suffix_len = suffix.chars().count();
        let dir_len = absolute(&self.save_dir)?.to_string_lossy().chars().count();

        let allowed = MAX_PATH_LEN as isize
            - dir_len as isize
            - suffix_len as isize
            - LEAST_NAME_LEN as isize;
        if allowed <= 0 {
            return Err(AppError::Validation(
                "The file path is too long, please choose another save directory".to_string(),
            ));
        }

        let mut name = sanitize(prompt);
        if (name.chars().count() + suffix_len) as isize > allowed {
            let keep = (allowed - suffix_len as isize - 3).max(0) as usize;
            name = name.chars().take(keep).collect::<String>() + "...";
        }

        Ok(self.save_dir.join(name + &suffix))
    }

    /// Save an image plus a JSON sidecar holding its prompts. PNG files also
    /// carry the prompts as text chunks.
    pub async fn save(&self, prompt: &str, stamp: &str, image: &GeneratedImage) -> Result<PathBuf> {
        let ext = detect_image_format(&image.data).unwrap_or("png");
        let path = self.prepare_path(prompt, stamp, ext)?;
        self.ensure_save_dir().await?;

        let mut text = vec![("prompt", prompt)];
        if let Some(revised) = image.revised_prompt.as_deref() {
            text.push(("revised_prompt", revised));
        }
        fs::write(&path, embed_text(&image.data, &text)?).await?;

        let metadata = ImageMetadata {
            prompt,
            revised_prompt: image.revised_prompt.as_deref(),
            saved_at: Utc::now().to_rfc3339(),
        };
        fs::write(path.with_extension("json"), serde_json::to_vec_pretty(&metadata)?).await?;

        info!(path = ?path, size = image.data.len(), "Saved image file");
        Ok(path)
    }
}

fn sanitize(prompt: &str) -> String {
    prompt
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Insert text chunks right after IHDR. Anything that is not a PNG is
/// returned unchanged.
pub fn embed_text(data: &[u8], entries: &[(&str, &str)]) -> Result<Vec<u8>> {
    let is_png = detect_image_format(data) == Some("png")
        && data.len() >= PNG_HEADER_LEN
        && data[8..16] == [0, 0, 0, 13, b'I', b'H', b'D', b'R'];
    if !is_png {
        return Ok(data.to_vec());
    }

    let mut out = Vec::with_capacity(data.len() + 512);
    out.extend_from_slice(&data[..PNG_HEADER_LEN]);
    for (keyword, text) in entries {
        // tEXt is Latin-1 only
        let written = if text.chars().all(|c| (c as u32) < 0x100) {
            TEXtChunk::new(*keyword, *text).encode(&mut out)
        } else {
            ITXtChunk::new(*keyword, *text).encode(&mut out)
        };
        written.map_err(|e| AppError::Internal(format!("Failed to write PNG text chunk: {}", e)))?;
    }
    out.extend_from_slice(&data[PNG_HEADER_LEN..]);
    Ok(out)
}

fn absolute(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        Ok(dir.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(dir))
    }
}

/// Detect image format from binary data using magic bytes
pub fn detect_image_format(data: &[u8]) -> Option<&'static str> {
    if data.len() < 8 {
        return None;
    }

    // PNG: 89 50 4E 47 0D 0A 1A 0A
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("png");
    }

    // JPEG: FF D8 FF
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("jpg");
    }

    // WebP: RIFF....WEBP
    if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        return Some("webp");
    }

    None
}

/// MIME type matching [`detect_image_format`]
pub fn mime_for(data: &[u8]) -> &'static str {
    match detect_image_format(data) {
        Some("jpg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
