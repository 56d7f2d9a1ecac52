//! Attachment normalization: image fitting, audio transcription routing,
//! and document text extraction.
//!
//! Everything here converts an attachment into either text appended to
//! the message or a neutral image block; nothing provider-specific
//! crosses this boundary.

use std::io::Cursor;
use std::path::Path;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use tracing::{error, info, warn};

use lucyd_channels::Attachment;
use lucyd_core::types::ContentBlock;

use crate::app::AppState;
use crate::stt;

/// Why an image could not be fit within API limits.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("{0:.1}MB after compression")]
    TooLarge(f64),
    #[error("could not read file")]
    Unreadable,
}

/// Scale dimensions and reduce quality to fit within API limits.
///
/// Strategy: (1) shrink to `max_dimension` per side, (2) step down JPEG
/// quality through the configured ladder. PNG is lossless, so an
/// oversized PNG that survives scaling fails.
pub fn fit_image(
    data: Vec<u8>,
    content_type: &str,
    max_bytes: usize,
    max_dimension: u32,
    quality_steps: &[u8],
) -> Result<Vec<u8>, FitError> {
    let is_jpeg = content_type == "image/jpeg";
    let img = image::load_from_memory(&data).map_err(|_| FitError::Unreadable)?;

    let mut data = data;
    let mut img = img;
    if img.width().max(img.height()) > max_dimension {
        info!(
            width = img.width(),
            height = img.height(),
            max_dimension,
            "scaling image to fit"
        );
        img = img.thumbnail(max_dimension, max_dimension);
        let mut buf = Vec::new();
        if is_jpeg {
            JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), 90)
                .encode_image(&img)
                .map_err(|_| FitError::Unreadable)?;
        } else {
            img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|_| FitError::Unreadable)?;
        }
        data = buf;
    }

    if data.len() <= max_bytes {
        return Ok(data);
    }

    if is_jpeg {
        for &q in quality_steps {
            let mut buf = Vec::new();
            if JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), q)
                .encode_image(&img)
                .is_err()
            {
                continue;
            }
            if buf.len() <= max_bytes {
                info!(quality = q, bytes = buf.len(), "JPEG quality step fit the image");
                return Ok(buf);
            }
            data = buf;
        }
    }

    Err(FitError::TooLarge(data.len() as f64 / (1024.0 * 1024.0)))
}

/// Extract text from a document. Returns None if not a readable format
/// or the file is too large to bother reading.
pub fn extract_document_text(
    path: &str,
    content_type: &str,
    filename: &str,
    max_chars: usize,
    max_bytes: u64,
    text_extensions: &[String],
) -> Option<String> {
    let file_path = Path::new(path);
    let size = file_path.metadata().ok()?.len();
    if size > max_bytes {
        return None;
    }

    let ext = Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    // Plain text — by extension or text/* MIME
    if text_extensions.contains(&ext) || content_type.starts_with("text/") {
        let bytes = std::fs::read(file_path).ok()?;
        let mut text = String::from_utf8_lossy(&bytes).to_string();
        if text.chars().count() > max_chars {
            text = text.chars().take(max_chars).collect();
            text.push_str(&format!("\n[… truncated at {max_chars} chars]"));
        }
        return Some(text);
    }

    // PDF
    if content_type == "application/pdf" || ext == ".pdf" {
        let mut text = pdf_extract::extract_text(file_path).ok()?;
        if text.trim().is_empty() {
            return None;
        }
        if text.chars().count() > max_chars {
            text = text.chars().take(max_chars).collect();
            text.push_str(&format!("\n[… truncated at {max_chars} chars]"));
        }
        return Some(text);
    }

    None
}

/// Result of normalizing a message's attachments.
pub struct NormalizedAttachments {
    /// Message text with attachment labels and transcriptions folded in.
    pub text: String,
    /// Neutral image blocks for the transient API content.
    pub image_blocks: Vec<ContentBlock>,
    /// Any attachment was a voice note.
    pub has_voice: bool,
}

fn append_line(text: &mut String, line: &str) {
    if text.is_empty() {
        text.push_str(line);
    } else {
        text.push('\n');
        text.push_str(line);
    }
}

/// Fold every attachment into text and/or image blocks.
pub async fn normalize(
    state: &AppState,
    text: String,
    attachments: &[Attachment],
    supports_vision: bool,
) -> NormalizedAttachments {
    let cfg = &state.config;
    let mut text = text;
    let mut image_blocks = Vec::new();
    let mut has_voice = false;

    for att in attachments {
        if att.is_image() {
            if !supports_vision {
                append_line(
                    &mut text,
                    "[image received — vision not available with current provider]",
                );
                continue;
            }
            let too_large = &cfg.vision.too_large_msg;
            match tokio::fs::read(&att.local_path).await {
                Ok(data) => {
                    let content_type = att.content_type.clone();
                    let max_bytes = cfg.vision.max_image_bytes;
                    let max_dimension = cfg.vision.max_dimension;
                    let steps = cfg.vision.jpeg_quality_steps.clone();
                    // Decode/re-encode is CPU-bound — keep it off the loop.
                    let fitted = tokio::task::spawn_blocking(move || {
                        fit_image(data, &content_type, max_bytes, max_dimension, &steps)
                    })
                    .await
                    .unwrap_or(Err(FitError::Unreadable));
                    match fitted {
                        Ok(bytes) => {
                            image_blocks.push(ContentBlock::Image {
                                media_type: att.content_type.clone(),
                                data: base64::engine::general_purpose::STANDARD.encode(bytes),
                            });
                            let caption = &cfg.vision.default_caption;
                            text = if text.is_empty() {
                                format!("[{caption}]")
                            } else {
                                format!("[{caption}] {text}")
                            };
                        }
                        Err(e) => {
                            warn!(path = %att.local_path, error = %e, "image does not fit");
                            append_line(&mut text, &format!("[{too_large} — {e}]"));
                        }
                    }
                }
                Err(e) => {
                    error!(path = %att.local_path, error = %e, "failed to read image");
                    append_line(&mut text, &format!("[{too_large} — could not read file]"));
                }
            }
        } else if att.is_audio() {
            let (label, fail_label) = if att.is_voice {
                has_voice = true;
                (&cfg.stt.voice_label, &cfg.stt.voice_fail_msg)
            } else {
                (&cfg.stt.audio_label, &cfg.stt.audio_fail_msg)
            };
            match stt::transcribe(cfg, &att.local_path, &att.content_type).await {
                Ok(transcription) => {
                    append_line(&mut text, &format!("[{label}]: {transcription}"));
                }
                Err(e) => {
                    error!(backend = %cfg.stt.backend, error = %e, "STT transcription failed");
                    append_line(&mut text, &format!("[{fail_label}]"));
                }
            }
        } else {
            let name = if att.filename.is_empty() {
                "file"
            } else {
                att.filename.as_str()
            };
            let doc_text = if cfg.documents.enabled {
                let path = att.local_path.clone();
                let content_type = att.content_type.clone();
                let filename = att.filename.clone();
                let max_chars = cfg.documents.max_chars;
                let max_bytes = cfg.documents.max_file_bytes;
                let extensions = cfg.documents.text_extensions.clone();
                // PDF parse can be slow — keep it off the event loop.
                tokio::task::spawn_blocking(move || {
                    extract_document_text(
                        &path,
                        &content_type,
                        &filename,
                        max_chars,
                        max_bytes,
                        &extensions,
                    )
                })
                .await
                .unwrap_or(None)
            } else {
                None
            };

            match doc_text {
                Some(doc) => {
                    let label = if att.filename.is_empty() {
                        "document"
                    } else {
                        att.filename.as_str()
                    };
                    append_line(&mut text, &format!("[document: {label}]\n{doc}"));
                }
                None => {
                    append_line(
                        &mut text,
                        &format!("[attachment: {name}, {}]", att.content_type),
                    );
                }
            }
        }
    }

    NormalizedAttachments {
        text,
        image_blocks,
        has_voice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        }));
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), 95)
            .encode_image(&img)
            .unwrap();
        buf
    }

    #[test]
    fn small_image_passes_through_unchanged() {
        let data = png_bytes(100, 80);
        let out = fit_image(data.clone(), "image/png", 5_000_000, 1568, &[85, 60, 40]).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn oversized_dimensions_are_scaled_down() {
        let data = jpeg_bytes(2000, 1000);
        let out = fit_image(data, "image/jpeg", 5_000_000, 500, &[85, 60, 40]).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert!(img.width() <= 500 && img.height() <= 500);
        // Aspect preserved (2:1)
        assert_eq!(img.width(), 500);
        assert_eq!(img.height(), 250);
    }

    #[test]
    fn jpeg_quality_ladder_brings_size_down() {
        let data = jpeg_bytes(800, 800);
        let original_len = data.len();
        let out = fit_image(data, "image/jpeg", original_len / 2, 1568, &[85, 60, 40, 10]).unwrap();
        assert!(out.len() <= original_len / 2);
    }

    #[test]
    fn png_that_cannot_fit_is_rejected() {
        let data = png_bytes(300, 300);
        let err = fit_image(data, "image/png", 64, 1568, &[85, 60, 40]).unwrap_err();
        assert!(matches!(err, FitError::TooLarge(_)));
    }

    #[test]
    fn garbage_bytes_are_unreadable() {
        let err = fit_image(vec![1, 2, 3, 4], "image/png", 1000, 1568, &[]).unwrap_err();
        assert!(matches!(err, FitError::Unreadable));
    }

    #[test]
    fn text_document_is_extracted_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "abcdefghij".repeat(100)).unwrap();

        let out = extract_document_text(
            path.to_str().unwrap(),
            "text/plain",
            "notes.txt",
            50,
            1_000_000,
            &[".txt".to_string()],
        )
        .unwrap();
        assert!(out.starts_with("abcdefghij"));
        assert!(out.contains("truncated at 50 chars"));
    }

    #[test]
    fn oversized_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(100)).unwrap();
        let out = extract_document_text(
            path.to_str().unwrap(),
            "text/plain",
            "big.txt",
            1000,
            10, // 10-byte cap
            &[".txt".to_string()],
        );
        assert!(out.is_none());
    }

    #[test]
    fn unknown_binary_format_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, [0u8, 1, 2, 3]).unwrap();
        let out = extract_document_text(
            path.to_str().unwrap(),
            "application/octet-stream",
            "blob.bin",
            1000,
            1_000_000,
            &[".txt".to_string()],
        );
        assert!(out.is_none());
    }
}
