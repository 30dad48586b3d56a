//! Request validation applied before any upstream call.

use base64::Engine;

use crate::config::ChatConfig;
use crate::error::InputError;
use crate::types::{ChatRequest, ImageRef};

/// Check a chat request against the configured limits.
pub fn validate_request(request: &ChatRequest, limits: &ChatConfig) -> Result<(), InputError> {
    if request.message.trim().is_empty() {
        return Err(InputError::EmptyMessage);
    }

    let len = request.message.chars().count();
    if len > limits.max_message_chars {
        return Err(InputError::MessageTooLong {
            len,
            max: limits.max_message_chars,
        });
    }

    let count = request.image_attachments.len();
    if count > limits.max_image_attachments {
        return Err(InputError::TooManyImages {
            count,
            max: limits.max_image_attachments,
        });
    }

    for (index, image) in request.image_attachments.iter().enumerate() {
        validate_image(image, limits.max_image_bytes)
            .map_err(|reason| InputError::InvalidImage { index, reason })?;
    }

    Ok(())
}

fn validate_image(image: &ImageRef, max_bytes: usize) -> Result<(), String> {
    let raw = image.as_str().trim();
    if raw.is_empty() {
        return Err("reference is empty".into());
    }

    if let Some(rest) = raw.strip_prefix("data:") {
        return validate_data_uri(rest, max_bytes);
    }

    if let Some(rest) = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
    {
        let host = rest.split(['/', '?', '#']).next().unwrap_or("");
        if host.is_empty() || rest.chars().any(char::is_whitespace) {
            return Err("URL has no host or contains whitespace".into());
        }
        return Ok(());
    }

    Err("expected a data: URI or an http(s) URL".into())
}

fn validate_data_uri(rest: &str, max_bytes: usize) -> Result<(), String> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URI has no payload separator".to_string())?;

    let media_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| "data URI must be base64 encoded".to_string())?;

    if !media_type.starts_with("image/") || media_type.len() == "image/".len() {
        return Err(format!("unsupported media type '{media_type}'"));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("payload is not valid base64: {e}"))?;

    if decoded.is_empty() {
        return Err("image payload is empty".into());
    }
    if decoded.len() > max_bytes {
        return Err(format!(
            "image is {} bytes, the limit is {max_bytes}",
            decoded.len()
        ));
    }
    Ok(())
}
