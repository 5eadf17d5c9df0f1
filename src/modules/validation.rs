//! Request input rules.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, AppResult};

const MAX_MESSAGE_LEN: usize = 4096;
const MAX_CAPTION_LEN: usize = 1024;

static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{3,50}$").unwrap());

/// Country calling codes accepted as the leading digits of a recipient.
const COUNTRY_CODES: &[&str] = &[
    "1", "7", "20", "27", "30", "31", "32", "33", "34", "36", "39", "40", "41", "43", "44", "45",
    "46", "47", "48", "49", "51", "52", "53", "54", "55", "56", "57", "58", "60", "61", "62", "63",
    "64", "65", "66", "81", "82", "84", "86", "90", "91", "92", "93", "94", "95", "98", "880",
    "886", "960", "961", "962", "963", "964", "965", "966", "967", "968", "970", "971", "972",
    "973", "974", "975", "976", "977", "978", "979",
];

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
];

/// Trim and drop angle brackets from free-form input.
pub fn sanitize(input: &str) -> String {
    input.trim().replace(['<', '>'], "")
}

pub fn session_id(raw: &str) -> AppResult<String> {
    let id = sanitize(raw);
    if SESSION_ID_RE.is_match(&id) {
        Ok(id)
    } else {
        Err(AppError::Validation(
            "\"sessionId\" must be 3-50 alphanumeric characters".to_string(),
        ))
    }
}

/// Normalize a recipient to bare digits.
pub fn phone_number(raw: Option<&str>) -> AppResult<String> {
    let raw = raw.map(sanitize).unwrap_or_default();
    if raw.is_empty() {
        return Err(AppError::BadRequest("Phone number is required".to_string()));
    }

    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 || digits.len() > 15 {
        return Err(AppError::BadRequest(
            "Invalid phone number format. Must be 7-15 digits".to_string(),
        ));
    }

    if !COUNTRY_CODES.iter().any(|code| digits.starts_with(code)) {
        return Err(AppError::BadRequest(
            "Invalid country code in phone number".to_string(),
        ));
    }

    Ok(digits)
}

pub fn text_message(raw: Option<&str>) -> AppResult<String> {
    let message = raw.map(sanitize).unwrap_or_default();
    let len = message.chars().count();
    if len == 0 {
        return Err(AppError::Validation("\"message\" is required".to_string()));
    }
    if len > MAX_MESSAGE_LEN {
        return Err(AppError::Validation(format!(
            "\"message\" length must be less than or equal to {} characters long",
            MAX_MESSAGE_LEN
        )));
    }
    Ok(message)
}

pub fn caption(raw: Option<&str>) -> AppResult<Option<String>> {
    let Some(caption) = raw.map(sanitize).filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if caption.chars().count() > MAX_CAPTION_LEN {
        return Err(AppError::Validation(format!(
            "\"caption\" length must be less than or equal to {} characters long",
            MAX_CAPTION_LEN
        )));
    }
    Ok(Some(caption))
}

pub fn mime_type(mime: &str) -> AppResult<()> {
    if ALLOWED_MIME_TYPES.contains(&mime) {
        Ok(())
    } else {
        Err(AppError::UnsupportedMediaType(mime.to_string()))
    }
}

/// Reduce an uploaded file name to something safe to put on disk.
pub fn file_name(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
