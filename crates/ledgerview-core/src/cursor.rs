//! Opaque pagination cursors.
//!
//! A cursor is the standard base64 encoding of the canonical text of an
//! ordering key. Timestamps always carry nine sub-second digits so the text
//! form is fixed-width and lossless.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

const TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9][offset_hour sign:mandatory]:[offset_minute]"
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("key cannot be encoded: {0}")]
    Unencodable(String),
}

/// An ordering key that can travel inside a cursor.
pub trait CursorKey: Sized {
    fn to_cursor_text(&self) -> Result<String, CursorError>;
    fn from_cursor_text(text: &str) -> Result<Self, CursorError>;
}

impl CursorKey for OffsetDateTime {
    fn to_cursor_text(&self) -> Result<String, CursorError> {
        self.format(TIMESTAMP_FORMAT)
            .map_err(|e| CursorError::Unencodable(format!("timestamp {}: {}", self, e)))
    }

    fn from_cursor_text(text: &str) -> Result<Self, CursorError> {
        OffsetDateTime::parse(text, TIMESTAMP_FORMAT)
            .map_err(|e| CursorError::InvalidCursor(format!("bad timestamp: {}", e)))
    }
}

impl CursorKey for String {
    fn to_cursor_text(&self) -> Result<String, CursorError> {
        Ok(self.clone())
    }

    fn from_cursor_text(text: &str) -> Result<Self, CursorError> {
        if text.is_empty() {
            return Err(CursorError::InvalidCursor("empty key".to_string()));
        }
        Ok(text.to_string())
    }
}

pub fn encode<K: CursorKey>(key: &K) -> Result<String, CursorError> {
    Ok(STANDARD.encode(key.to_cursor_text()?))
}

pub fn decode<K: CursorKey>(token: &str) -> Result<K, CursorError> {
    let bytes = STANDARD
        .decode(token)
        .map_err(|e| CursorError::InvalidCursor(format!("not base64: {}", e)))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| CursorError::InvalidCursor("not utf-8".to_string()))?;
    K::from_cursor_text(&text)
}
