//! Field-level encryption of activities.
//!
//! Every protected field is sealed on its own, so a corrupt field on receipt
//! names exactly which field failed. The `content_state` tag makes both
//! directions no-ops on an activity that is already in the target state.

use kms::{cipher, SymmetricKey};
use shared::{domain::ContentState, protocol::MessageActivity};

use crate::error::ActivityError;

pub const FIELD_TEXT: &str = "text";
pub const FIELD_DISPLAY_NAME: &str = "files.display_name";
pub const FIELD_SOURCE_URI: &str = "files.source_uri";
pub const FIELD_THUMBNAIL_URI: &str = "files.thumbnail.source_uri";
pub const FIELD_FILE_BYTES: &str = "file bytes";

pub fn encrypt_outgoing(
    activity: &MessageActivity,
    key: &SymmetricKey,
) -> Result<MessageActivity, ActivityError> {
    if activity.content_state == ContentState::Cipher {
        return Ok(activity.clone());
    }
    transform(activity, ContentState::Cipher, |field, value| {
        cipher::seal_str(key, value).map_err(|err| ActivityError::crypto(field, err))
    })
}

pub fn decrypt_incoming(
    activity: &MessageActivity,
    key: &SymmetricKey,
) -> Result<MessageActivity, ActivityError> {
    if activity.content_state == ContentState::Plain {
        return Ok(activity.clone());
    }
    transform(activity, ContentState::Plain, |field, value| {
        cipher::open_str(key, value).map_err(|err| ActivityError::crypto(field, err))
    })
}

pub fn encrypt_file_bytes(key: &SymmetricKey, bytes: &[u8]) -> Result<Vec<u8>, ActivityError> {
    cipher::seal_bytes(key, bytes).map_err(|err| ActivityError::crypto(FIELD_FILE_BYTES, err))
}

pub fn decrypt_file_bytes(key: &SymmetricKey, bytes: &[u8]) -> Result<Vec<u8>, ActivityError> {
    cipher::open_bytes(key, bytes).map_err(|err| ActivityError::crypto(FIELD_FILE_BYTES, err))
}

fn transform<F>(
    activity: &MessageActivity,
    target: ContentState,
    mut apply: F,
) -> Result<MessageActivity, ActivityError>
where
    F: FnMut(&'static str, &str) -> Result<String, ActivityError>,
{
    let mut out = activity.clone();

    if let Some(text) = out.text.as_mut() {
        if !text.is_empty() {
            *text = apply(FIELD_TEXT, text)?;
        }
    }
    for file in &mut out.files {
        file.display_name = apply(FIELD_DISPLAY_NAME, &file.display_name)?;
        file.source_uri = apply(FIELD_SOURCE_URI, &file.source_uri)?;
        if let Some(thumbnail) = file.thumbnail.as_mut() {
            thumbnail.source_uri = apply(FIELD_THUMBNAIL_URI, &thumbnail.source_uri)?;
        }
    }

    out.content_state = target;
    Ok(out)
}

#[cfg(test)]
#[path = "tests/crypto_tests.rs"]
mod tests;
