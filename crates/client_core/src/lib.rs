//! Client-side engine for end-to-end encrypted conversation activities.
//!
//! Outgoing activities wait behind a readiness gate until their conversation's
//! key material has been obtained from the KMS, then run through a serial
//! execution queue that encrypts and transmits them. Inbound activities are
//! decrypted with the same keys.

pub mod client;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod execution;
pub mod handshake;
pub mod key_store;
pub mod pending;
pub mod transport;

pub use client::{ActivityClient, ActivityEvent};
pub use config::{load_settings, ClientSettings};
pub use error::ActivityError;
pub use execution::{DownloadMode, DownloadedFile, OutgoingFile, OutgoingThumbnail};
pub use transport::{Authenticator, HttpTransport, StaticTokenAuthenticator, Transport};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
