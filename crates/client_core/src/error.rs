use thiserror::Error;

/// Failure reported to the caller of an activity operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityError {
    #[error("failed to fetch client identity (user id / kms cluster)")]
    ClientIdentityFetchFailed,
    #[error("kms ephemeral key handshake failed")]
    EphemeralKeyFetchFailed,
    #[error("kms failed to retrieve key material for {key_uri}")]
    KmsRetrieveFailed { key_uri: String },
    #[error("failed to fetch the encryption key location of conversation {conversation_id}")]
    EncryptionLocationFetchFailed { conversation_id: String },
    #[error("failed to fetch the share location of conversation {conversation_id}")]
    ShareLocationFetchFailed { conversation_id: String },
    #[error("failed to transform field `{field}`: {reason}")]
    CryptoTransformFailed { field: &'static str, reason: String },
    #[error("no key material available for conversation {conversation_id}")]
    MissingKeyMaterial { conversation_id: String },
    #[error("transport request failed: {0}")]
    Transport(String),
    #[error("unexpected service response: {0}")]
    InvalidResponse(String),
    #[error("activity client has shut down")]
    ClientShutDown,
}

impl ActivityError {
    pub(crate) fn transport(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }

    pub(crate) fn crypto(field: &'static str, err: kms::KmsError) -> Self {
        Self::CryptoTransformFailed {
            field,
            reason: err.to_string(),
        }
    }
}
