//! Ephemeral ECDH handshake with the KMS.
//!
//! The client creates a one-off X25519 secret and sends its public half to the
//! KMS inside a "create" request. The request is sealed under a wrap key
//! agreed with the KMS long-term public key, so only the KMS can read it and
//! only the KMS can produce a reply that opens. The reply carries the KMS's
//! own ephemeral public key; both sides then derive the session key that
//! protects every later KMS message.
//!
//! Create message layout: `base64url(client_public) "." sealed(KmsRequest)`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    message::{KmsRequest, KmsResponse, RequestContext, METHOD_CREATE},
    KmsError, SymmetricKey,
};

pub(crate) const WRAP_INFO: &[u8] = b"kms ecdhe wrap v1";
pub(crate) const SESSION_INFO: &[u8] = b"kms ecdhe session v1";

pub struct EphemeralKeyRequest {
    request_id: String,
    secret: StaticSecret,
    wrap_key: SymmetricKey,
    message: String,
}

impl EphemeralKeyRequest {
    /// Builds the "create" request addressed to `ecdhe_uri`.
    pub fn create(
        context: &RequestContext,
        request_id: impl Into<String>,
        ecdhe_uri: impl Into<String>,
        kms_public_key: &str,
    ) -> Result<Self, KmsError> {
        let kms_public = decode_public_key(kms_public_key)?;
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let wrap_key = wrap_key(&secret, &kms_public, &public)?;

        let request_id = request_id.into();
        let mut request = KmsRequest::new(context, request_id.clone(), METHOD_CREATE, ecdhe_uri);
        request.jwk = Some(encode_public_key(&public));
        let message = format!(
            "{}.{}",
            encode_public_key(&public),
            request.seal(&wrap_key)?
        );

        Ok(Self {
            request_id,
            secret,
            wrap_key,
            message,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Opens a candidate reply to this request.
    ///
    /// `KmsError::Open` means the message was not produced for this request;
    /// `RequestIdMismatch` means it was sealed by the KMS but answers another
    /// request id.
    pub fn open_reply(&self, message: &str) -> Result<KmsResponse, KmsError> {
        let reply = KmsResponse::open(&self.wrap_key, message)?;
        if reply.request_id != self.request_id {
            return Err(KmsError::RequestIdMismatch {
                expected: self.request_id.clone(),
                actual: reply.request_id,
            });
        }
        Ok(reply)
    }

    /// Derives the session key from an opened reply.
    pub fn complete(&self, reply: &KmsResponse) -> Result<SymmetricKey, KmsError> {
        if reply.is_error() {
            return Err(reply.rejection());
        }
        let kms_ephemeral = decode_public_key(
            reply
                .jwk
                .as_deref()
                .ok_or(KmsError::Malformed("create reply without ephemeral key"))?,
        )?;
        session_key(&self.secret, &kms_ephemeral, &self.request_id)
    }
}

pub(crate) fn wrap_key(
    secret: &StaticSecret,
    peer: &PublicKey,
    client_public: &PublicKey,
) -> Result<SymmetricKey, KmsError> {
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(KmsError::Malformed("non-contributory key exchange"));
    }
    SymmetricKey::derive(shared.as_bytes(), client_public.as_bytes(), WRAP_INFO)
}

pub(crate) fn session_key(
    secret: &StaticSecret,
    peer: &PublicKey,
    request_id: &str,
) -> Result<SymmetricKey, KmsError> {
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(KmsError::Malformed("non-contributory key exchange"));
    }
    SymmetricKey::derive(shared.as_bytes(), request_id.as_bytes(), SESSION_INFO)
}

pub(crate) fn encode_public_key(public: &PublicKey) -> String {
    URL_SAFE_NO_PAD.encode(public.as_bytes())
}

pub(crate) fn decode_public_key(encoded: &str) -> Result<PublicKey, KmsError> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim())?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| KmsError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
    Ok(PublicKey::from(bytes))
}
