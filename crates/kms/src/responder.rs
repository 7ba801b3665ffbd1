//! KMS side of the exchange. Used by in-process fakes of the KMS service.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    ecdh::{decode_public_key, encode_public_key, session_key, wrap_key},
    message::{KmsKey, KmsRequest, KmsResponse, METHOD_CREATE},
    KmsError, SymmetricKey,
};

const STATUS_CREATED: u16 = 201;
const STATUS_OK: u16 = 200;

/// A create request opened by the KMS, ready to be answered.
pub struct OpenedCreate {
    pub request: KmsRequest,
    client_public: PublicKey,
    wrap_key: SymmetricKey,
}

pub struct KmsResponder {
    secret: StaticSecret,
    public: PublicKey,
}

impl KmsResponder {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Long-term public key as published by the cluster endpoint.
    pub fn public_key(&self) -> String {
        encode_public_key(&self.public)
    }

    pub fn open_create(&self, message: &str) -> Result<OpenedCreate, KmsError> {
        let (client_public, sealed) = message
            .split_once('.')
            .ok_or(KmsError::Malformed("create message without key prefix"))?;
        let client_public = decode_public_key(client_public)?;
        let wrap_key = wrap_key(&self.secret, &client_public, &client_public)?;
        let request = KmsRequest::open(&wrap_key, sealed)?;
        if request.method != METHOD_CREATE {
            return Err(KmsError::Malformed("expected a create request"));
        }
        Ok(OpenedCreate {
            request,
            client_public,
            wrap_key,
        })
    }

    /// Accepts a create request. Returns the sealed reply and the session key
    /// the client will derive from it.
    pub fn accept_create(&self, opened: &OpenedCreate) -> Result<(String, SymmetricKey), KmsError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let session = session_key(&ephemeral, &opened.client_public, &opened.request.request_id)?;
        let reply = KmsResponse {
            request_id: opened.request.request_id.clone(),
            status: STATUS_CREATED,
            key: None,
            jwk: Some(encode_public_key(&PublicKey::from(&ephemeral))),
            reason: None,
        };
        Ok((reply.seal(&opened.wrap_key)?, session))
    }

    pub fn reject_create(
        &self,
        opened: &OpenedCreate,
        status: u16,
        reason: &str,
    ) -> Result<String, KmsError> {
        KmsResponse {
            request_id: opened.request.request_id.clone(),
            status,
            key: None,
            jwk: None,
            reason: Some(reason.to_string()),
        }
        .seal(&opened.wrap_key)
    }

    pub fn answer_retrieve(
        session: &SymmetricKey,
        request: &KmsRequest,
        content_key: &SymmetricKey,
    ) -> Result<String, KmsError> {
        KmsResponse {
            request_id: request.request_id.clone(),
            status: STATUS_OK,
            key: Some(KmsKey {
                uri: request.uri.clone(),
                jwk: content_key.to_jwk(),
            }),
            jwk: None,
            reason: None,
        }
        .seal(session)
    }

    pub fn reject_retrieve(
        session: &SymmetricKey,
        request: &KmsRequest,
        status: u16,
        reason: &str,
    ) -> Result<String, KmsError> {
        KmsResponse {
            request_id: request.request_id.clone(),
            status,
            key: None,
            jwk: None,
            reason: Some(reason.to_string()),
        }
        .seal(session)
    }
}
