use serde::{Deserialize, Serialize};

use crate::{cipher, KmsError, SymmetricKey};

pub const METHOD_CREATE: &str = "create";
pub const METHOD_RETRIEVE: &str = "retrieve";

/// Who is asking: carried inside every KMS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Device url of this client.
    pub client_id: String,
    pub user_id: Option<String>,
    pub bearer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsRequest {
    pub request_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub bearer: String,
    pub method: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<String>,
}

impl KmsRequest {
    pub fn new(
        context: &RequestContext,
        request_id: impl Into<String>,
        method: &str,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            client_id: context.client_id.clone(),
            user_id: context.user_id.clone(),
            bearer: context.bearer.clone(),
            method: method.to_string(),
            uri: uri.into(),
            jwk: None,
        }
    }

    pub fn retrieve(
        context: &RequestContext,
        request_id: impl Into<String>,
        key_uri: impl Into<String>,
    ) -> Self {
        Self::new(context, request_id, METHOD_RETRIEVE, key_uri)
    }

    pub fn seal(&self, key: &SymmetricKey) -> Result<String, KmsError> {
        cipher::seal(key, &serde_json::to_vec(self)?)
    }

    pub fn open(key: &SymmetricKey, message: &str) -> Result<Self, KmsError> {
        Ok(serde_json::from_slice(&cipher::open(key, message)?)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsKey {
    pub uri: String,
    pub jwk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsResponse {
    pub request_id: String,
    pub status: u16,
    /// Key material, present on a successful retrieve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KmsKey>,
    /// KMS ephemeral public key, present on a successful create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KmsResponse {
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    pub fn rejection(&self) -> KmsError {
        KmsError::Rejected {
            status: self.status,
            reason: self.reason.clone().unwrap_or_default(),
        }
    }

    /// Key uri echoed back by the KMS and the key material it resolved to.
    pub fn key_material(&self) -> Result<(String, SymmetricKey), KmsError> {
        if self.is_error() {
            return Err(self.rejection());
        }
        let key = self
            .key
            .as_ref()
            .ok_or(KmsError::Malformed("retrieve reply without key"))?;
        Ok((key.uri.clone(), SymmetricKey::from_jwk(&key.jwk)?))
    }

    pub fn seal(&self, key: &SymmetricKey) -> Result<String, KmsError> {
        cipher::seal(key, &serde_json::to_vec(self)?)
    }

    pub fn open(key: &SymmetricKey, message: &str) -> Result<Self, KmsError> {
        Ok(serde_json::from_slice(&cipher::open(key, message)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RequestContext {
        RequestContext {
            client_id: "https://devices/d1".to_string(),
            user_id: Some("u1".to_string()),
            bearer: "token".to_string(),
        }
    }

    #[test]
    fn sealed_request_opens_under_the_same_key_only() {
        let key = SymmetricKey::generate();
        let request = KmsRequest::retrieve(&context(), "req-1", "kms://keys/L1");
        let sealed = request.seal(&key).expect("seal");
        assert_eq!(KmsRequest::open(&key, &sealed).expect("open"), request);
        assert!(KmsRequest::open(&SymmetricKey::generate(), &sealed).is_err());
    }

    #[test]
    fn error_response_surfaces_rejection() {
        let response = KmsResponse {
            request_id: "req-1".to_string(),
            status: 403,
            key: None,
            jwk: None,
            reason: Some("not authorized".to_string()),
        };
        assert!(matches!(
            response.key_material(),
            Err(KmsError::Rejected { status: 403, .. })
        ));
    }
}
