//! Key material and the default KMS envelope codec.
//!
//! - [`SymmetricKey`]: conversation and session keys
//! - [`cipher`]: content sealing used for activity fields and file bytes
//! - [`EphemeralKeyRequest`]: client half of the ECDH handshake
//! - [`KmsRequest`] / [`KmsResponse`]: messages exchanged after the handshake
//! - [`KmsResponder`]: KMS half, for in-process fakes

pub mod cipher;
mod ecdh;
mod error;
mod key;
mod message;
mod responder;

pub use ecdh::EphemeralKeyRequest;
pub use error::KmsError;
pub use key::{SymmetricKey, SYMMETRIC_KEY_LEN};
pub use message::{
    KmsKey, KmsRequest, KmsResponse, RequestContext, METHOD_CREATE, METHOD_RETRIEVE,
};
pub use responder::{KmsResponder, OpenedCreate};
