//! Client identity bootstrap and the KMS key exchange.
//!
//! Both are plain state machines: they decide what to send next and how to
//! interpret what comes back, and leave the I/O to the engine's caller.

use std::{collections::HashMap, fmt};

use kms::{EphemeralKeyRequest, KmsError, KmsRequest, KmsResponse, RequestContext, SymmetricKey};
use shared::{domain::KeyUri, protocol::KmsClusterInfo};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
    pub kms_cluster: String,
    /// Long-term KMS public key, base64url.
    pub kms_public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapProgress {
    /// Result of an abandoned round.
    Stale,
    Waiting,
    Ready,
    Failed,
}

#[derive(Debug, Default)]
enum BootstrapState {
    #[default]
    Unset,
    Fetching {
        user_id: Option<String>,
        cluster: Option<KmsClusterInfo>,
    },
    Ready(ClientIdentity),
}

/// Two independent fetches (user id, KMS cluster) that must both succeed.
#[derive(Debug, Default)]
pub struct IdentityBootstrap {
    round: u64,
    state: BootstrapState,
}

impl IdentityBootstrap {
    pub fn identity(&self) -> Option<&ClientIdentity> {
        match &self.state {
            BootstrapState::Ready(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.state, BootstrapState::Fetching { .. })
    }

    /// Starts a round unless one is running or the identity is known.
    pub fn start(&mut self) -> Option<u64> {
        if !matches!(self.state, BootstrapState::Unset) {
            return None;
        }
        self.round += 1;
        self.state = BootstrapState::Fetching {
            user_id: None,
            cluster: None,
        };
        Some(self.round)
    }

    pub fn on_user_id(&mut self, round: u64, result: anyhow::Result<String>) -> BootstrapProgress {
        if !self.accepts(round) {
            return BootstrapProgress::Stale;
        }
        match result {
            Ok(id) => {
                if let BootstrapState::Fetching { user_id, .. } = &mut self.state {
                    *user_id = Some(id);
                }
                self.try_complete()
            }
            Err(_) => self.fail(),
        }
    }

    pub fn on_kms_cluster(
        &mut self,
        round: u64,
        result: anyhow::Result<KmsClusterInfo>,
    ) -> BootstrapProgress {
        if !self.accepts(round) {
            return BootstrapProgress::Stale;
        }
        match result {
            Ok(info) => {
                if let BootstrapState::Fetching { cluster, .. } = &mut self.state {
                    *cluster = Some(info);
                }
                self.try_complete()
            }
            Err(_) => self.fail(),
        }
    }

    fn accepts(&self, round: u64) -> bool {
        round == self.round && self.is_fetching()
    }

    fn fail(&mut self) -> BootstrapProgress {
        self.state = BootstrapState::Unset;
        BootstrapProgress::Failed
    }

    fn try_complete(&mut self) -> BootstrapProgress {
        match std::mem::take(&mut self.state) {
            BootstrapState::Fetching {
                user_id: Some(user_id),
                cluster: Some(cluster),
            } => {
                self.state = BootstrapState::Ready(ClientIdentity {
                    user_id,
                    kms_cluster: cluster.kms_cluster,
                    kms_public_key: cluster.public_key,
                });
                BootstrapProgress::Ready
            }
            other => {
                self.state = other;
                BootstrapProgress::Waiting
            }
        }
    }
}

pub enum EphemeralPhase {
    Idle,
    AwaitingToken { attempt: u64 },
    AwaitingReply { request: EphemeralKeyRequest },
    Established(SymmetricKey),
}

impl fmt::Debug for EphemeralPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::AwaitingToken { attempt } => {
                f.debug_struct("AwaitingToken").field("attempt", attempt).finish()
            }
            Self::AwaitingReply { request } => f
                .debug_struct("AwaitingReply")
                .field("request_id", &request.request_id())
                .finish(),
            Self::Established(_) => f.write_str("Established"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralDispatch {
    pub request_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveDispatch {
    pub location: KeyUri,
    pub request_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrieveStep {
    KeyAvailable,
    AlreadyOutstanding,
    /// Held until the ephemeral key is established.
    AwaitingHandshake,
    Dispatch(RetrieveDispatch),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Neither a handshake reply nor a retrieve reply can be expected.
    NoHandshakeInFlight,
    /// Not produced for the in-flight ephemeral request.
    ForeignReply,
    /// Does not open under the ephemeral key.
    Undecryptable,
    /// Opens, but answers no outstanding retrieve.
    Unsolicited,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoHandshakeInFlight => "no handshake in flight",
            Self::ForeignReply => "not a reply to the in-flight request",
            Self::Undecryptable => "does not open under the ephemeral key",
            Self::Unsolicited => "no matching outstanding request",
        };
        f.write_str(reason)
    }
}

/// How one inbound KMS message was interpreted.
#[derive(Debug)]
pub enum KmsReplyOutcome {
    Established,
    HandshakeFailed(KmsError),
    KeyRetrieved { location: KeyUri, key: SymmetricKey },
    RetrieveRejected { location: KeyUri, error: KmsError },
    Discarded(DiscardReason),
}

/// Ephemeral key exchange plus per-location key retrieval.
///
/// At most one ephemeral attempt is in flight. Retrieves are only built once
/// the exchange is established, and at most one is outstanding per location.
pub struct KmsHandshake {
    device_url: String,
    phase: EphemeralPhase,
    attempt: u64,
    context: Option<RequestContext>,
    outstanding: HashMap<KeyUri, String>,
}

impl KmsHandshake {
    pub fn new(device_url: impl Into<String>) -> Self {
        Self {
            device_url: device_url.into(),
            phase: EphemeralPhase::Idle,
            attempt: 0,
            context: None,
            outstanding: HashMap::new(),
        }
    }

    pub fn phase(&self) -> &EphemeralPhase {
        &self.phase
    }

    pub fn is_established(&self) -> bool {
        matches!(self.phase, EphemeralPhase::Established(_))
    }

    pub fn in_flight(&self) -> bool {
        matches!(
            self.phase,
            EphemeralPhase::AwaitingToken { .. } | EphemeralPhase::AwaitingReply { .. }
        )
    }

    pub fn is_outstanding(&self, location: &KeyUri) -> bool {
        self.outstanding.contains_key(location)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns the attempt number when a new exchange starts and a bearer
    /// token has to be acquired for it.
    pub fn ensure_ephemeral_key(&mut self, identity_ready: bool) -> Option<u64> {
        if !identity_ready || !matches!(self.phase, EphemeralPhase::Idle) {
            return None;
        }
        self.attempt += 1;
        self.phase = EphemeralPhase::AwaitingToken {
            attempt: self.attempt,
        };
        Some(self.attempt)
    }

    /// Builds the create request once the bearer token is known. `Ok(None)`
    /// for a token belonging to an abandoned attempt.
    pub fn begin(
        &mut self,
        attempt: u64,
        bearer: String,
        identity: &ClientIdentity,
    ) -> Result<Option<EphemeralDispatch>, KmsError> {
        if !matches!(self.phase, EphemeralPhase::AwaitingToken { attempt: current } if current == attempt)
        {
            return Ok(None);
        }
        let context = RequestContext {
            client_id: self.device_url.clone(),
            user_id: Some(identity.user_id.clone()),
            bearer,
        };
        let ecdhe_uri = format!("{}/ecdhe", identity.kms_cluster.trim_end_matches('/'));
        let request = match EphemeralKeyRequest::create(
            &context,
            Uuid::new_v4().to_string(),
            ecdhe_uri,
            &identity.kms_public_key,
        ) {
            Ok(request) => request,
            Err(err) => {
                self.phase = EphemeralPhase::Idle;
                return Err(err);
            }
        };

        let dispatch = EphemeralDispatch {
            request_id: request.request_id().to_string(),
            message: request.message().to_string(),
        };
        self.context = Some(context);
        self.phase = EphemeralPhase::AwaitingReply { request };
        Ok(Some(dispatch))
    }

    /// Token acquisition failed. True when `attempt` was the live one.
    pub fn abort_token(&mut self, attempt: u64) -> bool {
        if matches!(self.phase, EphemeralPhase::AwaitingToken { attempt: current } if current == attempt)
        {
            self.phase = EphemeralPhase::Idle;
            return true;
        }
        false
    }

    /// Deadline elapsed or dispatch failed. True when `request_id` was still
    /// awaiting its reply; the attempt is cleared.
    pub fn expire(&mut self, request_id: &str) -> bool {
        match &self.phase {
            EphemeralPhase::AwaitingReply { request } if request.request_id() == request_id => {
                self.phase = EphemeralPhase::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn on_kms_message(&mut self, message: &str) -> KmsReplyOutcome {
        match &self.phase {
            EphemeralPhase::AwaitingReply { request } => {
                let result = request
                    .open_reply(message)
                    .and_then(|reply| request.complete(&reply));
                match result {
                    Ok(session) => {
                        self.phase = EphemeralPhase::Established(session);
                        KmsReplyOutcome::Established
                    }
                    Err(err) if is_foreign(&err) => {
                        KmsReplyOutcome::Discarded(DiscardReason::ForeignReply)
                    }
                    Err(err) => {
                        self.phase = EphemeralPhase::Idle;
                        KmsReplyOutcome::HandshakeFailed(err)
                    }
                }
            }
            EphemeralPhase::Established(session) => match KmsResponse::open(session, message) {
                Ok(reply) => self.resolve_retrieve(reply),
                Err(_) => KmsReplyOutcome::Discarded(DiscardReason::Undecryptable),
            },
            EphemeralPhase::Idle | EphemeralPhase::AwaitingToken { .. } => {
                KmsReplyOutcome::Discarded(DiscardReason::NoHandshakeInFlight)
            }
        }
    }

    /// The outstanding record is written before the message is handed out,
    /// so a second call for the same location is a no-op.
    pub fn request_key_material(
        &mut self,
        location: &KeyUri,
        key_present: bool,
    ) -> Result<RetrieveStep, KmsError> {
        if key_present {
            return Ok(RetrieveStep::KeyAvailable);
        }
        if self.outstanding.contains_key(location) {
            return Ok(RetrieveStep::AlreadyOutstanding);
        }
        let (EphemeralPhase::Established(session), Some(context)) = (&self.phase, &self.context)
        else {
            return Ok(RetrieveStep::AwaitingHandshake);
        };

        let request_id = Uuid::new_v4().to_string();
        let message =
            KmsRequest::retrieve(context, request_id.clone(), location.as_str()).seal(session)?;
        self.outstanding
            .insert(location.clone(), request_id.clone());
        Ok(RetrieveStep::Dispatch(RetrieveDispatch {
            location: location.clone(),
            request_id,
            message,
        }))
    }

    /// Dispatch of a retrieve failed. True when it was still outstanding.
    pub fn retrieve_failed(&mut self, location: &KeyUri, request_id: &str) -> bool {
        if self.outstanding.get(location).map(String::as_str) == Some(request_id) {
            self.outstanding.remove(location);
            return true;
        }
        false
    }

    fn resolve_retrieve(&mut self, reply: KmsResponse) -> KmsReplyOutcome {
        let by_request = self
            .outstanding
            .iter()
            .find(|(_, request_id)| **request_id == reply.request_id)
            .map(|(location, _)| location.clone());
        let location = by_request.or_else(|| {
            let uri = reply.key.as_ref()?.uri.as_str();
            self.outstanding
                .keys()
                .find(|location| location.as_str() == uri)
                .cloned()
        });
        let Some(location) = location else {
            return KmsReplyOutcome::Discarded(DiscardReason::Unsolicited);
        };
        self.outstanding.remove(&location);

        if reply.is_error() {
            return KmsReplyOutcome::RetrieveRejected {
                location,
                error: reply.rejection(),
            };
        }
        match reply.key_material() {
            Ok((_, key)) => KmsReplyOutcome::KeyRetrieved { location, key },
            Err(error) => KmsReplyOutcome::RetrieveRejected { location, error },
        }
    }
}

fn is_foreign(err: &KmsError) -> bool {
    matches!(
        err,
        KmsError::Open
            | KmsError::Encoding(_)
            | KmsError::Truncated { .. }
            | KmsError::RequestIdMismatch { .. }
    )
}

#[cfg(test)]
#[path = "tests/handshake_tests.rs"]
mod tests;
