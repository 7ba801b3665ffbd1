//! The activity engine: a single-owner state machine.
//!
//! Every public call and every collaborator result is fed to [`Engine`] one at
//! a time. The engine mutates its own state and answers with
//! [`EngineAction`]s for the caller to perform; it never does I/O itself.

use std::{collections::BTreeSet, time::Duration};

use kms::SymmetricKey;
use shared::{
    domain::{ConversationId, KeyState, KeyUri, Readiness, SpaceUri},
    protocol::{FileRef, KmsClusterInfo, MessageActivity},
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    crypto::decrypt_incoming,
    error::ActivityError,
    execution::{DownloadMode, DownloadUnit, DownloadedFile, ExecutionUnit, OutgoingFile, PostUnit},
    handshake::{
        BootstrapProgress, IdentityBootstrap, KmsHandshake, KmsReplyOutcome, RetrieveStep,
    },
    key_store::KeyStore,
    pending::{Completion, PendingActivity, PendingQueue, ReceiveQueue},
};

/// Which request a KMS message dispatch belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsCorrelation {
    Ephemeral { request_id: String },
    Retrieve { location: KeyUri, request_id: String },
}

#[derive(Debug)]
pub enum EngineAction {
    FetchUserId { round: u64 },
    FetchKmsCluster { round: u64 },
    AcquireHandshakeToken { attempt: u64 },
    SendKmsMessage {
        message: String,
        destination: String,
        correlation: KmsCorrelation,
    },
    ArmEphemeralDeadline { request_id: String, after: Duration },
    FetchKeyLocation { conversation_id: ConversationId },
    AllocateShareLocation { conversation_id: ConversationId },
    Execute(ExecutionUnit),
    Deliver(MessageActivity),
    Report(ActivityError),
}

/// Collaborator results fed back into the engine.
#[derive(Debug)]
pub enum EngineEvent {
    UserIdFetched {
        round: u64,
        result: anyhow::Result<String>,
    },
    KmsClusterFetched {
        round: u64,
        result: anyhow::Result<KmsClusterInfo>,
    },
    HandshakeTokenAcquired {
        attempt: u64,
        result: anyhow::Result<String>,
    },
    KmsDispatchFailed {
        correlation: KmsCorrelation,
        error: anyhow::Error,
    },
    EphemeralDeadlineElapsed {
        request_id: String,
    },
    KeyLocationFetched {
        conversation_id: ConversationId,
        result: anyhow::Result<Option<KeyUri>>,
    },
    ShareLocationFetched {
        conversation_id: ConversationId,
        result: anyhow::Result<SpaceUri>,
    },
}

pub struct Engine {
    ephemeral_key_timeout: Duration,
    identity: IdentityBootstrap,
    handshake: KmsHandshake,
    key_store: KeyStore,
    pending: PendingQueue,
    received: ReceiveQueue,
    location_fetches: BTreeSet<ConversationId>,
    share_fetches: BTreeSet<ConversationId>,
}

impl Engine {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            ephemeral_key_timeout: settings.ephemeral_key_timeout(),
            identity: IdentityBootstrap::default(),
            handshake: KmsHandshake::new(settings.device_url.clone()),
            key_store: KeyStore::new(),
            pending: PendingQueue::default(),
            received: ReceiveQueue::default(),
            location_fetches: BTreeSet::new(),
            share_fetches: BTreeSet::new(),
        }
    }

    pub fn readiness(&self, conversation_id: &ConversationId) -> Readiness {
        self.key_store.readiness_for(conversation_id)
    }

    pub fn key_state(&self, conversation_id: &ConversationId) -> KeyState {
        self.key_store
            .key_state(conversation_id, |location| self.handshake.is_outstanding(location))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    pub fn handshake(&self) -> &KmsHandshake {
        &self.handshake
    }

    /// Sends `activity` now if its conversation is ready and nothing is queued
    /// ahead of it, otherwise queues it and pushes readiness forward.
    pub fn post(
        &mut self,
        activity: MessageActivity,
        files: Vec<OutgoingFile>,
        reply: Completion<MessageActivity>,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let conversation_id = activity.conversation_id.clone();
        self.key_store.register(&conversation_id);
        let pending = PendingActivity::new(activity, files, reply);

        if !self.pending.has_pending(&conversation_id)
            && self.readiness(&conversation_id).satisfies(pending.requirement)
        {
            self.submit(pending, &mut actions);
            return actions;
        }

        info!(
            conversation_id = %conversation_id,
            requirement = ?pending.requirement,
            "activity: queued until conversation is ready"
        );
        self.pending.push(pending);
        self.advance(&conversation_id, &mut actions);
        actions
    }

    pub fn download(
        &mut self,
        conversation_id: &ConversationId,
        file: FileRef,
        mode: DownloadMode,
        reply: Completion<DownloadedFile>,
    ) -> Vec<EngineAction> {
        match self.key_store.key_for(conversation_id) {
            Some(key) => vec![EngineAction::Execute(ExecutionUnit::Download(DownloadUnit {
                file,
                mode,
                key: key.clone(),
                reply,
            }))],
            None => {
                let _ = reply.send(Err(ActivityError::MissingKeyMaterial {
                    conversation_id: conversation_id.to_string(),
                }));
                Vec::new()
            }
        }
    }

    pub fn receive_activity(&mut self, mut activity: MessageActivity) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        activity.mark_received();
        self.key_store.register(&activity.conversation_id);

        let location = match (&activity.encryption_key_url, activity.is_encrypted()) {
            (Some(location), true) => location.clone(),
            _ => {
                actions.push(EngineAction::Deliver(activity));
                return actions;
            }
        };

        if self
            .key_store
            .set_key_location(&activity.conversation_id, location.clone())
        {
            debug!(
                conversation_id = %activity.conversation_id,
                key_uri = %location,
                "keys: key location learned from inbound activity"
            );
        }

        if let Some(key) = self.key_store.key_for_location(&location).cloned() {
            self.deliver_received(activity, &key, &mut actions);
            return actions;
        }

        debug!(
            conversation_id = %activity.conversation_id,
            key_uri = %location,
            "activity: inbound activity waiting for key material"
        );
        self.received.push(location.clone(), activity);
        if self.identity.identity().is_none() {
            self.bootstrap_identity(&mut actions);
        } else {
            self.request_key_material(&location, &mut actions);
        }
        actions
    }

    /// Decrypts listed activities whose key is already known. The others are
    /// returned as ciphertext.
    pub fn decrypt_listed(&self, activities: Vec<MessageActivity>) -> Vec<MessageActivity> {
        activities
            .into_iter()
            .map(|mut activity| {
                activity.mark_received();
                let key = activity
                    .encryption_key_url
                    .as_ref()
                    .and_then(|location| self.key_store.key_for_location(location));
                match key {
                    Some(key) if activity.is_encrypted() => {
                        decrypt_incoming(&activity, key).unwrap_or_else(|err| {
                            warn!("activity: listed activity left encrypted: {err}");
                            activity
                        })
                    }
                    _ => activity,
                }
            })
            .collect()
    }

    pub fn receive_kms_messages(&mut self, messages: Vec<String>) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for message in messages {
            self.on_kms_message(&message, &mut actions);
        }
        actions
    }

    pub fn handle(&mut self, event: EngineEvent) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        match event {
            EngineEvent::UserIdFetched { round, result } => {
                if let Err(err) = &result {
                    warn!(round, "identity: user id fetch failed: {err:#}");
                }
                let progress = self.identity.on_user_id(round, result);
                self.on_bootstrap_progress(progress, &mut actions);
            }
            EngineEvent::KmsClusterFetched { round, result } => {
                if let Err(err) = &result {
                    warn!(round, "identity: kms cluster fetch failed: {err:#}");
                }
                let progress = self.identity.on_kms_cluster(round, result);
                self.on_bootstrap_progress(progress, &mut actions);
            }
            EngineEvent::HandshakeTokenAcquired { attempt, result } => {
                self.on_handshake_token(attempt, result, &mut actions);
            }
            EngineEvent::KmsDispatchFailed { correlation, error } => match correlation {
                KmsCorrelation::Ephemeral { request_id } => {
                    if self.handshake.expire(&request_id) {
                        warn!(request_id = %request_id, "kms: ephemeral key request dispatch failed: {error:#}");
                        self.fail_all(ActivityError::EphemeralKeyFetchFailed);
                    }
                }
                KmsCorrelation::Retrieve {
                    location,
                    request_id,
                } => {
                    if self.handshake.retrieve_failed(&location, &request_id) {
                        warn!(key_uri = %location, "kms: key retrieve dispatch failed: {error:#}");
                        self.fail_location(&location);
                    }
                }
            },
            EngineEvent::EphemeralDeadlineElapsed { request_id } => {
                if self.handshake.expire(&request_id) {
                    warn!(
                        request_id = %request_id,
                        pending = self.pending.len(),
                        "kms: ephemeral key handshake expired"
                    );
                    self.fail_all(ActivityError::EphemeralKeyFetchFailed);
                }
            }
            EngineEvent::KeyLocationFetched {
                conversation_id,
                result,
            } => self.on_key_location(conversation_id, result, &mut actions),
            EngineEvent::ShareLocationFetched {
                conversation_id,
                result,
            } => self.on_share_location(conversation_id, result, &mut actions),
        }
        actions
    }

    fn on_bootstrap_progress(&mut self, progress: BootstrapProgress, actions: &mut Vec<EngineAction>) {
        match progress {
            BootstrapProgress::Ready => {
                info!("identity: client identity ready");
                self.resume(actions);
            }
            BootstrapProgress::Failed => {
                self.fail_all(ActivityError::ClientIdentityFetchFailed);
            }
            BootstrapProgress::Waiting | BootstrapProgress::Stale => {}
        }
    }

    fn on_handshake_token(
        &mut self,
        attempt: u64,
        result: anyhow::Result<String>,
        actions: &mut Vec<EngineAction>,
    ) {
        let (bearer, identity) = match (result, self.identity.identity()) {
            (Ok(bearer), Some(identity)) => (bearer, identity.clone()),
            (Err(err), _) => {
                if self.handshake.abort_token(attempt) {
                    warn!(attempt, "kms: no access token for handshake: {err:#}");
                    self.fail_all(ActivityError::EphemeralKeyFetchFailed);
                }
                return;
            }
            (Ok(_), None) => return,
        };

        match self.handshake.begin(attempt, bearer, &identity) {
            Ok(Some(dispatch)) => {
                info!(request_id = %dispatch.request_id, "kms: ephemeral key handshake started");
                actions.push(EngineAction::SendKmsMessage {
                    message: dispatch.message,
                    destination: identity.kms_cluster.clone(),
                    correlation: KmsCorrelation::Ephemeral {
                        request_id: dispatch.request_id.clone(),
                    },
                });
                actions.push(EngineAction::ArmEphemeralDeadline {
                    request_id: dispatch.request_id,
                    after: self.ephemeral_key_timeout,
                });
            }
            Ok(None) => {}
            Err(err) => {
                warn!("kms: failed to build ephemeral key request: {err}");
                self.fail_all(ActivityError::EphemeralKeyFetchFailed);
            }
        }
    }

    fn on_kms_message(&mut self, message: &str, actions: &mut Vec<EngineAction>) {
        match self.handshake.on_kms_message(message) {
            KmsReplyOutcome::Established => {
                info!("kms: ephemeral key established");
                self.resume(actions);
            }
            KmsReplyOutcome::HandshakeFailed(err) => {
                warn!("kms: ephemeral key handshake rejected: {err}");
                self.fail_all(ActivityError::EphemeralKeyFetchFailed);
            }
            KmsReplyOutcome::KeyRetrieved { location, key } => {
                info!(key_uri = %location, "kms: key material retrieved");
                self.key_store.store_key(location.clone(), key);
                self.promote(&location, actions);
            }
            KmsReplyOutcome::RetrieveRejected { location, error } => {
                warn!(key_uri = %location, "kms: key retrieve rejected: {error}");
                self.fail_location(&location);
            }
            KmsReplyOutcome::Discarded(reason) => {
                debug!("kms: message discarded: {reason}");
            }
        }
    }

    fn on_key_location(
        &mut self,
        conversation_id: ConversationId,
        result: anyhow::Result<Option<KeyUri>>,
        actions: &mut Vec<EngineAction>,
    ) {
        self.location_fetches.remove(&conversation_id);
        match result {
            Ok(Some(location)) => {
                if self.key_store.set_key_location(&conversation_id, location.clone()) {
                    info!(conversation_id = %conversation_id, key_uri = %location, "keys: key location resolved");
                }
                if let Some(location) = self.key_store.key_location(&conversation_id).cloned() {
                    self.request_key_material(&location, actions);
                }
            }
            Ok(None) => {
                warn!(conversation_id = %conversation_id, "keys: conversation has no encryption key url");
                self.fail_conversation(&conversation_id);
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, "keys: key location fetch failed: {err:#}");
                self.fail_conversation(&conversation_id);
            }
        }
    }

    fn on_share_location(
        &mut self,
        conversation_id: ConversationId,
        result: anyhow::Result<SpaceUri>,
        actions: &mut Vec<EngineAction>,
    ) {
        self.share_fetches.remove(&conversation_id);
        match result {
            Ok(space) => {
                if self.key_store.set_share_location(&conversation_id, space.clone()) {
                    info!(conversation_id = %conversation_id, space = %space, "keys: share location resolved");
                }
            }
            Err(err) => {
                let failed = self.pending.drain_shares(&conversation_id);
                warn!(
                    conversation_id = %conversation_id,
                    failed = failed.len(),
                    "keys: share location fetch failed: {err:#}"
                );
                for pending in failed {
                    pending.fail(ActivityError::ShareLocationFetchFailed {
                        conversation_id: conversation_id.to_string(),
                    });
                }
            }
        }
        self.promote_conversation(&conversation_id, actions);
    }

    /// Next step of the readiness chain for one conversation.
    fn advance(&mut self, conversation_id: &ConversationId, actions: &mut Vec<EngineAction>) {
        if self.identity.identity().is_none() {
            self.bootstrap_identity(actions);
            return;
        }
        self.ensure_ephemeral_key(actions);
        match self.key_store.key_location(conversation_id).cloned() {
            Some(location) => self.request_key_material(&location, actions),
            None => self.ensure_key_location(conversation_id, actions),
        }
    }

    /// Re-drives every conversation and location that is waiting.
    fn resume(&mut self, actions: &mut Vec<EngineAction>) {
        for conversation_id in self.pending.conversations() {
            self.advance(&conversation_id, actions);
        }
        for location in self.received.locations() {
            self.request_key_material(&location, actions);
        }
    }

    fn bootstrap_identity(&mut self, actions: &mut Vec<EngineAction>) {
        if let Some(round) = self.identity.start() {
            info!(round, "identity: fetching client identity");
            actions.push(EngineAction::FetchUserId { round });
            actions.push(EngineAction::FetchKmsCluster { round });
        }
    }

    fn ensure_ephemeral_key(&mut self, actions: &mut Vec<EngineAction>) {
        let identity_ready = self.identity.identity().is_some();
        if let Some(attempt) = self.handshake.ensure_ephemeral_key(identity_ready) {
            actions.push(EngineAction::AcquireHandshakeToken { attempt });
        }
    }

    fn ensure_key_location(&mut self, conversation_id: &ConversationId, actions: &mut Vec<EngineAction>) {
        if self.location_fetches.insert(conversation_id.clone()) {
            debug!(conversation_id = %conversation_id, "keys: fetching key location");
            actions.push(EngineAction::FetchKeyLocation {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    fn ensure_share_location(&mut self, conversation_id: &ConversationId, actions: &mut Vec<EngineAction>) {
        if self.share_fetches.insert(conversation_id.clone()) {
            debug!(conversation_id = %conversation_id, "keys: allocating share location");
            actions.push(EngineAction::AllocateShareLocation {
                conversation_id: conversation_id.clone(),
            });
        }
    }

    fn request_key_material(&mut self, location: &KeyUri, actions: &mut Vec<EngineAction>) {
        let key_present = self.key_store.key_for_location(location).is_some();
        match self.handshake.request_key_material(location, key_present) {
            Ok(RetrieveStep::KeyAvailable) => self.promote(location, actions),
            Ok(RetrieveStep::AlreadyOutstanding) => {}
            Ok(RetrieveStep::AwaitingHandshake) => self.ensure_ephemeral_key(actions),
            Ok(RetrieveStep::Dispatch(dispatch)) => {
                let Some(destination) = self
                    .identity
                    .identity()
                    .map(|identity| identity.kms_cluster.clone())
                else {
                    warn!(key_uri = %location, "kms: no kms cluster for key retrieve");
                    self.handshake.retrieve_failed(location, &dispatch.request_id);
                    self.fail_location(location);
                    return;
                };
                debug!(key_uri = %location, request_id = %dispatch.request_id, "kms: key retrieve dispatched");
                actions.push(EngineAction::SendKmsMessage {
                    message: dispatch.message,
                    destination,
                    correlation: KmsCorrelation::Retrieve {
                        location: dispatch.location,
                        request_id: dispatch.request_id,
                    },
                });
            }
            Err(err) => {
                warn!(key_uri = %location, "kms: failed to build key retrieve: {err}");
                self.fail_location(location);
            }
        }
    }

    /// Key material for `location` became available.
    fn promote(&mut self, location: &KeyUri, actions: &mut Vec<EngineAction>) {
        let Some(key) = self.key_store.key_for_location(location).cloned() else {
            return;
        };
        for activity in self.received.take(location) {
            self.deliver_received(activity, &key, actions);
        }
        for conversation_id in self.key_store.conversations_at(location) {
            self.promote_conversation(&conversation_id, actions);
        }
    }

    /// Moves ready activities from the head of the conversation's queue to
    /// execution, stopping at the first one that is not ready.
    fn promote_conversation(&mut self, conversation_id: &ConversationId, actions: &mut Vec<EngineAction>) {
        loop {
            let readiness = self.readiness(conversation_id);
            match self.pending.pop_ready(conversation_id, readiness) {
                Some(pending) => self.submit(pending, actions),
                None => break,
            }
        }
        let share_blocked = self
            .pending
            .head(conversation_id)
            .is_some_and(PendingActivity::needs_share_location);
        if share_blocked && self.readiness(conversation_id) == Readiness::PostOnly {
            self.ensure_share_location(conversation_id, actions);
        }
    }

    fn submit(&mut self, pending: PendingActivity, actions: &mut Vec<EngineAction>) {
        let conversation_id = pending.conversation_id().clone();
        let (Some(location), Some(key)) = (
            self.key_store.key_location(&conversation_id).cloned(),
            self.key_store.key_for(&conversation_id).cloned(),
        ) else {
            pending.fail(ActivityError::MissingKeyMaterial {
                conversation_id: conversation_id.to_string(),
            });
            return;
        };

        let PendingActivity {
            mut activity,
            files,
            reply,
            ..
        } = pending;
        activity.encryption_key_url = Some(location);
        debug!(conversation_id = %conversation_id, "activity: promoted to execution");
        actions.push(EngineAction::Execute(ExecutionUnit::Post(PostUnit {
            activity,
            files,
            key,
            share_location: self.key_store.share_location(&conversation_id).cloned(),
            reply,
        })));
    }

    fn deliver_received(
        &self,
        activity: MessageActivity,
        key: &SymmetricKey,
        actions: &mut Vec<EngineAction>,
    ) {
        match decrypt_incoming(&activity, key) {
            Ok(activity) => actions.push(EngineAction::Deliver(activity)),
            Err(err) => {
                warn!(
                    conversation_id = %activity.conversation_id,
                    activity_id = ?activity.id,
                    "activity: dropping undecryptable inbound activity: {err}"
                );
                actions.push(EngineAction::Report(err));
            }
        }
    }

    fn fail_all(&mut self, err: ActivityError) {
        let failed = self.pending.drain_all();
        if !failed.is_empty() {
            warn!(count = failed.len(), "activity: failing all pending activities: {err}");
        }
        for pending in failed {
            pending.fail(err.clone());
        }
    }

    fn fail_conversation(&mut self, conversation_id: &ConversationId) {
        for pending in self.pending.drain_conversation(conversation_id) {
            pending.fail(ActivityError::EncryptionLocationFetchFailed {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    fn fail_location(&mut self, location: &KeyUri) {
        let err = ActivityError::KmsRetrieveFailed {
            key_uri: location.to_string(),
        };
        for conversation_id in self.key_store.conversations_at(location) {
            for pending in self.pending.drain_conversation(&conversation_id) {
                pending.fail(err.clone());
            }
        }
        let dropped = self.received.take(location);
        if !dropped.is_empty() {
            warn!(key_uri = %location, count = dropped.len(), "activity: dropping inbound activities without key");
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
