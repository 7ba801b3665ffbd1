use std::collections::HashMap;

use kms::SymmetricKey;
use shared::domain::{ConversationId, KeyState, KeyUri, Readiness, SpaceUri};

/// Provisioning record of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStoreEntry {
    pub conversation_id: ConversationId,
    pub key_location: Option<KeyUri>,
    pub share_location: Option<SpaceUri>,
}

/// Per-conversation key provisioning state.
///
/// Keys are held per location, so conversations sharing a location share the
/// key. A location, share location or key is written once and never replaced
/// for the lifetime of the store.
#[derive(Default)]
pub struct KeyStore {
    entries: HashMap<ConversationId, KeyStoreEntry>,
    keys: HashMap<KeyUri, SymmetricKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conversation_id: &ConversationId) -> &KeyStoreEntry {
        self.entries
            .entry(conversation_id.clone())
            .or_insert_with(|| KeyStoreEntry {
                conversation_id: conversation_id.clone(),
                ..KeyStoreEntry::default()
            })
    }

    pub fn entry(&self, conversation_id: &ConversationId) -> Option<&KeyStoreEntry> {
        self.entries.get(conversation_id)
    }

    pub fn key_location(&self, conversation_id: &ConversationId) -> Option<&KeyUri> {
        self.entry(conversation_id)?.key_location.as_ref()
    }

    pub fn share_location(&self, conversation_id: &ConversationId) -> Option<&SpaceUri> {
        self.entry(conversation_id)?.share_location.as_ref()
    }

    /// Returns false when the conversation already had a location.
    pub fn set_key_location(&mut self, conversation_id: &ConversationId, location: KeyUri) -> bool {
        self.register(conversation_id);
        match self.entries.get_mut(conversation_id) {
            Some(entry) if entry.key_location.is_none() => {
                entry.key_location = Some(location);
                true
            }
            _ => false,
        }
    }

    pub fn set_share_location(&mut self, conversation_id: &ConversationId, space: SpaceUri) -> bool {
        self.register(conversation_id);
        match self.entries.get_mut(conversation_id) {
            Some(entry) if entry.share_location.is_none() => {
                entry.share_location = Some(space);
                true
            }
            _ => false,
        }
    }

    /// Records key material confirmed by the KMS. Returns false when the
    /// location already had a key.
    pub fn store_key(&mut self, location: KeyUri, key: SymmetricKey) -> bool {
        if self.keys.contains_key(&location) {
            return false;
        }
        self.keys.insert(location, key);
        true
    }

    pub fn key_for_location(&self, location: &KeyUri) -> Option<&SymmetricKey> {
        self.keys.get(location)
    }

    pub fn key_for(&self, conversation_id: &ConversationId) -> Option<&SymmetricKey> {
        self.key_for_location(self.key_location(conversation_id)?)
    }

    pub fn readiness_for(&self, conversation_id: &ConversationId) -> Readiness {
        let Some(entry) = self.entry(conversation_id) else {
            return Readiness::NotReady;
        };
        let has_key = entry
            .key_location
            .as_ref()
            .is_some_and(|location| self.keys.contains_key(location));
        match (has_key, entry.share_location.is_some()) {
            (false, _) => Readiness::NotReady,
            (true, false) => Readiness::PostOnly,
            (true, true) => Readiness::PostAndShare,
        }
    }

    /// `is_requested` reports whether a KMS retrieve for a location is
    /// outstanding.
    pub fn key_state(
        &self,
        conversation_id: &ConversationId,
        is_requested: impl Fn(&KeyUri) -> bool,
    ) -> KeyState {
        match self.key_location(conversation_id) {
            None => KeyState::Unknown,
            Some(location) if self.keys.contains_key(location) => KeyState::KeyAvailable,
            Some(location) if is_requested(location) => KeyState::KeyRequested,
            Some(_) => KeyState::LocationKnown,
        }
    }

    /// Conversations bound to `location`, in id order.
    pub fn conversations_at(&self, location: &KeyUri) -> Vec<ConversationId> {
        let mut conversations: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.key_location.as_ref() == Some(location))
            .map(|entry| entry.conversation_id.clone())
            .collect();
        conversations.sort();
        conversations
    }
}

#[cfg(test)]
#[path = "tests/key_store_tests.rs"]
mod tests;
