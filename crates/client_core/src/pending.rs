use std::collections::{HashMap, VecDeque};

use shared::{
    domain::{ConversationId, KeyUri, Readiness},
    protocol::MessageActivity,
};
use tokio::sync::oneshot;

use crate::{error::ActivityError, execution::OutgoingFile};

pub(crate) type Completion<T> = oneshot::Sender<Result<T, ActivityError>>;

/// An outgoing activity waiting for its conversation to become ready.
#[derive(Debug)]
pub struct PendingActivity {
    pub activity: MessageActivity,
    pub files: Vec<OutgoingFile>,
    pub requirement: Readiness,
    pub(crate) reply: Completion<MessageActivity>,
}

impl PendingActivity {
    pub(crate) fn new(
        activity: MessageActivity,
        files: Vec<OutgoingFile>,
        reply: Completion<MessageActivity>,
    ) -> Self {
        let requirement = if files.is_empty() && activity.files.is_empty() {
            Readiness::PostOnly
        } else {
            Readiness::PostAndShare
        };
        Self {
            activity,
            files,
            requirement,
            reply,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.activity.conversation_id
    }

    pub fn needs_share_location(&self) -> bool {
        self.requirement == Readiness::PostAndShare
    }

    pub(crate) fn fail(self, err: ActivityError) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(Err(err));
    }
}

/// Outgoing activities held per conversation, strictly FIFO.
#[derive(Debug, Default)]
pub struct PendingQueue {
    by_conversation: HashMap<ConversationId, VecDeque<PendingActivity>>,
}

impl PendingQueue {
    pub fn push(&mut self, pending: PendingActivity) {
        self.by_conversation
            .entry(pending.conversation_id().clone())
            .or_default()
            .push_back(pending);
    }

    pub fn has_pending(&self, conversation_id: &ConversationId) -> bool {
        self.by_conversation
            .get(conversation_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    pub fn head(&self, conversation_id: &ConversationId) -> Option<&PendingActivity> {
        self.by_conversation.get(conversation_id)?.front()
    }

    /// Pops the head of the conversation if `readiness` satisfies it.
    pub fn pop_ready(
        &mut self,
        conversation_id: &ConversationId,
        readiness: Readiness,
    ) -> Option<PendingActivity> {
        let queue = self.by_conversation.get_mut(conversation_id)?;
        if !readiness.satisfies(queue.front()?.requirement) {
            return None;
        }
        let pending = queue.pop_front();
        if queue.is_empty() {
            self.by_conversation.remove(conversation_id);
        }
        pending
    }

    pub fn drain_conversation(&mut self, conversation_id: &ConversationId) -> Vec<PendingActivity> {
        self.by_conversation
            .remove(conversation_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Removes the conversation's share activities, keeping the rest in order.
    pub fn drain_shares(&mut self, conversation_id: &ConversationId) -> Vec<PendingActivity> {
        let Some(queue) = self.by_conversation.remove(conversation_id) else {
            return Vec::new();
        };
        let (shares, rest): (VecDeque<_>, VecDeque<_>) =
            queue.into_iter().partition(PendingActivity::needs_share_location);
        if !rest.is_empty() {
            self.by_conversation.insert(conversation_id.clone(), rest);
        }
        shares.into()
    }

    pub fn drain_all(&mut self) -> Vec<PendingActivity> {
        let mut conversations: Vec<_> = self.by_conversation.drain().collect();
        conversations.sort_by(|a, b| a.0.cmp(&b.0));
        conversations
            .into_iter()
            .flat_map(|(_, queue)| queue)
            .collect()
    }

    pub fn conversations(&self) -> Vec<ConversationId> {
        let mut conversations: Vec<_> = self.by_conversation.keys().cloned().collect();
        conversations.sort();
        conversations
    }

    pub fn len(&self) -> usize {
        self.by_conversation.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conversation.is_empty()
    }
}

/// Inbound ciphertext activities waiting for the key of their location.
#[derive(Debug, Default)]
pub struct ReceiveQueue {
    by_location: HashMap<KeyUri, Vec<MessageActivity>>,
}

impl ReceiveQueue {
    pub fn push(&mut self, location: KeyUri, activity: MessageActivity) {
        self.by_location.entry(location).or_default().push(activity);
    }

    pub fn take(&mut self, location: &KeyUri) -> Vec<MessageActivity> {
        self.by_location.remove(location).unwrap_or_default()
    }

    pub fn locations(&self) -> Vec<KeyUri> {
        let mut locations: Vec<_> = self.by_location.keys().cloned().collect();
        locations.sort();
        locations
    }

    pub fn len(&self) -> usize {
        self.by_location.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::ActivityVerb;

    use super::*;

    fn pending(conversation: &str, text: &str, with_file: bool) -> PendingActivity {
        let mut activity = MessageActivity::new(
            ConversationId::new(conversation),
            if with_file { ActivityVerb::Share } else { ActivityVerb::Post },
        );
        activity.text = Some(text.to_string());
        let files = if with_file {
            vec![OutgoingFile::new("a.txt", b"abc".to_vec())]
        } else {
            Vec::new()
        };
        let (reply, _rx) = oneshot::channel();
        PendingActivity::new(activity, files, reply)
    }

    fn texts(items: &[PendingActivity]) -> Vec<&str> {
        items
            .iter()
            .map(|p| p.activity.text.as_deref().unwrap_or_default())
            .collect()
    }

    #[test]
    fn share_head_blocks_posts_behind_it() {
        let r1 = ConversationId::new("R1");
        let mut queue = PendingQueue::default();
        queue.push(pending("R1", "share", true));
        queue.push(pending("R1", "post", false));

        assert!(queue.pop_ready(&r1, Readiness::PostOnly).is_none());
        let head = queue.pop_ready(&r1, Readiness::PostAndShare).expect("share");
        assert_eq!(head.activity.text.as_deref(), Some("share"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn draining_shares_keeps_remaining_order() {
        let r1 = ConversationId::new("R1");
        let mut queue = PendingQueue::default();
        queue.push(pending("R1", "p1", false));
        queue.push(pending("R1", "s1", true));
        queue.push(pending("R1", "p2", false));
        queue.push(pending("R1", "s2", true));
        queue.push(pending("R2", "other", true));

        let shares = queue.drain_shares(&r1);
        assert_eq!(texts(&shares), vec!["s1", "s2"]);
        assert_eq!(texts(&queue.drain_conversation(&r1)), vec!["p1", "p2"]);
        assert_eq!(queue.conversations(), vec![ConversationId::new("R2")]);
    }

    #[test]
    fn empty_queues_are_forgotten() {
        let r1 = ConversationId::new("R1");
        let mut queue = PendingQueue::default();
        queue.push(pending("R1", "p1", false));
        assert!(queue.pop_ready(&r1, Readiness::PostOnly).is_some());
        assert!(!queue.has_pending(&r1));
        assert!(queue.is_empty());
    }

    #[test]
    fn receive_queue_groups_by_location() {
        let mut received = ReceiveQueue::default();
        let l1 = KeyUri::new("kms://keys/L1");
        received.push(l1.clone(), MessageActivity::new("R1".into(), ActivityVerb::Post));
        received.push(l1.clone(), MessageActivity::new("R2".into(), ActivityVerb::Post));
        received.push(KeyUri::new("kms://keys/L2"), MessageActivity::new("R3".into(), ActivityVerb::Post));

        assert_eq!(received.len(), 3);
        assert_eq!(received.take(&l1).len(), 2);
        assert!(received.take(&l1).is_empty());
        assert_eq!(received.locations(), vec![KeyUri::new("kms://keys/L2")]);
    }
}
