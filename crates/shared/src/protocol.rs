use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActivityId, ActivityVerb, ContentState, ConversationId, KeyUri, SpaceUri};

/// A conversation activity. The same struct is used for outgoing and incoming
/// activities; `content_state` records whether the content fields currently
/// hold ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ActivityId>,
    pub conversation_id: ConversationId,
    pub verb: ActivityVerb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<MentionList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_url: Option<KeyUri>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub content_state: ContentState,
}

impl MessageActivity {
    pub fn new(conversation_id: ConversationId, verb: ActivityVerb) -> Self {
        Self {
            id: None,
            conversation_id,
            verb,
            text: None,
            files: Vec::new(),
            mentions: None,
            encryption_key_url: None,
            actor_id: None,
            published: None,
            content_state: ContentState::Plain,
        }
    }

    /// Activity referring to an earlier one, e.g. a delete or a read receipt.
    pub fn referring(conversation_id: ConversationId, verb: ActivityVerb, target: ActivityId) -> Self {
        let mut activity = Self::new(conversation_id, verb);
        activity.id = Some(target);
        activity
    }

    /// Attaches mentions; an empty list leaves the activity without any.
    pub fn with_mentions(mut self, mentions: Vec<Mention>) -> Self {
        self.mentions = (!mentions.is_empty()).then_some(MentionList { items: mentions });
        self
    }

    pub fn mention_items(&self) -> &[Mention] {
        self.mentions
            .as_ref()
            .map(|list| list.items.as_slice())
            .unwrap_or_default()
    }

    /// Parses an activity as delivered by the service and tags its content
    /// as ciphertext when it is bound to a key location.
    pub fn from_wire(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut activity: Self = serde_json::from_value(value)?;
        activity.mark_received();
        Ok(activity)
    }

    pub fn mark_received(&mut self) {
        if self.encryption_key_url.is_some() && self.verb.carries_content() {
            self.content_state = ContentState::Cipher;
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.content_state == ContentState::Cipher
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MentionKind {
    Person,
    /// Everyone in the conversation.
    GroupMention,
}

/// A mentioned person, or the whole conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub object_type: MentionKind,
}

impl Mention {
    pub fn person(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            object_type: MentionKind::Person,
        }
    }

    pub fn all() -> Self {
        Self {
            id: None,
            object_type: MentionKind::GroupMention,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionList {
    #[serde(default)]
    pub items: Vec<Mention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub display_name: String,
    pub source_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub source_uri: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingActivity {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "flag-item")]
    pub flag_item: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_url: Option<KeyUri>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub space_url: SpaceUri,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsClusterInfo {
    pub kms_cluster: String,
    /// Long-term public key of the KMS, base64url encoded.
    pub public_key: String,
}

/// Body of a KMS message exchange, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KmsMessageBatch {
    pub kms_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatusRequest {
    pub event_type: String,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRequest {
    #[serde(rename = "flag-item")]
    pub flag_item: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityList {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

/// Query parameters of `GET activities`.
#[derive(Debug, Clone, Default)]
pub struct ListActivitiesQuery {
    pub conversation_id: ConversationId,
    pub since_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub mid_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub person_refresh: bool,
    pub last_activity_first: bool,
}

impl ListActivitiesQuery {
    pub fn for_conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            ..Self::default()
        }
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![(
            "conversationId".to_string(),
            self.conversation_id.to_string(),
        )];
        let dates = [
            ("sinceDate", self.since_date),
            ("maxDate", self.max_date),
            ("midDate", self.mid_date),
        ];
        for (name, date) in dates {
            if let Some(date) = date {
                pairs.push((name.to_string(), date.to_rfc3339()));
            }
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs.push(("personRefresh".to_string(), self.person_refresh.to_string()));
        pairs.push((
            "lastActivityFirst".to_string(),
            self.last_activity_first.to_string(),
        ));
        pairs
    }
}

/// Events delivered by the real-time push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum PushEvent {
    #[serde(rename = "conversation.activity")]
    Activity { activity: MessageActivity },
    #[serde(rename = "status.start_typing")]
    StartTyping {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        #[serde(rename = "actorId", default)]
        actor_id: Option<String>,
    },
    #[serde(rename = "status.stop_typing")]
    StopTyping {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        #[serde(rename = "actorId", default)]
        actor_id: Option<String>,
    },
    #[serde(rename = "flag.update")]
    Flag { flag: FlagActivity },
    #[serde(rename = "encryption.kms_message")]
    KmsMessage { encryption: KmsMessageBatch },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_activity_with_key_url_is_tagged_cipher() {
        let activity = MessageActivity::from_wire(serde_json::json!({
            "id": "A1",
            "conversationId": "R1",
            "verb": "post",
            "text": "b64-ciphertext",
            "encryptionKeyUrl": "kms://cluster/keys/L1",
        }))
        .expect("parse");
        assert_eq!(activity.content_state, ContentState::Cipher);

        let delete = MessageActivity::from_wire(serde_json::json!({
            "id": "A2",
            "conversationId": "R1",
            "verb": "delete",
            "encryptionKeyUrl": "kms://cluster/keys/L1",
        }))
        .expect("parse");
        assert_eq!(delete.content_state, ContentState::Plain);
    }

    #[test]
    fn mentions_travel_as_an_item_list() {
        let activity = MessageActivity::new(ConversationId::new("R1"), ActivityVerb::Post)
            .with_mentions(vec![Mention::person("u2"), Mention::all()]);
        let wire = serde_json::to_value(&activity).expect("json");
        assert_eq!(
            wire["mentions"],
            serde_json::json!({
                "items": [
                    { "id": "u2", "objectType": "person" },
                    { "objectType": "groupMention" },
                ]
            })
        );

        let back = MessageActivity::from_wire(wire).expect("parse");
        assert_eq!(back.mention_items(), activity.mention_items());

        let plain = MessageActivity::new(ConversationId::new("R1"), ActivityVerb::Post)
            .with_mentions(Vec::new());
        let wire = serde_json::to_value(&plain).expect("json");
        assert!(wire.get("mentions").is_none());
        assert!(plain.mention_items().is_empty());
    }

    #[test]
    fn list_query_skips_unset_dates() {
        let mut query = ListActivitiesQuery::for_conversation(ConversationId::new("R1"));
        query.limit = Some(6);
        let pairs = query.to_pairs();
        assert!(pairs.iter().any(|(k, v)| k == "limit" && v == "6"));
        assert!(!pairs.iter().any(|(k, _)| k == "sinceDate"));
        assert_eq!(pairs[0], ("conversationId".to_string(), "R1".to_string()));
    }

    #[test]
    fn push_events_are_tagged_by_event_type() {
        let raw = r#"{"eventType":"status.start_typing","conversationId":"R1","actorId":"u2"}"#;
        let event: PushEvent = serde_json::from_str(raw).expect("parse");
        assert!(matches!(
            event,
            PushEvent::StartTyping { ref conversation_id, .. } if conversation_id.as_str() == "R1"
        ));

        let raw = r#"{"eventType":"encryption.kms_message","encryption":{"kmsMessages":["m1"]}}"#;
        let event: PushEvent = serde_json::from_str(raw).expect("parse");
        assert!(matches!(event, PushEvent::KmsMessage { ref encryption } if encryption.kms_messages.len() == 1));
    }
}
