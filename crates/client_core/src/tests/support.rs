//! In-memory stand-ins for the conversation, KMS and file services.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use kms::{KmsRequest, KmsResponder, SymmetricKey};
use serde_json::{json, Value};
use shared::protocol::KmsMessageBatch;
use tokio::sync::mpsc;

use crate::transport::{HttpMethod, ServiceRequest, Transport};

pub(crate) const KMS_CLUSTER: &str = "kms://cluster";

#[derive(Default)]
struct FakeState {
    key_urls: HashMap<String, Option<String>>,
    content_keys: HashMap<String, SymmetricKey>,
    session: Option<SymmetricKey>,
    failing: HashSet<String>,
    hold_kms: bool,
    held_kms: Vec<String>,
    posted: Vec<Value>,
    requests: Vec<(HttpMethod, String)>,
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
}

/// Answers every request the client makes. KMS replies are pushed, wrapped
/// in a push event, to the receiver returned by [`FakeServices::new`].
pub(crate) struct FakeServices {
    kms: KmsResponder,
    state: Mutex<FakeState>,
    push: mpsc::UnboundedSender<String>,
}

impl FakeServices {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (push, rx) = mpsc::unbounded_channel();
        let services = Arc::new(Self {
            kms: KmsResponder::generate(),
            state: Mutex::new(FakeState::default()),
            push,
        });
        (services, rx)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state lock")
    }

    /// Binds a conversation to a key location; `None` leaves it without one.
    pub(crate) fn set_key_url(&self, conversation_id: &str, key_url: Option<&str>) {
        self.state()
            .key_urls
            .insert(conversation_id.to_string(), key_url.map(str::to_string));
    }

    pub(crate) fn key_url(&self, conversation_id: &str) -> Option<String> {
        self.state()
            .key_urls
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| Some(format!("{KMS_CLUSTER}/keys/{conversation_id}")))
    }

    pub(crate) fn content_key(&self, key_url: &str) -> SymmetricKey {
        self.state()
            .content_keys
            .entry(key_url.to_string())
            .or_insert_with(SymmetricKey::generate)
            .clone()
    }

    /// Makes requests whose path starts with `prefix` fail.
    pub(crate) fn fail_path(&self, prefix: &str) {
        self.state().failing.insert(prefix.to_string());
    }

    pub(crate) fn hold_kms(&self, hold: bool) {
        self.state().hold_kms = hold;
    }

    /// Pushes every held KMS reply.
    pub(crate) fn release_kms(&self) {
        let held = std::mem::take(&mut self.state().held_kms);
        for reply in held {
            self.push_kms_reply(reply);
        }
    }

    pub(crate) fn posted(&self) -> Vec<Value> {
        self.state().posted.clone()
    }

    pub(crate) fn requests(&self) -> Vec<(HttpMethod, String)> {
        self.state().requests.clone()
    }

    pub(crate) fn request_count(&self, method: HttpMethod, path: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|(m, p)| *m == method && p == path)
            .count()
    }

    pub(crate) fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(url).cloned()
    }

    pub(crate) fn put_blob(&self, url: &str, bytes: Vec<u8>) {
        self.state().blobs.insert(url.to_string(), bytes);
    }

    fn push_kms_reply(&self, reply: String) {
        let event = json!({
            "eventType": "encryption.kms_message",
            "encryption": { "kmsMessages": [reply] },
        });
        let _ = self.push.send(event.to_string());
    }

    fn answer_kms(&self, message: &str) -> Result<String> {
        // Create requests are a compact JWE-like token; retrieves are sealed
        // under the session key.
        if message.contains('.') {
            let opened = self.kms.open_create(message)?;
            let (reply, session) = self.kms.accept_create(&opened)?;
            self.state().session = Some(session);
            return Ok(reply);
        }
        let session = self
            .state()
            .session
            .clone()
            .ok_or_else(|| anyhow!("retrieve before ephemeral key"))?;
        let request = KmsRequest::open(&session, message)?;
        let key = self.content_key(&request.uri);
        Ok(KmsResponder::answer_retrieve(&session, &request, &key)?)
    }

    fn route(&self, request: &ServiceRequest) -> Result<Value> {
        let path = request.path.trim_start_matches('/');
        let segments: Vec<&str> = path.split('/').collect();
        match (request.method, segments.as_slice()) {
            (HttpMethod::Get, ["users"]) => Ok(json!({ "id": "u1" })),
            (HttpMethod::Get, ["kms"]) => Ok(json!({
                "kmsCluster": KMS_CLUSTER,
                "publicKey": self.kms.public_key(),
            })),
            (HttpMethod::Get, ["conversations", id]) => {
                let mut info = json!({ "id": id });
                if let Some(key_url) = self.key_url(id) {
                    info["encryptionKeyUrl"] = json!(key_url);
                }
                Ok(info)
            }
            (HttpMethod::Put, ["conversations", id, "space"]) => {
                Ok(json!({ "spaceUrl": format!("https://files/spaces/{id}") }))
            }
            (HttpMethod::Post, ["activities"]) => {
                let mut body = request.body.clone().unwrap_or(Value::Null);
                let mut state = self.state();
                state.next_id += 1;
                body["id"] = json!(format!("A{}", state.next_id));
                body["published"] = json!("2024-05-01T10:00:00Z");
                state.posted.push(body.clone());
                Ok(body)
            }
            (HttpMethod::Get, ["activities"]) => {
                let conversation = request
                    .query
                    .iter()
                    .find(|(name, _)| name == "conversationId")
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                let items: Vec<Value> = self
                    .state()
                    .posted
                    .iter()
                    .filter(|item| item["conversationId"] == conversation.as_str())
                    .cloned()
                    .collect();
                Ok(json!({ "items": items }))
            }
            (HttpMethod::Get, ["activities", id]) => self
                .state()
                .posted
                .iter()
                .find(|item| item["id"] == *id)
                .cloned()
                .ok_or_else(|| anyhow!("404 activity {id} not found")),
            (HttpMethod::Post, ["status", "typing"]) => Ok(Value::Null),
            (HttpMethod::Post, ["flags"]) => {
                let mut body = request.body.clone().unwrap_or(Value::Null);
                body["id"] = json!("F1");
                Ok(body)
            }
            (HttpMethod::Delete, ["flags", _]) => Ok(Value::Null),
            _ => bail!("no route for {} {path}", request.method.as_str()),
        }
    }
}

#[async_trait]
impl Transport for FakeServices {
    async fn send(&self, request: ServiceRequest) -> Result<Value> {
        let path = request.path.trim_start_matches('/').to_string();
        {
            let mut state = self.state();
            state.requests.push((request.method, path.clone()));
            if state.failing.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                bail!("{} {path} failed with 503", request.method.as_str());
            }
        }
        self.route(&request)
    }

    async fn send_raw(&self, url: &str, body: String, _headers: Vec<(String, String)>) -> Result<String> {
        let batch: KmsMessageBatch = serde_json::from_str(&body)?;
        if batch.destination.as_deref() != Some(KMS_CLUSTER) {
            bail!("unexpected kms destination {:?}", batch.destination);
        }
        self.state().requests.push((HttpMethod::Post, url.to_string()));
        for message in batch.kms_messages {
            let reply = self.answer_kms(&message)?;
            let mut state = self.state();
            if state.hold_kms {
                state.held_kms.push(reply);
            } else {
                drop(state);
                self.push_kms_reply(reply);
            }
        }
        Ok(String::new())
    }

    async fn upload(&self, url: &str, bytes: Vec<u8>, _content_type: &str) -> Result<Value> {
        let mut state = self.state();
        let location = format!("{url}/files/{}", state.blobs.len() + 1);
        state.blobs.insert(location.clone(), bytes);
        Ok(json!({ "url": location }))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.blob(url).ok_or_else(|| anyhow!("404 {url}"))
    }
}
