//! Public façade over the activity engine.
//!
//! [`ActivityClient`] is a cheap, cloneable handle. All engine state lives in
//! one actor task; handles talk to it over a command channel and collaborator
//! calls made on the engine's behalf report back on a second channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ActivityId, ActivityVerb, ConversationId, KeyState, Readiness},
    protocol::{
        ActivityList, ConversationInfo, FileRef, FlagActivity, FlagRequest, KmsClusterInfo,
        KmsMessageBatch, ListActivitiesQuery, Mention, MessageActivity, PushEvent, SpaceInfo,
        TypingActivity, TypingStatusRequest, UserInfo,
    },
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    config::ClientSettings,
    engine::{Engine, EngineAction, EngineEvent, KmsCorrelation},
    error::ActivityError,
    execution::{DownloadMode, DownloadedFile, ExecutionQueue, OutgoingFile},
    transport::{Authenticator, Service, ServiceRequest, Transport},
};

const START_TYPING: &str = "status.start_typing";
const STOP_TYPING: &str = "status.stop_typing";
const FLAGGED: &str = "flagged";

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    /// A decrypted inbound activity.
    Message(MessageActivity),
    Typing(TypingActivity),
    Flag(FlagActivity),
    Error(ActivityError),
}

enum Command {
    Post {
        activity: MessageActivity,
        files: Vec<OutgoingFile>,
        reply: oneshot::Sender<Result<MessageActivity, ActivityError>>,
    },
    Download {
        conversation_id: ConversationId,
        file: FileRef,
        mode: DownloadMode,
        reply: oneshot::Sender<Result<DownloadedFile, ActivityError>>,
    },
    ReceiveActivity(MessageActivity),
    ReceiveKmsMessages(Vec<String>),
    DecryptListed {
        activities: Vec<MessageActivity>,
        reply: oneshot::Sender<Vec<MessageActivity>>,
    },
    Readiness {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Readiness>,
    },
    KeyState {
        conversation_id: ConversationId,
        reply: oneshot::Sender<KeyState>,
    },
}

#[derive(Clone)]
pub struct ActivityClient {
    commands: mpsc::UnboundedSender<Command>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<ActivityEvent>,
}

impl ActivityClient {
    /// Spawns the engine actor; must be called inside a tokio runtime.
    pub fn new(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (feedback, feedback_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            engine: Engine::new(&settings),
            kms_messages_url: settings.kms_messages_url(),
            execution: ExecutionQueue::spawn(Arc::clone(&transport)),
            transport: Arc::clone(&transport),
            authenticator,
            events: events.clone(),
            feedback,
        };
        tokio::spawn(actor.run(command_rx, feedback_rx));

        Self {
            commands,
            transport,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ActivityEvent> {
        self.events.subscribe()
    }

    /// Encrypts and posts a message, uploading `files` first when present.
    /// Mentions travel in the clear so the service can notify their targets.
    pub async fn post(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        mentions: Vec<Mention>,
        files: Vec<OutgoingFile>,
    ) -> Result<MessageActivity, ActivityError> {
        let verb = if files.is_empty() {
            ActivityVerb::Post
        } else {
            ActivityVerb::Share
        };
        let mut activity = MessageActivity::new(conversation_id.clone(), verb).with_mentions(mentions);
        activity.text = Some(text.to_string());
        self.post_activity(activity, files).await
    }

    /// Posts a caller-built activity through the encryption pipeline.
    pub async fn post_activity(
        &self,
        activity: MessageActivity,
        files: Vec<OutgoingFile>,
    ) -> Result<MessageActivity, ActivityError> {
        self.request(|reply| Command::Post {
            activity,
            files,
            reply,
        })
        .await?
    }

    pub async fn delete(
        &self,
        conversation_id: &ConversationId,
        activity_id: &ActivityId,
    ) -> Result<MessageActivity, ActivityError> {
        self.send_referring(conversation_id, ActivityVerb::Delete, activity_id)
            .await
    }

    /// Acknowledges (marks read) an activity.
    pub async fn read(
        &self,
        conversation_id: &ConversationId,
        activity_id: &ActivityId,
    ) -> Result<MessageActivity, ActivityError> {
        self.send_referring(conversation_id, ActivityVerb::Acknowledge, activity_id)
            .await
    }

    /// Lists activities; those whose key is already known come back decrypted.
    pub async fn list(
        &self,
        query: &ListActivitiesQuery,
    ) -> Result<Vec<MessageActivity>, ActivityError> {
        let request = ServiceRequest::get(Service::Activity, "activities").query_pairs(query.to_pairs());
        let list: ActivityList = self.fetch(request).await?;
        let activities = list
            .items
            .into_iter()
            .map(MessageActivity::from_wire)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ActivityError::InvalidResponse(format!("activity list: {err}")))?;
        self.decrypt_listed(activities).await
    }

    pub async fn get(&self, activity_id: &ActivityId) -> Result<MessageActivity, ActivityError> {
        let request = ServiceRequest::get(Service::Activity, format!("activities/{activity_id}"));
        let value = self
            .transport
            .send(request)
            .await
            .map_err(ActivityError::transport)?;
        let activity = MessageActivity::from_wire(value)
            .map_err(|err| ActivityError::InvalidResponse(format!("activity {activity_id}: {err}")))?;
        let mut decrypted = self.decrypt_listed(vec![activity]).await?;
        decrypted
            .pop()
            .ok_or_else(|| ActivityError::InvalidResponse(format!("activity {activity_id} lost")))
    }

    pub async fn start_typing(&self, conversation_id: &ConversationId) -> Result<(), ActivityError> {
        self.send_typing(conversation_id, START_TYPING).await
    }

    pub async fn stop_typing(&self, conversation_id: &ConversationId) -> Result<(), ActivityError> {
        self.send_typing(conversation_id, STOP_TYPING).await
    }

    pub async fn flag(&self, flag_item: &str) -> Result<FlagActivity, ActivityError> {
        let body = FlagRequest {
            flag_item: flag_item.to_string(),
            state: FLAGGED.to_string(),
        };
        let request = ServiceRequest::post(Service::Flag, "flags")
            .json(&body)
            .map_err(|err| ActivityError::InvalidResponse(format!("{err:#}")))?;
        self.fetch(request).await
    }

    pub async fn unflag(&self, flag_id: &str) -> Result<(), ActivityError> {
        let request = ServiceRequest::delete(Service::Flag, format!("flags/{flag_id}"));
        self.transport
            .send(request)
            .await
            .map_err(ActivityError::transport)?;
        Ok(())
    }

    /// Downloads and decrypts a shared file and its thumbnail.
    pub async fn download_file(
        &self,
        conversation_id: &ConversationId,
        file: &FileRef,
    ) -> Result<DownloadedFile, ActivityError> {
        self.download(conversation_id, file, DownloadMode::Full).await
    }

    /// `None` when the file has no thumbnail.
    pub async fn download_thumbnail(
        &self,
        conversation_id: &ConversationId,
        file: &FileRef,
    ) -> Result<Option<Vec<u8>>, ActivityError> {
        let downloaded = self
            .download(conversation_id, file, DownloadMode::ThumbnailOnly)
            .await?;
        Ok(downloaded.thumbnail)
    }

    pub async fn download_file_body(
        &self,
        conversation_id: &ConversationId,
        file: &FileRef,
    ) -> Result<Vec<u8>, ActivityError> {
        self.download(conversation_id, file, DownloadMode::BodyOnly)
            .await?
            .body
            .ok_or_else(|| ActivityError::InvalidResponse(format!("no body for {}", file.source_uri)))
    }

    /// Feeds one raw push-channel payload to the client.
    pub async fn receive_push_event(&self, raw: &str) -> Result<(), ActivityError> {
        let event: PushEvent = serde_json::from_str(raw)
            .map_err(|err| ActivityError::InvalidResponse(format!("push event: {err}")))?;
        match event {
            PushEvent::Activity { activity } => self.receive_new_activity(activity),
            PushEvent::StartTyping {
                conversation_id,
                actor_id,
            } => self.emit(ActivityEvent::Typing(TypingActivity {
                conversation_id,
                actor_id,
                is_typing: true,
            })),
            PushEvent::StopTyping {
                conversation_id,
                actor_id,
            } => self.emit(ActivityEvent::Typing(TypingActivity {
                conversation_id,
                actor_id,
                is_typing: false,
            })),
            PushEvent::Flag { flag } => self.emit(ActivityEvent::Flag(flag)),
            PushEvent::KmsMessage { encryption } => self.receive_kms_messages(encryption.kms_messages),
        }
    }

    /// Inbound activity; emitted as [`ActivityEvent::Message`] once decrypted.
    pub fn receive_new_activity(&self, activity: MessageActivity) -> Result<(), ActivityError> {
        self.command(Command::ReceiveActivity(activity))
    }

    /// A single KMS message delivered outside a push event.
    pub fn receive_kms_message(&self, message: impl Into<String>) -> Result<(), ActivityError> {
        self.receive_kms_messages(vec![message.into()])
    }

    pub async fn readiness(&self, conversation_id: &ConversationId) -> Result<Readiness, ActivityError> {
        let conversation_id = conversation_id.clone();
        self.request(|reply| Command::Readiness {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn key_state(&self, conversation_id: &ConversationId) -> Result<KeyState, ActivityError> {
        let conversation_id = conversation_id.clone();
        self.request(|reply| Command::KeyState {
            conversation_id,
            reply,
        })
        .await
    }

    fn receive_kms_messages(&self, messages: Vec<String>) -> Result<(), ActivityError> {
        self.command(Command::ReceiveKmsMessages(messages))
    }

    fn emit(&self, event: ActivityEvent) -> Result<(), ActivityError> {
        // No subscribers is not an error.
        let _ = self.events.send(event);
        Ok(())
    }

    async fn download(
        &self,
        conversation_id: &ConversationId,
        file: &FileRef,
        mode: DownloadMode,
    ) -> Result<DownloadedFile, ActivityError> {
        let conversation_id = conversation_id.clone();
        let file = file.clone();
        self.request(|reply| Command::Download {
            conversation_id,
            file,
            mode,
            reply,
        })
        .await?
    }

    async fn decrypt_listed(
        &self,
        activities: Vec<MessageActivity>,
    ) -> Result<Vec<MessageActivity>, ActivityError> {
        self.request(|reply| Command::DecryptListed { activities, reply })
            .await
    }

    async fn send_referring(
        &self,
        conversation_id: &ConversationId,
        verb: ActivityVerb,
        activity_id: &ActivityId,
    ) -> Result<MessageActivity, ActivityError> {
        let activity = MessageActivity::referring(conversation_id.clone(), verb, activity_id.clone());
        let request = ServiceRequest::post(Service::Activity, "activities")
            .json(&activity)
            .map_err(|err| ActivityError::InvalidResponse(format!("{err:#}")))?;
        let value = self
            .transport
            .send(request)
            .await
            .map_err(ActivityError::transport)?;
        MessageActivity::from_wire(value)
            .map_err(|err| ActivityError::InvalidResponse(format!("{verb:?} echo: {err}")))
    }

    async fn send_typing(
        &self,
        conversation_id: &ConversationId,
        event_type: &str,
    ) -> Result<(), ActivityError> {
        let body = TypingStatusRequest {
            event_type: event_type.to_string(),
            conversation_id: conversation_id.clone(),
        };
        let request = ServiceRequest::post(Service::Activity, "status/typing")
            .json(&body)
            .map_err(|err| ActivityError::InvalidResponse(format!("{err:#}")))?;
        self.transport
            .send(request)
            .await
            .map_err(ActivityError::transport)?;
        Ok(())
    }

    async fn fetch<T: DeserializeOwned>(&self, request: ServiceRequest) -> Result<T, ActivityError> {
        let value = self
            .transport
            .send(request)
            .await
            .map_err(ActivityError::transport)?;
        serde_json::from_value(value).map_err(|err| ActivityError::InvalidResponse(err.to_string()))
    }

    fn command(&self, command: Command) -> Result<(), ActivityError> {
        self.commands
            .send(command)
            .map_err(|_| ActivityError::ClientShutDown)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ActivityError> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply))?;
        rx.await.map_err(|_| ActivityError::ClientShutDown)
    }
}

struct Actor {
    engine: Engine,
    execution: ExecutionQueue,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    events: broadcast::Sender<ActivityEvent>,
    feedback: mpsc::UnboundedSender<EngineEvent>,
    kms_messages_url: String,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut feedback: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        loop {
            let actions = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = feedback.recv() => self.engine.handle(event),
            };
            self.perform(actions);
        }
        debug!("activity: client actor stopped");
    }

    fn on_command(&mut self, command: Command) -> Vec<EngineAction> {
        match command {
            Command::Post {
                activity,
                files,
                reply,
            } => self.engine.post(activity, files, reply),
            Command::Download {
                conversation_id,
                file,
                mode,
                reply,
            } => self.engine.download(&conversation_id, file, mode, reply),
            Command::ReceiveActivity(activity) => self.engine.receive_activity(activity),
            Command::ReceiveKmsMessages(messages) => self.engine.receive_kms_messages(messages),
            Command::DecryptListed { activities, reply } => {
                let _ = reply.send(self.engine.decrypt_listed(activities));
                Vec::new()
            }
            Command::Readiness {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.engine.readiness(&conversation_id));
                Vec::new()
            }
            Command::KeyState {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.engine.key_state(&conversation_id));
                Vec::new()
            }
        }
    }

    fn perform(&self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::FetchUserId { round } => {
                    let transport = Arc::clone(&self.transport);
                    self.spawn_feedback(async move {
                        let result = fetch_json::<UserInfo>(
                            transport.as_ref(),
                            ServiceRequest::get(Service::Activity, "users"),
                        )
                        .await
                        .map(|user| user.id);
                        EngineEvent::UserIdFetched { round, result }
                    });
                }
                EngineAction::FetchKmsCluster { round } => {
                    let transport = Arc::clone(&self.transport);
                    self.spawn_feedback(async move {
                        let result = fetch_json::<KmsClusterInfo>(
                            transport.as_ref(),
                            ServiceRequest::get(Service::Kms, "kms"),
                        )
                        .await;
                        EngineEvent::KmsClusterFetched { round, result }
                    });
                }
                EngineAction::AcquireHandshakeToken { attempt } => {
                    let authenticator = Arc::clone(&self.authenticator);
                    self.spawn_feedback(async move {
                        let result = authenticator.access_token().await;
                        EngineEvent::HandshakeTokenAcquired { attempt, result }
                    });
                }
                EngineAction::SendKmsMessage {
                    message,
                    destination,
                    correlation,
                } => self.send_kms_message(message, destination, correlation),
                EngineAction::ArmEphemeralDeadline { request_id, after } => {
                    self.spawn_feedback(async move {
                        tokio::time::sleep(after).await;
                        EngineEvent::EphemeralDeadlineElapsed { request_id }
                    });
                }
                EngineAction::FetchKeyLocation { conversation_id } => {
                    let transport = Arc::clone(&self.transport);
                    self.spawn_feedback(async move {
                        let request = ServiceRequest::get(
                            Service::Activity,
                            format!("conversations/{conversation_id}"),
                        )
                        .query("includeActivities", "false")
                        .query("includeParticipants", "false");
                        let result = fetch_json::<ConversationInfo>(transport.as_ref(), request)
                            .await
                            .map(|info| info.encryption_key_url);
                        EngineEvent::KeyLocationFetched {
                            conversation_id,
                            result,
                        }
                    });
                }
                EngineAction::AllocateShareLocation { conversation_id } => {
                    let transport = Arc::clone(&self.transport);
                    self.spawn_feedback(async move {
                        let request = ServiceRequest::put(
                            Service::Activity,
                            format!("conversations/{conversation_id}/space"),
                        );
                        let result = fetch_json::<SpaceInfo>(transport.as_ref(), request)
                            .await
                            .map(|space| space.space_url);
                        EngineEvent::ShareLocationFetched {
                            conversation_id,
                            result,
                        }
                    });
                }
                EngineAction::Execute(unit) => self.execution.submit(unit),
                EngineAction::Deliver(activity) => {
                    let _ = self.events.send(ActivityEvent::Message(activity));
                }
                EngineAction::Report(err) => {
                    let _ = self.events.send(ActivityEvent::Error(err));
                }
            }
        }
    }

    fn send_kms_message(&self, message: String, destination: String, correlation: KmsCorrelation) {
        let transport = Arc::clone(&self.transport);
        let url = self.kms_messages_url.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            let batch = KmsMessageBatch {
                kms_messages: vec![message],
                destination: Some(destination),
            };
            let sent = match serde_json::to_string(&batch) {
                Ok(body) => transport.send_raw(&url, body, Vec::new()).await,
                Err(err) => Err(err.into()),
            };
            // Replies arrive on the push channel; only failures report back.
            if let Err(error) = sent {
                let _ = feedback.send(EngineEvent::KmsDispatchFailed { correlation, error });
            }
        });
    }

    fn spawn_feedback<F>(&self, task: F)
    where
        F: std::future::Future<Output = EngineEvent> + Send + 'static,
    {
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            if feedback.send(task.await).is_err() {
                warn!("activity: client actor gone, dropping collaborator result");
            }
        });
    }
}

async fn fetch_json<T: DeserializeOwned>(transport: &dyn Transport, request: ServiceRequest) -> Result<T> {
    let what = format!("{} {}", request.method.as_str(), request.path);
    let value = transport.send(request).await?;
    serde_json::from_value(value).with_context(|| format!("unexpected response to {what}"))
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
