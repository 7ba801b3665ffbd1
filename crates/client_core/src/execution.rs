use std::sync::Arc;

use kms::SymmetricKey;
use shared::{
    domain::SpaceUri,
    protocol::{FileRef, MessageActivity, Thumbnail, UploadedFile},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    crypto::{decrypt_file_bytes, decrypt_incoming, encrypt_file_bytes, encrypt_outgoing},
    error::ActivityError,
    pending::Completion,
    transport::{Service, ServiceRequest, Transport},
};

const OCTET_STREAM: &str = "application/octet-stream";

/// A file attached to an outgoing share. Uploaded, encrypted, right before
/// the activity is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub display_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
    pub thumbnail: Option<OutgoingThumbnail>,
}

impl OutgoingFile {
    pub fn new(display_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            display_name: display_name.into(),
            mime_type: None,
            bytes,
            thumbnail: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: OutgoingThumbnail) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingThumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// Body and, when present, thumbnail.
    Full,
    ThumbnailOnly,
    BodyOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadedFile {
    pub body: Option<Vec<u8>>,
    pub thumbnail: Option<Vec<u8>>,
}

/// Post ready for transmission. `key` is the conversation key captured when
/// the activity was promoted.
#[derive(Debug)]
pub struct PostUnit {
    pub activity: MessageActivity,
    pub files: Vec<OutgoingFile>,
    pub key: SymmetricKey,
    pub share_location: Option<SpaceUri>,
    pub(crate) reply: Completion<MessageActivity>,
}

#[derive(Debug)]
pub struct DownloadUnit {
    pub file: FileRef,
    pub mode: DownloadMode,
    pub key: SymmetricKey,
    pub(crate) reply: Completion<DownloadedFile>,
}

#[derive(Debug)]
pub enum ExecutionUnit {
    Post(PostUnit),
    Download(DownloadUnit),
}

impl ExecutionUnit {
    pub(crate) fn fail(self, err: ActivityError) {
        match self {
            ExecutionUnit::Post(unit) => {
                let _ = unit.reply.send(Err(err));
            }
            ExecutionUnit::Download(unit) => {
                let _ = unit.reply.send(Err(err));
            }
        }
    }
}

/// Serial worker: units run one at a time in submission order.
pub struct ExecutionQueue {
    tx: mpsc::UnboundedSender<ExecutionUnit>,
    worker: JoinHandle<()>,
}

impl ExecutionQueue {
    pub fn spawn(transport: Arc<dyn Transport>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionUnit>();
        let worker = tokio::spawn(async move {
            while let Some(unit) = rx.recv().await {
                run_unit(transport.as_ref(), unit).await;
            }
            debug!("activity: execution queue drained");
        });
        Self { tx, worker }
    }

    pub fn submit(&self, unit: ExecutionUnit) {
        if let Err(mpsc::error::SendError(unit)) = self.tx.send(unit) {
            warn!("activity: execution worker is gone, failing unit");
            unit.fail(ActivityError::ClientShutDown);
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_unit(transport: &dyn Transport, unit: ExecutionUnit) {
    match unit {
        ExecutionUnit::Post(unit) => {
            let conversation_id = unit.activity.conversation_id.clone();
            let result = execute_post(
                transport,
                unit.activity,
                unit.files,
                &unit.key,
                unit.share_location.as_ref(),
            )
            .await;
            match &result {
                Ok(_) => info!(conversation_id = %conversation_id, "activity: sent"),
                Err(err) => warn!(conversation_id = %conversation_id, "activity: send failed: {err}"),
            }
            let _ = unit.reply.send(result);
        }
        ExecutionUnit::Download(unit) => {
            let result = execute_download(transport, &unit.file, unit.mode, &unit.key).await;
            if let Err(err) = &result {
                warn!(source_uri = %unit.file.source_uri, "activity: file download failed: {err}");
            }
            let _ = unit.reply.send(result);
        }
    }
}

pub(crate) async fn execute_post(
    transport: &dyn Transport,
    mut activity: MessageActivity,
    files: Vec<OutgoingFile>,
    key: &SymmetricKey,
    share_location: Option<&SpaceUri>,
) -> Result<MessageActivity, ActivityError> {
    if !files.is_empty() {
        let space = share_location.ok_or_else(|| ActivityError::ShareLocationFetchFailed {
            conversation_id: activity.conversation_id.to_string(),
        })?;
        for file in files {
            activity.files.push(upload_file(transport, space, file, key).await?);
        }
    }

    let sealed = encrypt_outgoing(&activity, key)?;
    let request = ServiceRequest::post(Service::Activity, "activities")
        .json(&sealed)
        .map_err(|err| ActivityError::InvalidResponse(format!("{err:#}")))?;
    let echo = transport
        .send(request)
        .await
        .map_err(ActivityError::transport)?;

    let mut echo = MessageActivity::from_wire(echo)
        .map_err(|err| ActivityError::InvalidResponse(err.to_string()))?;
    if echo.encryption_key_url.is_none() {
        echo.encryption_key_url = sealed.encryption_key_url.clone();
        echo.mark_received();
    }
    decrypt_incoming(&echo, key)
}

async fn upload_file(
    transport: &dyn Transport,
    space: &SpaceUri,
    file: OutgoingFile,
    key: &SymmetricKey,
) -> Result<FileRef, ActivityError> {
    let file_size = file.bytes.len() as u64;
    let source_uri = upload_bytes(transport, space, &file.bytes, key).await?;
    let thumbnail = match file.thumbnail {
        Some(thumbnail) => Some(Thumbnail {
            source_uri: upload_bytes(transport, space, &thumbnail.bytes, key).await?,
            width: thumbnail.width,
            height: thumbnail.height,
        }),
        None => None,
    };
    debug!(space = %space, display_name = %file.display_name, "activity: file uploaded");
    Ok(FileRef {
        display_name: file.display_name,
        source_uri,
        mime_type: file.mime_type,
        file_size: Some(file_size),
        thumbnail,
    })
}

async fn upload_bytes(
    transport: &dyn Transport,
    space: &SpaceUri,
    bytes: &[u8],
    key: &SymmetricKey,
) -> Result<String, ActivityError> {
    let sealed = encrypt_file_bytes(key, bytes)?;
    let response = transport
        .upload(space.as_str(), sealed, OCTET_STREAM)
        .await
        .map_err(ActivityError::transport)?;
    let uploaded: UploadedFile = serde_json::from_value(response)
        .map_err(|err| ActivityError::InvalidResponse(format!("upload response: {err}")))?;
    Ok(uploaded.url)
}

pub(crate) async fn execute_download(
    transport: &dyn Transport,
    file: &FileRef,
    mode: DownloadMode,
    key: &SymmetricKey,
) -> Result<DownloadedFile, ActivityError> {
    let mut downloaded = DownloadedFile::default();
    if mode != DownloadMode::BodyOnly {
        if let Some(thumbnail) = &file.thumbnail {
            downloaded.thumbnail = Some(fetch_and_open(transport, &thumbnail.source_uri, key).await?);
        }
    }
    if mode != DownloadMode::ThumbnailOnly {
        downloaded.body = Some(fetch_and_open(transport, &file.source_uri, key).await?);
    }
    Ok(downloaded)
}

async fn fetch_and_open(
    transport: &dyn Transport,
    url: &str,
    key: &SymmetricKey,
) -> Result<Vec<u8>, ActivityError> {
    let sealed = transport
        .download(url)
        .await
        .map_err(ActivityError::transport)?;
    decrypt_file_bytes(key, &sealed)
}

#[cfg(test)]
#[path = "tests/execution_tests.rs"]
mod tests;
