// THEORY:
// The `upload` module is the client for the pre-recorded media endpoint. It is
// a plain request/response path next to the streaming one: validate the file
// type locally, send it as a multipart form, and publish progress on a watch
// channel so a UI can follow along without polling.
//
// An uploaded video comes back as one `InboundResult` whose detections are a
// per-frame timeline; feed it to a `DetectionReconciler` and `seek` along the
// playback clock. Images come back as a flat list.

use crate::config::SessionConfig;
use crate::error::{Error, Result, UploadError};
use crate::protocol::InboundResult;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{info, warn};

/// Accepted file extensions and the MIME type sent for each.
pub const SUPPORTED_MEDIA: [(&str, &str); 5] = [
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    #[default]
    Idle,
    Uploading,
    Processing,
    Success,
    Error,
}

pub struct UploadClient {
    http: reqwest::Client,
    base_url: String,
    status: watch::Sender<UploadStatus>,
}

impl UploadClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            status: watch::Sender::new(UploadStatus::Idle),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.upload_base_url.clone())
    }

    pub fn upload_url(&self) -> String {
        format!("{}/v1/detections", self.base_url)
    }

    /// URL of the annotated result. The timestamp query defeats HTTP caches.
    pub fn result_url(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        format!("{}/v1/detections/result?t={millis}", self.base_url)
    }

    pub fn status(&self) -> watch::Receiver<UploadStatus> {
        self.status.subscribe()
    }

    /// Back to `Idle`, e.g. when the user clears the selected file.
    pub fn clear(&self) {
        self.status.send_replace(UploadStatus::Idle);
    }

    pub async fn upload(&self, path: &Path) -> Result<InboundResult> {
        let outcome = self.try_upload(path).await;
        let status = match &outcome {
            Ok(_) => UploadStatus::Success,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "upload failed");
                UploadStatus::Error
            }
        };
        self.status.send_replace(status);
        outcome
    }

    async fn try_upload(&self, path: &Path) -> Result<InboundResult> {
        let mime = media_type(path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        self.status.send_replace(UploadStatus::Uploading);
        let bytes = tokio::fs::read(path).await.map_err(UploadError::from)?;
        info!(file = %file_name, bytes = bytes.len(), "uploading media");

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(UploadError::from)?;
        let form = Form::new().part("file", part);
        let response = self
            .http
            .post(self.upload_url())
            .multipart(form)
            .send()
            .await
            .map_err(UploadError::from)?;

        self.status.send_replace(UploadStatus::Processing);
        let status = response.status();
        let body = response.text().await.map_err(UploadError::from)?;
        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let result = InboundResult::parse(&body)?;
        if let Some(error) = result.error {
            return Err(Error::Application(error));
        }
        if let Some(warning) = &result.warning {
            warn!(warning = %warning, "detection service warning");
        }
        Ok(result)
    }
}

/// MIME type for `path`, or `UnsupportedType` when the extension is not accepted.
pub fn media_type(path: &Path) -> std::result::Result<&'static str, UploadError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    SUPPORTED_MEDIA
        .iter()
        .find(|(accepted, _)| *accepted == extension)
        .map(|(_, mime)| *mime)
        .ok_or(UploadError::UnsupportedType(extension))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_extensions_map_to_mime_types() {
        assert_eq!(media_type(Path::new("clip.mp4")).unwrap(), "video/mp4");
        assert_eq!(media_type(Path::new("clip.MOV")).unwrap(), "video/quicktime");
        assert_eq!(media_type(Path::new("/tmp/hand.jpeg")).unwrap(), "image/jpeg");
        assert_eq!(media_type(Path::new("hand.png")).unwrap(), "image/png");
    }

    #[test]
    fn other_extensions_are_rejected() {
        assert!(matches!(
            media_type(Path::new("notes.txt")),
            Err(UploadError::UnsupportedType(ext)) if ext == "txt"
        ));
        assert!(matches!(media_type(Path::new("no_extension")), Err(UploadError::UnsupportedType(_))));
    }

    #[test]
    fn urls_are_built_from_the_base() {
        let client = UploadClient::new("http://detector:9000/");
        assert_eq!(client.upload_url(), "http://detector:9000/v1/detections");
        assert!(client.result_url().starts_with("http://detector:9000/v1/detections/result?t="));
    }

    #[tokio::test]
    async fn unsupported_file_fails_without_a_request() {
        let client = UploadClient::new("http://127.0.0.1:9");
        let status = client.status();

        let err = client.upload(Path::new("notes.txt")).await.unwrap_err();
        assert!(matches!(err, Error::Upload(UploadError::UnsupportedType(_))));
        assert_eq!(*status.borrow(), UploadStatus::Error);

        client.clear();
        assert_eq!(*status.borrow(), UploadStatus::Idle);
    }
}
