//! Hand-off of a finished capture to the processing backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::UploadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub payload: Bytes,
    pub title: String,
    pub user_id: String,
    pub linked_entity_id: Option<String>,
}

/// Reference to whatever the backend created from the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub artifact: String,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt, UploadError>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Multipart uploader: `audio_file`, `title`, `user_id` and, when present,
/// `linked_event_id`.
pub struct HttpUploader {
    client: reqwest::Client,
    url: String,
    file_name: String,
    mime: String,
}

impl HttpUploader {
    pub fn new(url: impl Into<String>) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
            file_name: "audio_note.webm".into(),
            mime: "audio/webm".into(),
        })
    }

    pub fn with_file_type(mut self, file_name: impl Into<String>, mime: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self.mime = mime.into();
        self
    }

    fn form(&self, request: UploadRequest) -> Result<Form, UploadError> {
        let part = Part::bytes(request.payload.to_vec())
            .file_name(self.file_name.clone())
            .mime_str(&self.mime)?;
        let mut form = Form::new()
            .part("audio_file", part)
            .text("title", request.title)
            .text("user_id", request.user_id);
        if let Some(linked) = request.linked_entity_id {
            form = form.text("linked_event_id", linked);
        }
        Ok(form)
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt, UploadError> {
        let bytes = request.payload.len();
        let form = self.form(request)?;
        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        match parse_response(status, &body) {
            Ok(receipt) => {
                info!(
                    component = "upload",
                    event = "upload.succeeded",
                    status,
                    payload_bytes = bytes,
                    artifact = %receipt.artifact,
                    "Capture uploaded"
                );
                Ok(receipt)
            }
            Err(e) => {
                warn!(
                    component = "upload",
                    event = "upload.failed",
                    status,
                    error = %e,
                    "Capture upload failed"
                );
                Err(e)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
}

/// Interpret the backend's `{ ok, data, message, error }` reply.
fn parse_response(status: u16, body: &str) -> Result<UploadReceipt, UploadError> {
    let parsed: Option<ApiResponse> = serde_json::from_str(body).ok();

    if let Some(ApiResponse {
        ok: true,
        data: Some(data),
        ..
    }) = &parsed
    {
        if (200..300).contains(&status) {
            return Ok(UploadReceipt {
                artifact: artifact_of(data),
            });
        }
    }

    let message = parsed
        .and_then(|r| r.error.and_then(|e| e.message).or(r.message))
        .unwrap_or_else(|| {
            if (200..300).contains(&status) {
                "response did not include a result".to_string()
            } else {
                format!("HTTP {status}")
            }
        });

    if (200..300).contains(&status) {
        Err(UploadError::InvalidResponse(message))
    } else {
        Err(UploadError::Rejected { status, message })
    }
}

fn artifact_of(data: &Value) -> String {
    for key in ["id", "note_id"] {
        match data.get(key) {
            Some(Value::String(s)) => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn success_uses_data_id() {
        let receipt = parse_response(200, r#"{"ok":true,"data":{"id":"note-1"}}"#).unwrap();
        assert_eq!(receipt.artifact, "note-1");
    }

    #[test]
    fn success_falls_back_to_note_id_then_raw_data() {
        let receipt = parse_response(200, r#"{"ok":true,"data":{"note_id":42}}"#).unwrap();
        assert_eq!(receipt.artifact, "42");

        let receipt = parse_response(200, r#"{"ok":true,"data":"page-9"}"#).unwrap();
        assert_eq!(receipt.artifact, "page-9");
    }

    #[test]
    fn error_message_is_surfaced() {
        let err = parse_response(
            500,
            r#"{"ok":false,"error":{"message":"Missing title for the audio note.","code":"VALIDATION"}}"#,
        )
        .unwrap_err();
        match err {
            UploadError::Rejected { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "Missing title for the audio note.");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_json_failure_reports_status() {
        let err = parse_response(502, "Bad Gateway").unwrap_err();
        assert!(matches!(
            err,
            UploadError::Rejected { status: 502, ref message } if message == "HTTP 502"
        ));
    }

    #[test]
    fn ok_without_data_is_invalid() {
        let err = parse_response(200, r#"{"ok":true,"message":"queued"}"#).unwrap_err();
        assert!(matches!(err, UploadError::InvalidResponse(ref m) if m == "queued"));
    }

    #[tokio::test]
    async fn posts_multipart_fields() {
        use axum::{body::Bytes as Body, routing::post, Json, Router};

        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let recorder = seen.clone();
        let app = Router::new().route(
            "/notes",
            post(move |body: Body| {
                let recorder = recorder.clone();
                async move {
                    *recorder.lock().unwrap() = Some(String::from_utf8_lossy(&body).into_owned());
                    Json(serde_json::json!({ "ok": true, "data": { "id": "n-1" } }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let uploader = HttpUploader::new(format!("http://{addr}/notes")).unwrap();
        let receipt = uploader
            .upload(UploadRequest {
                payload: Bytes::from_static(b"AUDIO"),
                title: "Standup".into(),
                user_id: "u1".into(),
                linked_entity_id: Some("evt-3".into()),
            })
            .await
            .unwrap();
        assert_eq!(receipt.artifact, "n-1");

        let body = seen.lock().unwrap().clone().unwrap();
        assert!(body.contains(r#"name="audio_file""#));
        assert!(body.contains("AUDIO"));
        assert!(body.contains(r#"name="title""#));
        assert!(body.contains("Standup"));
        assert!(body.contains(r#"name="user_id""#));
        assert!(body.contains(r#"name="linked_event_id""#));
        assert!(body.contains("evt-3"));
    }
}
