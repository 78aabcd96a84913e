//! Response envelope shared by route handlers.
//!
//! Handlers can return anything axum converts into a response, but the
//! framework's own conventions are carried by [`Message`] (a status-coded
//! JSON envelope) and [`Reply`] (the closed set of response kinds the
//! routing layer knows how to resolve: envelope, raw text, file
//! attachment, or enveloped JSON data).

use std::path::PathBuf;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status-coded JSON envelope: `{"code": .., "msg": .., "data": .., "type": ..}`.
///
/// The `code` doubles as the HTTP status of the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub code: u16,
    pub msg: String,
    pub data: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Message {
    pub fn ok() -> Self {
        Self {
            code: 200,
            msg: "ok".to_string(),
            data: None,
            kind: String::new(),
        }
    }

    pub fn data(data: impl Into<Value>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::ok()
        }
    }

    pub fn data_code(code: u16, data: impl Into<Value>) -> Self {
        Self {
            code,
            data: Some(data.into()),
            ..Self::ok()
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: 500,
            msg: msg.into(),
            data: None,
            kind: String::new(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            code: 401,
            msg: msg.into(),
            data: None,
            kind: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for Message {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

/// The response kinds the routing layer resolves for handlers.
pub enum Reply {
    /// A status-coded envelope, serialized as JSON.
    Message(Message),
    /// Raw text written as-is with a 200 status.
    Text(String),
    /// A file download with a `Content-Disposition` attachment header.
    /// The filename defaults to the final path component.
    File {
        path: PathBuf,
        filename: Option<String>,
    },
    /// Arbitrary JSON data wrapped in an ok envelope.
    Data(Value),
}

impl Reply {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            filename: None,
        }
    }
}

impl From<Message> for Reply {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Self::Message(msg) => msg.into_response(),
            Self::Text(text) => text.into_response(),
            Self::Data(value) => Message::data(value).into_response(),
            Self::File { path, filename } => {
                let name = filename.unwrap_or_else(|| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "download".to_string())
                });
                match std::fs::read(&path) {
                    Ok(bytes) => (
                        StatusCode::OK,
                        [
                            (
                                header::CONTENT_DISPOSITION,
                                format!("attachment; filename=\"{name}\""),
                            ),
                            (
                                header::CONTENT_TYPE,
                                "application/octet-stream".to_string(),
                            ),
                        ],
                        bytes,
                    )
                        .into_response(),
                    Err(err) => {
                        Message::data_code(404, Value::String(err.to_string())).into_response()
                    }
                }
            }
        }
    }
}
