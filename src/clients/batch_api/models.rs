/// Batch API のワイヤ型（リクエスト行、結果行、バッチオブジェクト）。
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::models::Endpoint;

/// One request produced by a runner: a caller-chosen id plus the provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInputItem {
    pub id: String,
    pub body: Value,
}

impl BatchInputItem {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Chat completion request with optional sampling parameters left unset.
    ///
    /// # Errors
    /// Fails only if the request cannot be represented as JSON.
    pub fn chat(id: impl Into<String>, request: &ChatCompletionRequest) -> serde_json::Result<Self> {
        Ok(Self::new(id, serde_json::to_value(request)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            seed: None,
            response_format: None,
        }
    }
}

/// Request line in an uploaded input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestInputItem {
    pub custom_id: String,
    pub method: String,
    pub url: Endpoint,
    pub body: Value,
}

impl BatchRequestInputItem {
    #[must_use]
    pub fn from_input(endpoint: Endpoint, item: BatchInputItem) -> Self {
        Self {
            custom_id: item.id,
            method: "POST".to_string(),
            url: endpoint,
            body: item.body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponse {
    pub status_code: u16,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Result line in an output or error file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestOutputItem {
    pub id: String,
    pub custom_id: String,
    #[serde(default)]
    pub response: Option<RequestResponse>,
    #[serde(default)]
    pub error: Option<RequestError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Success,
    Failed,
}

/// Decoded result handed to `BatchRunner::download`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutputItem {
    pub job_id: String,
    pub custom_id: String,
    pub id: String,
    pub status: OutputStatus,
    pub response: Option<Value>,
    /// First choice's message content for chat completions.
    pub content: Option<String>,
    pub error: Option<String>,
}

/// Decoded line of an error file, handed to `BatchRunner::download_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchErrorItem {
    pub job_id: String,
    pub custom_id: String,
    pub id: String,
    pub code: Option<String>,
    pub message: Option<String>,
    pub status_code: Option<u16>,
}

impl BatchRequestOutputItem {
    #[must_use]
    pub fn into_output(self, job_id: &str) -> BatchOutputItem {
        let error = match (&self.error, &self.response) {
            (Some(err), _) => Some(format!(
                "Request failed with error code {}: {}",
                err.code.as_deref().unwrap_or("unknown"),
                err.message.as_deref().unwrap_or("")
            )),
            (None, Some(resp)) if !(200..300).contains(&resp.status_code) => Some(format!(
                "Request failed with HTTP status code {}",
                resp.status_code
            )),
            (None, _) => None,
        };

        let (status, response, content) = match (&error, self.response) {
            (None, Some(resp)) => {
                let content = resp
                    .body
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                (OutputStatus::Success, Some(resp.body), content)
            }
            (None, None) => (OutputStatus::Success, None, None),
            (Some(_), _) => (OutputStatus::Failed, None, None),
        };

        BatchOutputItem {
            job_id: job_id.to_string(),
            custom_id: self.custom_id,
            id: self.id,
            status,
            response,
            content,
            error,
        }
    }

    #[must_use]
    pub fn into_error(self, job_id: &str) -> BatchErrorItem {
        let status_code = self.response.as_ref().map(|r| r.status_code);
        let (code, message) = match self.error {
            Some(err) => (err.code, err.message),
            None => (None, None),
        };

        BatchErrorItem {
            job_id: job_id.to_string(),
            custom_id: self.custom_id,
            id: self.id,
            code,
            message,
            status_code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Validating,
    Failed,
    InProgress,
    Finalizing,
    Completed,
    Expired,
    Cancelling,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub status: BatchState,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub input_file_id: Option<String>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub completion_window: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
}

impl Batch {
    /// Every remote file this batch references, for cleanup.
    #[must_use]
    pub fn file_ids(&self) -> Vec<&str> {
        [
            self.input_file_id.as_deref(),
            self.output_file_id.as_deref(),
            self.error_file_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPage {
    pub data: Vec<Batch>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub last_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
    pub endpoint: Endpoint,
    pub completion_window: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
}
