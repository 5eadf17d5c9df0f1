use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Envelope shared by every JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T = Value> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl ApiResponse<Value> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            message: Some(message.into()),
        }
    }
}

/// OpenAPI view of [`ApiResponse`].
#[derive(ToSchema)]
#[schema(as = ApiResponse)]
#[allow(dead_code)]
pub struct ApiResponseDoc {
    /// Indicates if the request was successful
    success: bool,
    /// Response data (when successful)
    data: Option<Value>,
    /// Error message (when unsuccessful)
    error: Option<String>,
    /// Additional message
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Optional id (alphanumeric, 3-50 chars); generated when omitted
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendTextRequest {
    /// Recipient phone number in international format
    #[serde(default)]
    pub to: Option<String>,
    /// Message body (1-4096 chars)
    #[serde(default)]
    pub message: Option<String>,
}

/// Multipart form accepted by the media endpoint.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct SendMediaForm {
    /// Recipient phone number in international format
    to: String,
    /// Optional caption (max 1024 chars)
    caption: Option<String>,
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message_id: String,
}
