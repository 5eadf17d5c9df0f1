use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle status of a messaging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Qr,
    Authenticated,
    Ready,
    Disconnected,
}

/// Account details reported by the client once it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ClientInfo {
    /// Display name
    pub pushname: String,
    /// Account id
    pub wid: String,
    /// Platform of the paired phone
    pub platform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session identifier
    pub id: String,
    pub status: SessionStatus,
    /// QR payload to scan (while status is `qr`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Initializing,
            qr_code: None,
            client_info: None,
        }
    }
}
