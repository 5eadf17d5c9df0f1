//! Session registry: session id -> live client handle + lifecycle status.
//!
//! Lifecycle events arrive asynchronously from each client on its own
//! channel; one listener task per session applies them to the entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Session, SessionStatus};
use crate::modules::whatsapp::{ClientEvent, ClientFactory, MessagingClient};
use crate::utils::truncate::preview;

struct SessionEntry {
    session: Session,
    client: Arc<dyn MessagingClient>,
    listener: JoinHandle<()>,
    /// Teardown in progress. The id stays taken until it completes.
    closing: bool,
}

type SessionMap = Arc<RwLock<HashMap<String, SessionEntry>>>;

pub struct SessionRegistry {
    sessions: SessionMap,
    factory: Arc<dyn ClientFactory>,
    max_sessions: usize,
    session_path: PathBuf,
}

/// Apply one lifecycle event to a session record.
pub fn apply_event(session: &mut Session, event: &ClientEvent) {
    match event {
        ClientEvent::Qr(payload) => {
            session.qr_code = Some(payload.clone());
            session.status = SessionStatus::Qr;
        }
        ClientEvent::Authenticated => {
            session.status = SessionStatus::Authenticated;
        }
        ClientEvent::Ready(info) => {
            session.status = SessionStatus::Ready;
            session.client_info = Some(info.clone());
        }
        ClientEvent::Disconnected(_) => {
            session.status = SessionStatus::Disconnected;
            session.qr_code = None;
            session.client_info = None;
        }
        ClientEvent::AuthFailure(_) => {
            session.status = SessionStatus::Disconnected;
        }
    }
}

/// Apply `event` to a registered session; false when the id is unknown.
fn apply_to(sessions: &SessionMap, session_id: &str, event: &ClientEvent) -> bool {
    match sessions.write().get_mut(session_id) {
        Some(entry) => {
            apply_event(&mut entry.session, event);
            true
        }
        None => false,
    }
}

fn log_event(session_id: &str, event: &ClientEvent) {
    match event {
        ClientEvent::Qr(payload) => {
            info!("QR code for session {}: {}", session_id, preview(payload, 64))
        }
        ClientEvent::Authenticated => info!("Session {} authenticated", session_id),
        ClientEvent::Ready(info) => info!("Session {} is ready ({})", session_id, info.wid),
        ClientEvent::Disconnected(reason) => {
            warn!("Session {} disconnected: {}", session_id, reason)
        }
        ClientEvent::AuthFailure(message) => {
            warn!("Session {} authentication failed: {}", session_id, message)
        }
    }
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, max_sessions: usize, session_path: PathBuf) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            factory,
            max_sessions,
            session_path,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Occupied slots, sessions still closing included.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Register a new session and start its client.
    pub async fn create(&self, session_id: Option<String>) -> AppResult<Session> {
        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let client = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Err(AppError::SessionExists(id));
            }
            if sessions.len() >= self.max_sessions {
                return Err(AppError::SessionLimit(self.max_sessions));
            }

            let client = self.factory.create(&id, tx);

            let map = self.sessions.clone();
            let listener_id = id.clone();
            let listener = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    log_event(&listener_id, &event);
                    if !apply_to(&map, &listener_id, &event) {
                        break;
                    }
                }
            });

            sessions.insert(
                id.clone(),
                SessionEntry {
                    session: Session::new(id.clone()),
                    client: client.clone(),
                    listener,
                    closing: false,
                },
            );
            client
        };

        info!("Initializing session {}", id);
        if let Err(e) = client.initialize().await {
            error!("Session {} failed to initialize: {}", id, e);
            if let Some(entry) = self.sessions.write().remove(&id) {
                entry.listener.abort();
            }
            // leave no half-started browser behind
            let _ = client.destroy().await;
            return Err(AppError::ClientInit(e));
        }

        self.get(&id).ok_or(AppError::SessionNotFound)
    }

    /// Snapshot of a live session. Sessions being torn down are hidden.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .get(session_id)
            .filter(|entry| !entry.closing)
            .map(|entry| entry.session.clone())
    }

    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|entry| !entry.closing)
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Apply a lifecycle event; false when the session is not registered.
    pub fn apply(&self, session_id: &str, event: &ClientEvent) -> bool {
        apply_to(&self.sessions, session_id, event)
    }

    /// Client handle of a session that is ready to send.
    pub fn client_for_send(&self, session_id: &str) -> AppResult<Arc<dyn MessagingClient>> {
        let sessions = self.sessions.read();
        let entry = sessions
            .get(session_id)
            .filter(|entry| !entry.closing)
            .ok_or(AppError::SessionNotFound)?;
        if entry.session.status != SessionStatus::Ready {
            return Err(AppError::SessionNotReady);
        }
        Ok(entry.client.clone())
    }

    /// Mark a session as closing and hand out its client.
    fn begin_close(&self, session_id: &str) -> AppResult<Arc<dyn MessagingClient>> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(session_id) {
            Some(entry) if !entry.closing => {
                entry.closing = true;
                Ok(entry.client.clone())
            }
            _ => Err(AppError::SessionNotFound),
        }
    }

    /// Teardown failed: the session stays registered.
    fn abort_close(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().get_mut(session_id) {
            entry.closing = false;
        }
    }

    fn finish_close(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().remove(session_id) {
            entry.listener.abort();
        }
    }

    /// Unlink the account, close the client and wipe the stored profile.
    pub async fn logout(&self, session_id: &str) -> AppResult<()> {
        let client = self.begin_close(session_id)?;

        if let Err(e) = client.logout().await {
            error!("Session {} failed to log out: {}", session_id, e);
            self.abort_close(session_id);
            return Err(e.into());
        }
        if let Err(e) = client.destroy().await {
            warn!("Error closing session {} after logout: {}", session_id, e);
        }

        let profile_dir = self.session_path.join(session_id);
        let removed = if profile_dir.exists() {
            tokio::fs::remove_dir_all(&profile_dir).await
        } else {
            Ok(())
        };
        self.finish_close(session_id);
        removed?;

        info!("Session {} logged out", session_id);
        Ok(())
    }

    /// Close the client but keep the stored profile for a later restore.
    pub async fn destroy(&self, session_id: &str) -> AppResult<()> {
        let client = self.begin_close(session_id)?;

        if let Err(e) = client.destroy().await {
            error!("Session {} failed to close: {}", session_id, e);
            self.abort_close(session_id);
            return Err(e.into());
        }

        self.finish_close(session_id);
        info!("Session {} destroyed", session_id);
        Ok(())
    }

    /// Destroy every session (graceful shutdown).
    pub async fn shutdown(&self) {
        let entries: Vec<(String, SessionEntry)> = self.sessions.write().drain().collect();
        for (id, entry) in entries {
            entry.listener.abort();
            if let Err(e) = entry.client.destroy().await {
                warn!("Error destroying session {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClientInfo;

    #[test]
    fn test_event_transitions() {
        let mut session = Session::new("abc");

        apply_event(&mut session, &ClientEvent::Qr("ref".into()));
        assert_eq!(session.status, SessionStatus::Qr);
        assert_eq!(session.qr_code.as_deref(), Some("ref"));

        apply_event(&mut session, &ClientEvent::Authenticated);
        assert_eq!(session.status, SessionStatus::Authenticated);

        let info = ClientInfo {
            pushname: "Ops".into(),
            wid: "15550109999@c.us".into(),
            platform: "android".into(),
        };
        apply_event(&mut session, &ClientEvent::Ready(info.clone()));
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.client_info, Some(info));

        apply_event(&mut session, &ClientEvent::Disconnected("NAVIGATION".into()));
        assert_eq!(session.status, SessionStatus::Disconnected);
        assert!(session.qr_code.is_none());
        assert!(session.client_info.is_none());
    }

    #[test]
    fn test_auth_failure_keeps_details() {
        let mut session = Session::new("abc");
        apply_event(&mut session, &ClientEvent::Qr("ref".into()));
        apply_event(&mut session, &ClientEvent::AuthFailure("bad".into()));
        assert_eq!(session.status, SessionStatus::Disconnected);
        assert_eq!(session.qr_code.as_deref(), Some("ref"));
    }

    #[test]
    fn test_events_for_unknown_ids_are_ignored() {
        let map: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        assert!(!apply_to(&map, "ghost", &ClientEvent::Authenticated));
        assert!(map.read().is_empty());
    }
}
