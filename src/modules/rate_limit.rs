//! Anti-ban send pacing.
//!
//! Three rules gate every outgoing message when pacing is enabled: a global
//! hourly cap, a per-session hourly cap of half the global one, and a
//! minimum delay between two messages of the same session.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;
use utoipa::ToSchema;

use crate::models::AntiBanConfig;

const WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct SessionLimits {
    last_message: Option<Instant>,
    hourly_count: u32,
    hourly_reset: Instant,
}

impl SessionLimits {
    fn new(now: Instant) -> Self {
        Self {
            last_message: None,
            hourly_count: 0,
            hourly_reset: now + WINDOW,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now > self.hourly_reset {
            self.hourly_count = 0;
            self.hourly_reset = now + WINDOW;
        }
    }

    fn hourly_count_at(&self, now: Instant) -> u32 {
        if now > self.hourly_reset {
            0
        } else {
            self.hourly_count
        }
    }
}

#[derive(Debug)]
struct State {
    sessions: HashMap<String, SessionLimits>,
    global_count: u32,
    global_reset: Instant,
}

impl State {
    fn roll_global(&mut self, now: Instant) {
        if now >= self.global_reset {
            self.global_count = 0;
            self.global_reset = now + WINDOW;
        }
    }

    fn global_count_at(&self, now: Instant) -> u32 {
        if now >= self.global_reset {
            0
        } else {
            self.global_count
        }
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub delay_ms: Option<u64>,
    pub reason: Option<String>,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            delay_ms: None,
            reason: None,
        }
    }

    fn deny(reason: String, delay_ms: Option<u64>) -> Self {
        Self {
            allowed: false,
            delay_ms,
            reason: Some(reason),
        }
    }
}

/// A send slot taken by [`RateLimiter::try_acquire`]. Hand it back to
/// [`RateLimiter::release`] when the send did not go out.
#[derive(Debug)]
pub struct Reservation {
    session_id: String,
    at: Instant,
    previous_message: Option<Instant>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionRateStatus {
    pub can_send: bool,
    pub time_until_next_message: u64,
    pub hourly_count: u32,
    pub hourly_limit: u32,
    pub global_count: u32,
    pub global_limit: u32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRateStats {
    pub global_hourly_count: u32,
    pub global_hourly_limit: u32,
    pub active_sessions: usize,
    /// Milliseconds until the global counter resets
    pub time_until_reset: u64,
}

pub struct RateLimiter {
    config: AntiBanConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(config: AntiBanConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                sessions: HashMap::new(),
                global_count: 0,
                global_reset: Instant::now() + WINDOW,
            }),
        }
    }

    pub fn session_limit(&self) -> u32 {
        self.config.max_messages_per_hour / 2
    }

    /// Apply the pacing rules to a snapshot. Never touches state.
    fn decide(&self, global_count: u32, limits: Option<&SessionLimits>, now: Instant) -> Decision {
        if !self.config.enabled {
            return Decision::allow();
        }

        let global_limit = self.config.max_messages_per_hour;
        if global_count >= global_limit {
            return Decision::deny(
                format!("Global hourly limit reached ({} messages)", global_limit),
                None,
            );
        }

        let min_delay = Duration::from_millis(self.config.message_delay_ms);
        if let Some(last) = limits.and_then(|l| l.last_message) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < min_delay {
                let remaining = (min_delay - elapsed).as_millis() as u64;
                return Decision::deny(
                    format!(
                        "Minimum delay between messages not met ({}s remaining)",
                        remaining.div_ceil(1000)
                    ),
                    Some(remaining),
                );
            }
        }

        let session_limit = self.session_limit();
        let hourly = limits.map(|l| l.hourly_count_at(now)).unwrap_or(0);
        if hourly >= session_limit {
            return Decision::deny(
                format!("Session hourly limit reached ({} messages)", session_limit),
                None,
            );
        }

        Decision::allow()
    }

    /// Check whether `session_id` may send right now.
    pub fn check(&self, session_id: &str) -> Decision {
        self.check_at(session_id, Instant::now())
    }

    pub(crate) fn check_at(&self, session_id: &str, now: Instant) -> Decision {
        let mut state = self.state.lock();
        state.roll_global(now);
        self.decide(state.global_count, state.sessions.get(session_id), now)
    }

    /// Check and, when allowed, count the send in the same critical section.
    pub fn try_acquire(&self, session_id: &str) -> Result<Reservation, Decision> {
        self.try_acquire_at(session_id, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, session_id: &str, now: Instant) -> Result<Reservation, Decision> {
        let mut state = self.state.lock();
        state.roll_global(now);

        let decision = self.decide(state.global_count, state.sessions.get(session_id), now);
        if !decision.allowed {
            return Err(decision);
        }

        state.global_count += 1;
        let limits = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionLimits::new(now));
        limits.roll(now);
        let previous_message = limits.last_message.replace(now);
        limits.hourly_count += 1;

        Ok(Reservation {
            session_id: session_id.to_string(),
            at: now,
            previous_message,
        })
    }

    /// Give back a slot whose send failed.
    pub fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock();
        state.global_count = state.global_count.saturating_sub(1);
        if let Some(limits) = state.sessions.get_mut(&reservation.session_id) {
            limits.hourly_count = limits.hourly_count.saturating_sub(1);
            if limits.last_message == Some(reservation.at) {
                limits.last_message = reservation.previous_message;
            }
        }
    }

    /// Record a message that went out.
    pub fn record(&self, session_id: &str) {
        self.record_at(session_id, Instant::now());
    }

    pub(crate) fn record_at(&self, session_id: &str, now: Instant) {
        let mut state = self.state.lock();
        state.roll_global(now);
        state.global_count += 1;
        let global_count = state.global_count;

        let limits = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionLimits::new(now));
        limits.roll(now);
        limits.last_message = Some(now);
        limits.hourly_count += 1;

        info!(
            "Message recorded for session {}. Global: {}/{}, Session: {}/{}",
            session_id,
            global_count,
            self.config.max_messages_per_hour,
            limits.hourly_count,
            self.session_limit()
        );
    }

    /// Snapshot for one session. Does not create limiter state.
    pub fn session_status(&self, session_id: &str) -> SessionRateStatus {
        self.session_status_at(session_id, Instant::now())
    }

    pub(crate) fn session_status_at(&self, session_id: &str, now: Instant) -> SessionRateStatus {
        let state = self.state.lock();
        let limits = state.sessions.get(session_id);
        let global_count = state.global_count_at(now);
        let decision = self.decide(global_count, limits, now);

        SessionRateStatus {
            can_send: decision.allowed,
            time_until_next_message: decision.delay_ms.unwrap_or(0),
            hourly_count: limits.map(|l| l.hourly_count_at(now)).unwrap_or(0),
            hourly_limit: self.session_limit(),
            global_count,
            global_limit: self.config.max_messages_per_hour,
        }
    }

    pub fn global_stats(&self) -> GlobalRateStats {
        let now = Instant::now();
        let state = self.state.lock();
        GlobalRateStats {
            global_hourly_count: state.global_count_at(now),
            global_hourly_limit: self.config.max_messages_per_hour,
            active_sessions: state.sessions.len(),
            time_until_reset: state.global_reset.saturating_duration_since(now).as_millis() as u64,
        }
    }

    /// Forget one session's pacing state.
    pub fn reset_session(&self, session_id: &str) {
        self.state.lock().sessions.remove(session_id);
        info!("Rate limits reset for session {}", session_id);
    }

    /// Zero the global counter and open a new hourly window.
    pub fn reset_global_window(&self) {
        let mut state = self.state.lock();
        state.global_count = 0;
        state.global_reset = Instant::now() + WINDOW;
        info!("Global hourly message counter reset");
    }

    /// Random 1-5s pause mimicking a human typing, when pacing is enabled.
    pub async fn human_delay(&self) {
        if !self.config.enabled {
            return;
        }
        let millis = rand::rng().random_range(1000..=5000);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

/// Reset the global counter every hour for as long as the limiter lives.
pub fn spawn_window_reset(limiter: std::sync::Arc<RateLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + WINDOW, WINDOW);
        loop {
            ticker.tick().await;
            limiter.reset_global_window();
        }
    })
}
