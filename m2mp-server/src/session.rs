//! Per-connection session state.
//!
//! A [`Session`] is owned by its connection task and never shared, so it
//! needs no locking. Time is always passed in explicitly, which keeps the
//! liveness and debounce rules testable without a clock.

use chrono::{DateTime, Utc};
use m2mp_registry::DeviceHandle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Notice sent before closing a silent connection.
pub const NOTICE_IDLE: &str = "No data transmitted for more than 12 hours !";
/// Notice sent when identification did not happen in time.
pub const NOTICE_IDENT_TIMEOUT: &str = "It took you too long to identify yourself !";

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for the device to identify.
    Unidentified,
    /// Bound to a device.
    Identified,
    /// Session is closing.
    Closing,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unidentified, Identified) | (Unidentified, Closing) | (Identified, Closing)
        )
    }
}

/// Liveness and debounce thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub ping_after: Duration,
    pub min_send_gap: Duration,
    pub idle_ceiling: Duration,
    pub setting_debounce: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ping_after: Duration::from_secs(15 * 60),
            min_send_gap: Duration::from_secs(30),
            idle_ceiling: Duration::from_secs(12 * 3600),
            setting_debounce: Duration::from_secs(40),
        }
    }
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessAction {
    Nothing,
    /// Send a ping carrying this counter.
    Ping(u8),
    /// Send the notice, then close.
    Close(&'static str),
}

/// A device connection.
#[derive(Debug)]
pub struct Session {
    /// Connection id, unique per server run.
    pub id: u64,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    device: Option<DeviceHandle>,

    connected_at: Instant,
    connected_time: DateTime<Utc>,
    last_received: Instant,
    last_sent: Instant,

    ping_counter: u8,

    /// Short id -> command id, for commands pushed on this connection.
    pending_commands: HashMap<u32, String>,
    next_command_id: u32,

    /// Last value pushed per setting and when.
    settings_sent: HashMap<String, (String, Instant)>,

    /// Free-form per-session values (file transfer selection, ...).
    scratch: HashMap<String, String>,

    log_level: u8,
}

impl Session {
    pub fn new(id: u64, remote_addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            remote_addr,
            state: SessionState::Unidentified,
            device: None,
            connected_at: now,
            connected_time: Utc::now(),
            last_received: now,
            last_sent: now,
            ping_counter: 0,
            pending_commands: HashMap::new(),
            next_command_id: 0,
            settings_sent: HashMap::new(),
            scratch: HashMap::new(),
            log_level: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_identified(&self) -> bool {
        self.state == SessionState::Identified
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: SessionState) -> Result<(), crate::ServerError> {
        if !self.state.can_transition_to(next) {
            return Err(crate::ServerError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Binds the session to a device and moves to `Identified`.
    pub fn identify(&mut self, device: DeviceHandle) -> Result<(), crate::ServerError> {
        if self.state == SessionState::Identified {
            return Err(crate::ServerError::AlreadyIdentified);
        }
        self.transition(SessionState::Identified)?;
        self.device = Some(device);
        Ok(())
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    /// `;connection_id=N`, used as the `_from` of bus messages.
    pub fn bus_address(&self) -> String {
        format!(";connection_id={}", self.id)
    }

    pub fn connected_time(&self) -> DateTime<Utc> {
        self.connected_time
    }

    pub fn connection_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }

    pub fn mark_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Returns the next ping counter, wrapping at 255.
    pub fn next_ping(&mut self) -> u8 {
        self.ping_counter = self.ping_counter.wrapping_add(1);
        self.ping_counter
    }

    /// Decides whether to ping or close based on how long the link has
    /// been silent.
    pub fn liveness(&mut self, now: Instant, policy: &SessionPolicy) -> LivenessAction {
        let silence = now.saturating_duration_since(self.last_received);
        let since_sent = now.saturating_duration_since(self.last_sent);
        if silence <= policy.ping_after || since_sent <= policy.min_send_gap {
            return LivenessAction::Nothing;
        }
        if silence > policy.idle_ceiling {
            LivenessAction::Close(NOTICE_IDLE)
        } else {
            LivenessAction::Ping(self.next_ping())
        }
    }

    /// Registers a command pushed on this connection and returns its short id.
    pub fn track_command(&mut self, command_id: impl Into<String>) -> u32 {
        let short_id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        self.pending_commands.insert(short_id, command_id.into());
        short_id
    }

    /// Resolves and forgets a short command id.
    pub fn take_command(&mut self, short_id: u32) -> Option<String> {
        self.pending_commands.remove(&short_id)
    }

    pub fn pending_command_count(&self) -> usize {
        self.pending_commands.len()
    }

    /// Returns whether `key=value` may be pushed now, recording the push
    /// when it may.
    pub fn should_send_setting(
        &mut self,
        key: &str,
        value: &str,
        now: Instant,
        window: Duration,
    ) -> bool {
        if let Some((sent_value, sent_at)) = self.settings_sent.get(key) {
            if sent_value == value && now.saturating_duration_since(*sent_at) < window {
                return false;
            }
        }
        self.settings_sent
            .insert(key.to_string(), (value.to_string(), now));
        true
    }

    pub fn scratch(&self, key: &str) -> Option<&str> {
        self.scratch.get(key).map(String::as_str)
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.scratch.insert(key.into(), value.into());
    }

    pub fn log_level(&self) -> u8 {
        self.log_level
    }

    pub fn set_log_level(&mut self, level: u8) {
        self.log_level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session(now: Instant) -> Session {
        Session::new(1, "127.0.0.1:5000".parse().unwrap(), now)
    }

    fn handle() -> DeviceHandle {
        DeviceHandle {
            id: Uuid::nil(),
            ident: "imei:0123456789".to_string(),
        }
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Unidentified.can_transition_to(Identified));
        assert!(Unidentified.can_transition_to(Closing));
        assert!(Identified.can_transition_to(Closing));
        assert!(!Identified.can_transition_to(Identified));
        assert!(!Identified.can_transition_to(Unidentified));
        assert!(!Closing.can_transition_to(Identified));
        assert!(!Closing.can_transition_to(Unidentified));
    }

    #[test]
    fn test_second_identification_rejected() {
        let mut s = session(Instant::now());
        s.identify(handle()).unwrap();
        assert!(s.is_identified());
        assert!(matches!(
            s.identify(handle()),
            Err(crate::ServerError::AlreadyIdentified)
        ));
    }

    #[test]
    fn test_closed_session_cannot_identify() {
        let mut s = session(Instant::now());
        s.transition(SessionState::Closing).unwrap();
        assert!(matches!(
            s.identify(handle()),
            Err(crate::ServerError::IllegalTransition { .. })
        ));
        assert!(s.device().is_none());
    }

    #[test]
    fn test_liveness_pings_after_silence() {
        let start = Instant::now();
        let mut s = session(start);
        let now = start + Duration::from_secs(20 * 60);
        s.mark_sent(now - Duration::from_secs(40));

        assert_eq!(
            s.liveness(now, &SessionPolicy::default()),
            LivenessAction::Ping(1)
        );
    }

    #[test]
    fn test_liveness_respects_send_gap() {
        let start = Instant::now();
        let mut s = session(start);
        let now = start + Duration::from_secs(20 * 60);
        s.mark_sent(now - Duration::from_secs(10));

        assert_eq!(
            s.liveness(now, &SessionPolicy::default()),
            LivenessAction::Nothing
        );
    }

    #[test]
    fn test_liveness_closes_after_ceiling() {
        let start = Instant::now();
        let mut s = session(start);
        let now = start + Duration::from_secs(13 * 3600);
        s.mark_sent(now - Duration::from_secs(40));

        assert_eq!(
            s.liveness(now, &SessionPolicy::default()),
            LivenessAction::Close(NOTICE_IDLE)
        );
        // closing does not consume a ping counter
        assert_eq!(s.next_ping(), 1);
    }

    #[test]
    fn test_ping_counter_wraps() {
        let mut s = session(Instant::now());
        for _ in 0..255 {
            s.next_ping();
        }
        assert_eq!(s.next_ping(), 0);
    }

    #[test]
    fn test_setting_debounce() {
        let t0 = Instant::now();
        let window = Duration::from_secs(40);
        let mut s = session(t0);

        assert!(s.should_send_setting("apn", "v1", t0, window));
        assert!(!s.should_send_setting("apn", "v1", t0 + Duration::from_secs(10), window));
        assert!(s.should_send_setting("apn", "v1", t0 + Duration::from_secs(41), window));
        assert!(s.should_send_setting("apn", "v2", t0 + Duration::from_secs(42), window));
    }

    #[test]
    fn test_command_short_ids() {
        let mut s = session(Instant::now());
        assert_eq!(s.track_command("c-a"), 0);
        assert_eq!(s.track_command("c-b"), 1);
        assert_eq!(s.take_command(1).as_deref(), Some("c-b"));
        assert_eq!(s.take_command(1), None);
        assert_eq!(s.pending_command_count(), 1);
    }
}
