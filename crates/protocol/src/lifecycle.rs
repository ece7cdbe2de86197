//! Session lifecycle coordination shared by both roles.
//!
//! A session can end from several places at once: either pump may hit an
//! error, the peer may send a close frame, the shell may exit, or the user may
//! interrupt the client. Two primitives keep that orderly:
//!
//! - [`Lifecycle`] reports the end of a session exactly once, with the reason
//!   of whoever got there first and a human-readable duration.
//! - [`SessionState`] is the `Active → Closing → Closed` state machine used to
//!   log the first unexpected error once and to run teardown once.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The connection closed normally.
    ClientClosed,
    /// The connection failed unexpectedly.
    ConnectionError,
    /// The user interrupted the client.
    Interrupted,
    /// The server sent a close frame.
    ServerClosed,
    /// Writing to the local terminal failed.
    OutputError,
}

impl DisconnectReason {
    /// The reason string shown to the user.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client closed",
            Self::ConnectionError => "connection error",
            Self::Interrupted => "interrupted by user",
            Self::ServerClosed => "server sent close message",
            Self::OutputError => "output error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format an elapsed duration using the coarsest non-zero unit breakdown.
///
/// ```rust
/// use std::time::Duration;
/// use protocol::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(45)), "45 seconds");
/// assert_eq!(format_duration(Duration::from_secs(125)), "2 minutes, 5 seconds");
/// assert_eq!(format_duration(Duration::from_secs(3725)), "1 hours, 2 minutes, 5 seconds");
/// ```
pub fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{} hours, {} minutes, {} seconds", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{} minutes, {} seconds", minutes, seconds)
    } else {
        format!("{} seconds", seconds)
    }
}

/// Once-only disconnect reporting for one session.
#[derive(Debug)]
pub struct Lifecycle {
    started: Instant,
    reason: OnceLock<DisconnectReason>,
}

impl Lifecycle {
    /// Start timing a session now.
    pub fn start() -> Self {
        Self::started_at(Instant::now())
    }

    /// Start timing a session from a given instant.
    pub fn started_at(started: Instant) -> Self {
        Self {
            started,
            reason: OnceLock::new(),
        }
    }

    /// Time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The recorded reason, if the session has been reported as ended.
    pub fn reason(&self) -> Option<DisconnectReason> {
        self.reason.get().copied()
    }

    /// Whether a disconnect has been reported.
    pub fn is_disconnected(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Record the end of the session.
    ///
    /// The first caller gets the disconnect line to show; every later call is
    /// a no-op returning `None`, whatever its reason.
    pub fn disconnect(&self, reason: DisconnectReason) -> Option<String> {
        self.reason.set(reason).ok()?;
        Some(format!(
            "Disconnected from terminal server after {} ({})",
            format_duration(self.elapsed()),
            reason
        ))
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::start()
    }
}

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    /// Pumps are running.
    Active = 0,
    /// Something signalled the end; errors from here on are expected.
    Closing = 1,
    /// Teardown has run.
    Closed = 2,
}

impl SessionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomic `Active → Closing → Closed` state machine.
///
/// Transitions only move forward. Each transition is won by exactly one
/// caller, which is how duplicate error logs and double teardown are avoided.
#[derive(Debug)]
pub struct SessionState {
    phase: AtomicU8,
}

impl SessionState {
    /// Create a state in [`SessionPhase::Active`].
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(SessionPhase::Active as u8),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether the session has left the active phase.
    pub fn is_closing(&self) -> bool {
        self.phase() != SessionPhase::Active
    }

    /// Move from `Active` to `Closing`.
    ///
    /// Returns `true` only for the caller that performed the transition.
    pub fn begin_closing(&self) -> bool {
        self.phase
            .compare_exchange(
                SessionPhase::Active as u8,
                SessionPhase::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Closed` from either earlier phase.
    ///
    /// Returns `true` only for the single caller that performed the
    /// transition, which then owns teardown.
    pub fn finish(&self) -> bool {
        self.phase.swap(SessionPhase::Closed as u8, Ordering::SeqCst) != SessionPhase::Closed as u8
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0 seconds");
        assert_eq!(format_duration(Duration::from_secs(45)), "45 seconds");
        assert_eq!(format_duration(Duration::from_millis(45_900)), "45 seconds");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(Duration::from_secs(125)), "2 minutes, 5 seconds");
        assert_eq!(format_duration(Duration::from_secs(60)), "1 minutes, 0 seconds");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(
            format_duration(Duration::from_secs(3725)),
            "1 hours, 2 minutes, 5 seconds"
        );
        assert_eq!(
            format_duration(Duration::from_secs(7200)),
            "2 hours, 0 minutes, 0 seconds"
        );
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(DisconnectReason::ClientClosed.to_string(), "client closed");
        assert_eq!(DisconnectReason::ConnectionError.to_string(), "connection error");
        assert_eq!(DisconnectReason::Interrupted.to_string(), "interrupted by user");
        assert_eq!(
            DisconnectReason::ServerClosed.to_string(),
            "server sent close message"
        );
        assert_eq!(DisconnectReason::OutputError.to_string(), "output error");
    }

    #[test]
    fn test_disconnect_reports_first_reason_once() {
        let lifecycle = Lifecycle::started_at(Instant::now() - Duration::from_secs(125));

        let line = lifecycle.disconnect(DisconnectReason::ServerClosed).unwrap();
        assert_eq!(
            line,
            "Disconnected from terminal server after 2 minutes, 5 seconds (server sent close message)"
        );

        assert!(lifecycle.disconnect(DisconnectReason::ClientClosed).is_none());
        assert!(lifecycle.disconnect(DisconnectReason::ConnectionError).is_none());
        assert_eq!(lifecycle.reason(), Some(DisconnectReason::ServerClosed));
    }

    #[test]
    fn test_disconnect_concurrent_callers() {
        let lifecycle = Arc::new(Lifecycle::start());
        let reasons = [
            DisconnectReason::ClientClosed,
            DisconnectReason::ConnectionError,
            DisconnectReason::Interrupted,
            DisconnectReason::ServerClosed,
            DisconnectReason::OutputError,
        ];

        let handles: Vec<_> = reasons
            .iter()
            .map(|&reason| {
                let lifecycle = Arc::clone(&lifecycle);
                std::thread::spawn(move || lifecycle.disconnect(reason).is_some())
            })
            .collect();

        let reported = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();

        assert_eq!(reported, 1);
        assert!(lifecycle.is_disconnected());
    }

    #[test]
    fn test_session_state_transitions() {
        let state = SessionState::new();
        assert_eq!(state.phase(), SessionPhase::Active);
        assert!(!state.is_closing());

        assert!(state.begin_closing());
        assert!(!state.begin_closing());
        assert_eq!(state.phase(), SessionPhase::Closing);
        assert!(state.is_closing());

        assert!(state.finish());
        assert!(!state.finish());
        assert_eq!(state.phase(), SessionPhase::Closed);

        // Closed never goes back to closing
        assert!(!state.begin_closing());
        assert_eq!(state.phase(), SessionPhase::Closed);
    }

    #[test]
    fn test_session_state_finish_from_active() {
        let state = SessionState::new();
        assert!(state.finish());
        assert!(state.is_closing());
        assert!(!state.begin_closing());
    }
}
