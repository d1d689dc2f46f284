//! Session tracking state machine
//!
//! One logical session is active at a time: `NO_SESSION → ACTIVE →
//! NO_SESSION`. The tracker consumes the transitions this module emits and
//! enqueues the corresponding session-start/session-end events, so this
//! module stays a pure state machine over timestamps.
//!
//! Backgrounding does not end the session immediately; the configured
//! timeout acts as a grace window. Foregrounding within the window resumes
//! the same session, beyond it the old session ends at the backgrounded
//! timestamp and a new one starts.

use std::sync::Mutex;

/// A state change the tracker must turn into a queued event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionTransition {
    Started { ts: f64 },
    Ended { ts: f64, duration: f64 },
}

#[derive(Debug, Default)]
struct SessionState {
    /// Start timestamp of the active session, if any
    started_at: Option<f64>,
    /// When the app went to background while a session was active
    backgrounded_at: Option<f64>,
}

/// Tracks the single active session.
pub struct SessionTracker {
    state: Mutex<SessionState>,
    timeout_secs: f64,
}

impl SessionTracker {
    pub fn new(timeout_secs: f64) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            timeout_secs,
        }
    }

    /// Open a session if none is active.
    pub fn track_session_start(&self, ts: f64) -> Option<SessionTransition> {
        let mut state = self.state.lock().unwrap();
        if state.started_at.is_some() {
            tracing::debug!("Session already active, ignoring session start");
            return None;
        }
        state.started_at = Some(ts);
        state.backgrounded_at = None;
        Some(SessionTransition::Started { ts })
    }

    /// Close the active session, if any, computing its duration.
    pub fn track_session_end(&self, ts: f64) -> Option<SessionTransition> {
        let mut state = self.state.lock().unwrap();
        let started_at = state.started_at.take()?;
        state.backgrounded_at = None;
        Some(SessionTransition::Ended {
            ts,
            duration: ts - started_at,
        })
    }

    /// Unconditionally start a fresh session, ending any active one silently.
    /// Used by the anonymize protocol, which must emit a session start for
    /// the new identity.
    pub fn restart(&self, ts: f64) -> SessionTransition {
        let mut state = self.state.lock().unwrap();
        state.started_at = Some(ts);
        state.backgrounded_at = None;
        SessionTransition::Started { ts }
    }

    /// App came to the foreground.
    ///
    /// Resumes the active session when the background gap is within the
    /// grace window; otherwise ends it at the backgrounded timestamp and
    /// starts a new one.
    pub fn on_foreground(&self, ts: f64) -> Vec<SessionTransition> {
        let mut state = self.state.lock().unwrap();
        match (state.started_at, state.backgrounded_at.take()) {
            (None, _) => {
                state.started_at = Some(ts);
                vec![SessionTransition::Started { ts }]
            }
            (Some(_), None) => vec![],
            (Some(started_at), Some(backgrounded_at)) => {
                if ts - backgrounded_at < self.timeout_secs {
                    tracing::debug!("Resuming session within timeout window");
                    vec![]
                } else {
                    state.started_at = Some(ts);
                    vec![
                        SessionTransition::Ended {
                            ts: backgrounded_at,
                            duration: backgrounded_at - started_at,
                        },
                        SessionTransition::Started { ts },
                    ]
                }
            }
        }
    }

    /// App went to the background; remember when, but keep the session open.
    pub fn on_background(&self, ts: f64) {
        let mut state = self.state.lock().unwrap();
        if state.started_at.is_some() {
            state.backgrounded_at = Some(ts);
        }
    }

    /// Start timestamp of the active session, if any.
    /// Feeds the in-app `OncePerVisit` frequency rule.
    pub fn session_start_ts(&self) -> Option<f64> {
        self.state.lock().unwrap().started_at
    }
}
