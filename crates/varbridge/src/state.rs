//! Session state and mode types.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Where a session is in its request/response cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No request in flight
    #[default]
    Idle,
    /// Blocked reading the inbound stream
    AwaitingRequest,
    /// Running a request against the symbol table
    Dispatching,
    /// Result computed, being written
    AwaitingResponseSend,
    /// Streams released, no further I/O
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Who drives the read/dispatch/write cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// The session loops on the inbound stream by itself.
    #[default]
    Service,
    /// The host polls one cycle at a time between its own work.
    Interactive,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Ok(Mode::Service),
            "interactive" => Ok(Mode::Interactive),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

const NO_REQUEST: u8 = 0;
const TO_SERVICE: u8 = 1;
const TO_INTERACTIVE: u8 = 2;

/// Shareable handle for requesting a mode change.
///
/// The session reads and clears the request at its next Idle boundary, so a switch
/// never interrupts a request that is being served.
#[derive(Debug, Clone, Default)]
pub struct ModeSwitch(Arc<AtomicU8>);

impl ModeSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, mode: Mode) {
        let code = match mode {
            Mode::Service => TO_SERVICE,
            Mode::Interactive => TO_INTERACTIVE,
        };
        self.0.store(code, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Option<Mode> {
        match self.0.swap(NO_REQUEST, Ordering::AcqRel) {
            TO_SERVICE => Some(Mode::Service),
            TO_INTERACTIVE => Some(Mode::Interactive),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_default_is_idle() {
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                SessionState::Idle,
                SessionState::AwaitingRequest,
                SessionState::Dispatching,
                SessionState::AwaitingResponseSend,
                SessionState::Closed,
            ],
            @r#"
        [
          "IDLE",
          "AWAITING_REQUEST",
          "DISPATCHING",
          "AWAITING_RESPONSE_SEND",
          "CLOSED"
        ]
        "#
        );
    }

    #[test]
    fn state_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<SessionState>("\"AWAITING_RESPONSE_SEND\"").unwrap(),
            SessionState::AwaitingResponseSend
        );
        assert_eq!(
            serde_json::from_str::<Mode>("\"interactive\"").unwrap(),
            Mode::Interactive
        );
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Interactive".parse::<Mode>(), Ok(Mode::Interactive));
        assert_eq!(" service ".parse::<Mode>(), Ok(Mode::Service));
        assert!("batch".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_switch_is_taken_once() {
        let switch = ModeSwitch::new();
        let shared = switch.clone();
        assert_eq!(switch.take(), None);

        shared.request(Mode::Interactive);
        assert_eq!(switch.take(), Some(Mode::Interactive));
        assert_eq!(switch.take(), None);

        shared.request(Mode::Interactive);
        shared.request(Mode::Service);
        assert_eq!(switch.take(), Some(Mode::Service));
    }
}
