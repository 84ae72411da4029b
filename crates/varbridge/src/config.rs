//! Session configuration.

use std::time::Duration;

use crate::bridge::codec::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_FRAME_BYTES, MessageCodec};
use crate::refs::DEFAULT_MAX_HANDLES;
use crate::state::Mode;

/// Consecutive recoverable failures tolerated before the session gives up.
pub const DEFAULT_ERROR_LOOP_BOUND: u32 = 32;

pub const MODE_ENV: &str = "VARBRIDGE_MODE";
pub const ERROR_LOOP_BOUND_ENV: &str = "VARBRIDGE_ERROR_LOOP_BOUND";
pub const MAX_FRAME_BYTES_ENV: &str = "VARBRIDGE_MAX_FRAME_BYTES";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: Mode,
    pub error_loop_bound: u32,
    pub max_handles: usize,
    pub max_frame_bytes: usize,
    pub max_depth: usize,
    /// How long one Interactive poll waits for a request.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Service,
            error_loop_bound: DEFAULT_ERROR_LOOP_BOUND,
            max_handles: DEFAULT_MAX_HANDLES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_depth: DEFAULT_MAX_DEPTH,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `VARBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(MODE_ENV) {
            match raw.parse::<Mode>() {
                Ok(mode) => config.mode = mode,
                Err(e) => tracing::warn!(var = MODE_ENV, error = %e, "Ignoring invalid setting"),
            }
        }
        if let Some(raw) = lookup(ERROR_LOOP_BOUND_ENV) {
            match raw.trim().parse::<u32>() {
                Ok(bound) => config.error_loop_bound = bound,
                Err(e) => {
                    tracing::warn!(var = ERROR_LOOP_BOUND_ENV, error = %e, "Ignoring invalid setting")
                }
            }
        }
        if let Some(raw) = lookup(MAX_FRAME_BYTES_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) if bytes > 0 => config.max_frame_bytes = bytes,
                Ok(_) => tracing::warn!(var = MAX_FRAME_BYTES_ENV, "Ignoring zero frame limit"),
                Err(e) => {
                    tracing::warn!(var = MAX_FRAME_BYTES_ENV, error = %e, "Ignoring invalid setting")
                }
            }
        }
        config
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_error_loop_bound(mut self, bound: u32) -> Self {
        self.error_loop_bound = bound;
        self
    }

    pub fn with_max_handles(mut self, n: usize) -> Self {
        self.max_handles = n;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub(crate) fn codec(&self) -> MessageCodec {
        MessageCodec::new()
            .with_max_depth(self.max_depth)
            .with_max_frame_bytes(self.max_frame_bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.mode, Mode::Service);
        assert_eq!(config.error_loop_bound, 32);
        assert_eq!(config.max_handles, 4096);
        assert_eq!(config.max_depth, 64);
    }

    #[test]
    fn environment_overrides() {
        let config = SessionConfig::from_lookup(lookup(&[
            (MODE_ENV, "interactive"),
            (ERROR_LOOP_BOUND_ENV, "4"),
            (MAX_FRAME_BYTES_ENV, "1024"),
        ]));
        assert_eq!(config.mode, Mode::Interactive);
        assert_eq!(config.error_loop_bound, 4);
        assert_eq!(config.max_frame_bytes, 1024);
    }

    #[test]
    fn invalid_environment_values_keep_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[
            (MODE_ENV, "batch"),
            (ERROR_LOOP_BOUND_ENV, "many"),
            (MAX_FRAME_BYTES_ENV, "0"),
        ]));
        assert_eq!(config.mode, Mode::Service);
        assert_eq!(config.error_loop_bound, DEFAULT_ERROR_LOOP_BOUND);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn builder_chains() {
        let config = SessionConfig::new()
            .with_mode(Mode::Interactive)
            .with_max_handles(8)
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.mode, Mode::Interactive);
        assert_eq!(config.max_handles, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }
}
