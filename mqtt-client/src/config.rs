use std::time::Duration;

use mqtt_core::ProtocolVersion;

use crate::error::{Error, Result};

/// Client role profile: which direction(s) of traffic this client expects
/// to originate. Mirrors the `SUBSCRIBER`/`PUBLISHER` bitmask the original
/// factory validates at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
    PublisherAndSubscriber,
}

const DEFAULT_WINDOW_SIZE: usize = 16;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1024);
const DEFAULT_BANDWIDTH: f64 = 10_000.0;
const DEFAULT_FACTOR: f64 = 2.0;

const MIN_WINDOW_SIZE: usize = 1;
const MAX_WINDOW_SIZE: usize = 16;
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 1024;

/// Tunables collected from spec.md §6's "Recognized configuration options".
///
/// Each `set_*` validates its input and returns `Result<()>` instead of
/// panicking, the Rust-native replacement for the original's
/// `raise ...ValueError(...)` builder methods.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol: ProtocolVersion,
    pub clean_session: bool,
    pub role: Role,
    window_size: usize,
    retry_initial: Duration,
    retry_max_delay: Duration,
    bandwidth: f64,
    factor: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            protocol: ProtocolVersion::V311,
            clean_session: true,
            role: Role::PublisherAndSubscriber,
            window_size: DEFAULT_WINDOW_SIZE,
            retry_initial: DEFAULT_TIMEOUT,
            retry_max_delay: DEFAULT_MAX_DELAY,
            bandwidth: DEFAULT_BANDWIDTH,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn retry_initial(&self) -> Duration {
        self.retry_initial
    }

    pub fn retry_max_delay(&self) -> Duration {
        self.retry_max_delay
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// window size ∈ [1, 16]; larger raises `InvalidWindowSize`.
    pub fn set_window_size(&mut self, n: usize) -> Result<()> {
        if !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&n) {
            return Err(Error::InvalidWindowSize(n));
        }
        self.window_size = n;
        Ok(())
    }

    /// retry initial timeout ∈ [1, 1024] seconds.
    pub fn set_timeout(&mut self, seconds: u64) -> Result<()> {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&seconds) {
            return Err(Error::InvalidTimeout(seconds));
        }
        self.retry_initial = Duration::from_secs(seconds);
        Ok(())
    }

    /// estimated bandwidth (bytes/sec, positive) and backoff factor
    /// (positive) used to shape PUBLISH retransmission.
    pub fn set_bandwidth(&mut self, bytes_per_sec: f64, factor: f64) -> Result<()> {
        if !(bytes_per_sec > 0.0 && factor > 0.0) {
            return Err(Error::InvalidBandwidth(format!(
                "bandwidth={}, factor={}",
                bytes_per_sec, factor
            )));
        }
        self.bandwidth = bytes_per_sec;
        self.factor = factor;
        Ok(())
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = role;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_window_size() {
        let mut config = ClientConfig::new();
        assert!(config.set_window_size(0).is_err());
        assert!(config.set_window_size(17).is_err());
        assert!(config.set_window_size(16).is_ok());
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut config = ClientConfig::new();
        assert!(config.set_timeout(0).is_err());
        assert!(config.set_timeout(1025).is_err());
        assert!(config.set_timeout(1).is_ok());
    }

    #[test]
    fn rejects_non_positive_bandwidth() {
        let mut config = ClientConfig::new();
        assert!(config.set_bandwidth(0.0, 2.0).is_err());
        assert!(config.set_bandwidth(1000.0, 0.0).is_err());
        assert!(config.set_bandwidth(1000.0, 2.0).is_ok());
    }
}
