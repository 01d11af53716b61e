//! Session configuration

use d2dp_protocol::params::{
    DEFAULT_ACK_PERIOD, DEFAULT_BUFFER_SIZE, DEFAULT_RTO_PERIOD, DESTROY_TIMEOUT, MAX_ACK_PERIOD,
    MAX_BUFFER_SIZE, MAX_RTO_PERIOD, MIN_ACK_PERIOD, MIN_BUFFER_SIZE, MIN_RTO_PERIOD,
    RETRY_LIMIT_MAX, RETRY_LIMIT_MIN,
};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Buffer size {0} bytes out of range")]
    BufferSize(usize),

    #[error("ACK period {0:?} out of range")]
    AckPeriod(Duration),

    #[error("RTO period {0:?} out of range")]
    RtoPeriod(Duration),

    #[error("Invalid retry limits: min {min}, max {max}")]
    RetryLimits { min: u32, max: u32 },

    #[error("Flush timeout must be non-zero")]
    FlushTimeout,

    #[error("Crypto overhead of {0} bytes leaves no room for payload")]
    CryptoOverhead(usize),
}

/// Session tuning
///
/// Out-of-range values are rejected by [`SessionConfig::validate`] rather
/// than clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Size of each window in bytes
    pub buffer_size: usize,
    /// Period of the acknowledgement timer
    pub ack_period: Duration,
    /// Base period of the retransmission timer
    pub rto_period: Duration,
    /// Consecutive timeouts before the RTO period starts doubling
    pub retry_limit_min: u32,
    /// Consecutive timeouts after which the link is declared dead
    pub retry_limit_max: u32,
    /// How long `close` waits for in-flight data to be acknowledged
    pub flush_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            ack_period: DEFAULT_ACK_PERIOD,
            rto_period: DEFAULT_RTO_PERIOD,
            retry_limit_min: RETRY_LIMIT_MIN,
            retry_limit_max: RETRY_LIMIT_MAX,
            flush_timeout: DESTROY_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the ACK period; the RTO period follows at ten times the value
    pub fn with_ack_period(mut self, period: Duration) -> Self {
        self.ack_period = period;
        self.rto_period = period.saturating_mul(10);
        self
    }

    pub fn with_rto_period(mut self, period: Duration) -> Self {
        self.rto_period = period;
        self
    }

    pub fn with_retry_limits(mut self, min: u32, max: u32) -> Self {
        self.retry_limit_min = min;
        self.retry_limit_max = max;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::BufferSize(self.buffer_size));
        }
        if !(MIN_ACK_PERIOD..=MAX_ACK_PERIOD).contains(&self.ack_period) {
            return Err(ConfigError::AckPeriod(self.ack_period));
        }
        if !(MIN_RTO_PERIOD..=MAX_RTO_PERIOD).contains(&self.rto_period) {
            return Err(ConfigError::RtoPeriod(self.rto_period));
        }
        if self.retry_limit_max == 0 || self.retry_limit_min > self.retry_limit_max {
            return Err(ConfigError::RetryLimits {
                min: self.retry_limit_min,
                max: self.retry_limit_max,
            });
        }
        if self.flush_timeout.is_zero() {
            return Err(ConfigError::FlushTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rto_period, config.ack_period * 10);
    }

    #[test]
    fn test_buffer_size_bounds() {
        let config = SessionConfig::default().with_buffer_size(MIN_BUFFER_SIZE - 1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::BufferSize(MIN_BUFFER_SIZE - 1))
        );

        let config = SessionConfig::default().with_buffer_size(MAX_BUFFER_SIZE + 1);
        assert!(config.validate().is_err());

        let config = SessionConfig::default().with_buffer_size(MIN_BUFFER_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ack_period_drives_rto() {
        let config = SessionConfig::default().with_ack_period(Duration::from_millis(2));
        assert_eq!(config.rto_period, Duration::from_millis(20));
        assert!(config.validate().is_ok());

        let config = SessionConfig::default().with_ack_period(Duration::from_micros(500));
        assert!(matches!(config.validate(), Err(ConfigError::AckPeriod(_))));
    }

    #[test]
    fn test_rto_period_bounds() {
        let config = SessionConfig::default().with_rto_period(Duration::from_millis(5));
        assert!(matches!(config.validate(), Err(ConfigError::RtoPeriod(_))));
    }

    #[test]
    fn test_retry_limits() {
        let config = SessionConfig::default().with_retry_limits(5, 3);
        assert_eq!(
            config.validate(),
            Err(ConfigError::RetryLimits { min: 5, max: 3 })
        );

        let config = SessionConfig::default().with_retry_limits(0, 0);
        assert!(config.validate().is_err());

        let config = SessionConfig::default().with_retry_limits(0, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flush_timeout() {
        let config = SessionConfig::default().with_flush_timeout(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::FlushTimeout));
    }
}
