use anyhow::bail;
use std::time::Duration;

/// Configuration of a link session.
pub struct LinkConfig {
    /// Initial capacity of the receive ring buffer, in bytes. Must be a power
    ///  of two; the buffer doubles on demand from there.
    pub recv_buffer_capacity: usize,

    /// Interval at which handshake probes are repeated while connecting. The
    ///  first probe goes out immediately.
    pub handshake_interval: Duration,

    /// Whether a detected sequence gap raises a Supervisory-Reject asking the
    ///  peer to retransmit from the first missing sequence. When off, gaps are
    ///  flagged and logged but never requested again.
    pub reject_on_gap: bool,
}

impl LinkConfig {
    /// Defaults matching the reference deployment: a serial line feeding an
    ///  8 KiB receive ring, probed every two seconds, detect-but-do-not-recover.
    pub fn default_serial() -> LinkConfig {
        LinkConfig {
            recv_buffer_capacity: 8192,
            handshake_interval: Duration::from_secs(2),
            reject_on_gap: false,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_buffer_capacity == 0 || !self.recv_buffer_capacity.is_power_of_two() {
            bail!(
                "receive buffer capacity must be a power of two, was {}",
                self.recv_buffer_capacity
            );
        }
        if self.handshake_interval.is_zero() {
            bail!("handshake interval must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_serial_is_valid() {
        assert!(LinkConfig::default_serial().validate().is_ok());
    }

    #[rstest]
    #[case::zero_capacity(0, 2000, false)]
    #[case::non_power_of_two(1000, 2000, false)]
    #[case::zero_interval(8192, 0, false)]
    #[case::valid(1024, 500, true)]
    fn test_validate(#[case] capacity: usize, #[case] interval_millis: u64, #[case] expected_ok: bool) {
        let config = LinkConfig {
            recv_buffer_capacity: capacity,
            handshake_interval: Duration::from_millis(interval_millis),
            reject_on_gap: false,
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
