use std::time::Duration;
use anyhow::bail;
use crate::link_control::LinkParameters;

pub const MIN_PACKET_SIZE: u16 = 1;
pub const MAX_PACKET_SIZE: u16 = 4096;

/// Baud rates a physical UART can be configured for. The protocol itself works with any rate,
///  the rate is only used for timing (retransmission timeouts), but a rate that no UART supports
///  is almost certainly a configuration error.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    2400, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600, 1000000, 1152000,
    1500000, 2000000, 2500000, 3000000, 3500000, 4000000,
];

#[derive(Clone, Debug)]
pub struct SlapConfig {
    /// Maximum payload of a single DATA frame. This is the *local* limit; the effective limit is
    ///  the minimum of both peers' values.
    pub packet_size: u16,

    /// Maximum number of *frames* (not bytes) that can be outstanding, i.e. sent and not yet
    ///  acknowledged. The receiver buffers up to this many frames out of order.
    pub window_size: u8,

    pub baud_rate: u32,

    /// Retransmission timeout is this base value plus the time it takes to transmit a full
    ///  window in both directions at the negotiated baud rate
    pub base_retransmit_timeout: Duration,
    /// Upper bound for the retransmission timeout, which is doubled for every retry
    pub max_retransmit_timeout: Duration,
    /// A frame that is still not acknowledged after this many retransmissions renders the link
    ///  dead
    pub max_retries: u32,

    /// Interval for re-sending link control frames until the peer's parameters were received
    pub link_control_interval: Duration,
    /// After a local close, the closing link control frame is re-sent up to this many times (at
    ///  `link_control_interval`) until the peer confirms it
    pub close_retries: u32,

    /// Chunk size for reading from the raw link
    pub read_buffer_size: usize,

    /// Received in-order data that the application has not pulled yet is buffered up to this
    ///  limit. Beyond that, incoming frames are dropped, and the sender keeps retrying at its
    ///  maximum timeout until the application pulls.
    pub max_buffered_receive_bytes: usize,
}

impl SlapConfig {
    /// Defaults for a typical UART link: 115200 baud with 100 byte packets and a window of 4
    pub fn default_uart() -> SlapConfig {
        SlapConfig {
            packet_size: 100,
            window_size: 4,
            baud_rate: 115200,
            base_retransmit_timeout: Duration::from_millis(100),
            max_retransmit_timeout: Duration::from_secs(2),
            max_retries: 10,
            link_control_interval: Duration::from_millis(250),
            close_retries: 5,
            read_buffer_size: 640,
            max_buffered_receive_bytes: 1024*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_size < MIN_PACKET_SIZE || self.packet_size > MAX_PACKET_SIZE {
            bail!("packet size must be between {} and {}, was {}", MIN_PACKET_SIZE, MAX_PACKET_SIZE, self.packet_size);
        }
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            bail!("unsupported baud rate {}", self.baud_rate);
        }
        if self.base_retransmit_timeout.is_zero() {
            bail!("base retransmit timeout must be positive");
        }
        if self.max_retransmit_timeout < self.base_retransmit_timeout {
            bail!("max retransmit timeout {:?} is smaller than the base timeout {:?}", self.max_retransmit_timeout, self.base_retransmit_timeout);
        }
        if self.link_control_interval.is_zero() {
            bail!("link control interval must be positive");
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be positive");
        }
        if self.max_buffered_receive_bytes < self.packet_size as usize {
            bail!("receive buffer of {} bytes can not hold a single packet of {} bytes", self.max_buffered_receive_bytes, self.packet_size);
        }
        Ok(())
    }

    pub fn local_link_parameters(&self) -> LinkParameters {
        LinkParameters {
            packet_size: self.packet_size,
            window_size: self.window_size,
            baud_rate: self.baud_rate,
        }
    }
}

impl Default for SlapConfig {
    fn default() -> Self {
        Self::default_uart()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        SlapConfig::default_uart().validate().unwrap();
    }

    #[rstest]
    #[case::packet_size_zero(|c: &mut SlapConfig| c.packet_size = 0)]
    #[case::packet_size_too_big(|c: &mut SlapConfig| c.packet_size = MAX_PACKET_SIZE + 1)]
    #[case::window_size_zero(|c: &mut SlapConfig| c.window_size = 0)]
    #[case::odd_baud_rate(|c: &mut SlapConfig| c.baud_rate = 12345)]
    #[case::zero_base_timeout(|c: &mut SlapConfig| c.base_retransmit_timeout = Duration::ZERO)]
    #[case::max_below_base(|c: &mut SlapConfig| c.max_retransmit_timeout = Duration::from_millis(1))]
    #[case::zero_link_control_interval(|c: &mut SlapConfig| c.link_control_interval = Duration::ZERO)]
    #[case::zero_read_buffer(|c: &mut SlapConfig| c.read_buffer_size = 0)]
    #[case::tiny_receive_buffer(|c: &mut SlapConfig| c.max_buffered_receive_bytes = 10)]
    fn test_validate_rejects(#[case] modify: fn(&mut SlapConfig)) {
        let mut config = SlapConfig::default_uart();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::min(1)]
    #[case::max(MAX_PACKET_SIZE)]
    fn test_validate_packet_size_bounds(#[case] packet_size: u16) {
        let config = SlapConfig {
            packet_size,
            max_buffered_receive_bytes: 8192,
            ..SlapConfig::default_uart()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_local_link_parameters() {
        let config = SlapConfig {
            packet_size: 64,
            window_size: 2,
            baud_rate: 9600,
            ..SlapConfig::default_uart()
        };
        assert_eq!(config.local_link_parameters(), LinkParameters { packet_size: 64, window_size: 2, baud_rate: 9600 });
    }
}
