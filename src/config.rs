use std::time::Duration;

use crate::protocol::{DEFAULT_MAX_PAYLOAD, MAX_CHANNELS};
use crate::scaling::ScalingContext;

/// Settings for a [`crate::Controller`].
///
/// ```rust
/// use std::time::Duration;
/// let config = apt_stage::DriverConfig::default()
///     .with_channel_count(2)
///     .with_query_timeout(Duration::from_millis(500));
/// assert_eq!(config.channel_count, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Number of channels the controller drives, `1..=10`. Channel ids are `1..=channel_count`.
    pub channel_count: u8,
    /// Encoder resolution used for every unit conversion.
    pub encoder_counts_per_unit: f64,
    /// How long a query or set-and-verify waits for its response.
    pub query_timeout: Duration,
    /// Read timeout of the monitor loop. Also its back-off after a read error.
    pub poll_interval: Duration,
    /// Size of the buffer handed to each read.
    pub read_buffer_size: usize,
    /// Largest data packet the decoder accepts.
    pub max_payload_len: u16,
    /// Send `HW_START_UPDATEMSGS` on connect and `HW_STOP_UPDATEMSGS` on disconnect.
    pub update_messages: bool,
    /// Ask the controller for its hardware info on connect and log it.
    pub request_hardware_info: bool,
    /// Refuse moves on channels that are not enabled and homed.
    pub require_ready_for_moves: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            channel_count: 3,
            encoder_counts_per_unit: ScalingContext::default().encoder_counts_per_unit(),
            query_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
            read_buffer_size: 256,
            max_payload_len: DEFAULT_MAX_PAYLOAD,
            update_messages: true,
            request_hardware_info: false,
            require_ready_for_moves: true,
        }
    }
}

impl DriverConfig {
    /// Sets the channel count, clamped to `1..=10`.
    pub fn with_channel_count(mut self, channel_count: u8) -> Self {
        self.channel_count = channel_count.clamp(1, MAX_CHANNELS);
        self
    }

    /// Sets the encoder resolution.
    pub fn with_encoder_counts_per_unit(mut self, counts: f64) -> Self {
        self.encoder_counts_per_unit = counts;
        self
    }

    /// Sets the query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Sets the monitor poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enables or disables periodic update messages.
    pub fn with_update_messages(mut self, enable: bool) -> Self {
        self.update_messages = enable;
        self
    }

    /// Enables or disables the hardware info request on connect.
    pub fn with_hardware_info(mut self, enable: bool) -> Self {
        self.request_hardware_info = enable;
        self
    }

    /// Enables or disables the ready check before moves.
    pub fn with_ready_check(mut self, enable: bool) -> Self {
        self.require_ready_for_moves = enable;
        self
    }

    /// The scaling context for this configuration.
    pub fn scaling(&self) -> ScalingContext {
        ScalingContext::new(self.encoder_counts_per_unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.channel_count, 3);
        assert_eq!(config.encoder_counts_per_unit, 20_000.0);
        assert_eq!(config.query_timeout, Duration::from_secs(1));
        assert_eq!(config.scaling().position_to_counts(1.0), 20_000);
    }

    #[test]
    fn channel_count_is_clamped() {
        assert_eq!(DriverConfig::default().with_channel_count(0).channel_count, 1);
        assert_eq!(DriverConfig::default().with_channel_count(42).channel_count, 10);
    }
}
