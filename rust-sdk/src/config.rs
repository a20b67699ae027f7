use std::time::Duration;

use flagstream_core::network::NetworkConfig;

/// Configuration for [`crate::Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagstream::ClientConfig;
/// let config = ClientConfig::default()
///     .start_wait(Duration::from_secs(5))
///     .event_flush_interval(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) offline: bool,
    pub(crate) start_wait: Duration,
    pub(crate) streaming_first_retry_delay: Duration,
    pub(crate) streaming_max_retry_times: Option<u64>,
    pub(crate) event_capacity: usize,
    pub(crate) event_flush_interval: Duration,
    pub(crate) event_retry_interval: Duration,
    pub(crate) event_max_retry_times: u32,
    pub(crate) network: NetworkConfig,
}

impl ClientConfig {
    /// How long construction blocks awaiting the first successful data
    /// sync.
    pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(15);
    /// Base delay for the streaming reconnect backoff.
    pub const DEFAULT_FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);
    /// Base delay between event POST retries.
    pub const DEFAULT_EVENT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
    /// Event POST retry bound.
    pub const DEFAULT_EVENT_MAX_RETRY_TIMES: u32 = 1;

    /// Run without any network activity: the synchronizer and the event
    /// pipeline become no-ops and the snapshot can be bootstrapped from a
    /// JSON blob.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Block construction up to this long for the first successful sync.
    /// Zero returns immediately; initialization continues in the
    /// background.
    pub fn start_wait(mut self, start_wait: Duration) -> Self {
        self.start_wait = start_wait;
        self
    }

    /// Base for the streaming reconnect backoff.
    pub fn streaming_first_retry_delay(mut self, delay: Duration) -> Self {
        self.streaming_first_retry_delay = if delay.is_zero() {
            Self::DEFAULT_FIRST_RETRY_DELAY
        } else {
            delay
        };
        self
    }

    /// Cap on streaming reconnect attempts. `None` retries forever.
    pub fn streaming_max_retry_times(mut self, max_retry_times: Option<u64>) -> Self {
        self.streaming_max_retry_times = max_retry_times;
        self
    }

    /// Inbox size of the event pipeline.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Cadence of the periodic event flush.
    pub fn event_flush_interval(mut self, interval: Duration) -> Self {
        self.event_flush_interval = interval;
        self
    }

    /// Base delay between retries of a failed events POST.
    pub fn event_retry_interval(mut self, interval: Duration) -> Self {
        self.event_retry_interval = if interval.is_zero() {
            Self::DEFAULT_EVENT_RETRY_INTERVAL
        } else {
            interval
        };
        self
    }

    /// Retry bound per events POST.
    pub fn event_max_retry_times(mut self, max_retry_times: u32) -> Self {
        self.event_max_retry_times = if max_retry_times == 0 {
            Self::DEFAULT_EVENT_MAX_RETRY_TIMES
        } else {
            max_retry_times
        };
        self
    }

    /// PEM-encoded additional root certificate for the HTTP client.
    pub fn ca_certificate(mut self, pem: Vec<u8>) -> Self {
        self.network.ca_certificate = Some(pem);
        self
    }

    /// Proxy URL for outbound HTTP traffic.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.network.proxy = Some(proxy.into());
        self
    }
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            offline: false,
            start_wait: ClientConfig::DEFAULT_START_WAIT,
            streaming_first_retry_delay: ClientConfig::DEFAULT_FIRST_RETRY_DELAY,
            streaming_max_retry_times: None,
            event_capacity: 10_000,
            event_flush_interval: Duration::from_secs(1),
            event_retry_interval: ClientConfig::DEFAULT_EVENT_RETRY_INTERVAL,
            event_max_retry_times: ClientConfig::DEFAULT_EVENT_MAX_RETRY_TIMES,
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = ClientConfig::default()
            .streaming_first_retry_delay(Duration::ZERO)
            .event_retry_interval(Duration::ZERO)
            .event_max_retry_times(0);
        assert_eq!(
            config.streaming_first_retry_delay,
            ClientConfig::DEFAULT_FIRST_RETRY_DELAY
        );
        assert_eq!(
            config.event_retry_interval,
            ClientConfig::DEFAULT_EVENT_RETRY_INTERVAL
        );
        assert_eq!(
            config.event_max_retry_times,
            ClientConfig::DEFAULT_EVENT_MAX_RETRY_TIMES
        );
    }
}
