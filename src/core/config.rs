//! Configuration surface exposed to embedding code.
//!
//! Every config has a `Default` built from [`constants`](super::constants) and
//! a builder in the style `ServerConfigBuilder::new().listen_addr(..).build()`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::constants::*;
use super::error::ConfigError;

/// Backoff idle strategy parameters.
///
/// An idle duty cycle spins `max_spins` times, then yields `max_yields`
/// times, then parks for `min_park` doubling up to `max_park`. Any
/// iteration that does work resets the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    /// Busy spins before yielding.
    pub max_spins: u32,
    /// Thread yields before parking.
    pub max_yields: u32,
    /// First park period.
    pub min_park: Duration,
    /// Park period ceiling.
    pub max_park: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            max_spins: DEFAULT_IDLE_MAX_SPINS,
            max_yields: DEFAULT_IDLE_MAX_YIELDS,
            min_park: DEFAULT_IDLE_MIN_PARK,
            max_park: DEFAULT_IDLE_MAX_PARK,
        }
    }
}

impl IdleConfig {
    /// Check park bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_park > self.max_park {
            return Err(ConfigError::ParkBounds {
                min: self.min_park,
                max: self.max_park,
            });
        }
        Ok(())
    }
}

/// Duty-cycle thread configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Name of the dedicated thread.
    pub thread_name: String,
    /// Idle strategy parameters.
    pub idle: IdleConfig,
    /// Timer wheel tick duration.
    pub timer_tick: Duration,
    /// Timer wheel bucket count (power of two).
    pub timer_buckets: usize,
    /// Fragments per subscription per iteration; 0 polls everything available.
    pub fragment_limit: usize,
    /// Largest message the fragment assembler will rebuild.
    pub max_message_length: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            thread_name: SERVER_THREAD_NAME.to_string(),
            idle: IdleConfig::default(),
            timer_tick: DEFAULT_TIMER_TICK,
            timer_buckets: DEFAULT_TIMER_BUCKETS,
            fragment_limit: 0,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

impl PollerConfig {
    /// Poller config with a custom thread name.
    pub fn named(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            ..Self::default()
        }
    }

    /// Check timer wheel and idle parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer_tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.timer_buckets == 0 || !self.timer_buckets.is_power_of_two() {
            return Err(ConfigError::TimerBuckets(self.timer_buckets));
        }
        self.idle.validate()
    }
}

/// Handshake acknowledgement and liveness configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Acknowledgement delivery attempts before the entry fails.
    pub ack_retry_count: u32,
    /// Pause between acknowledgement delivery attempts.
    pub ack_retry_pause: Duration,
    /// Offers per attempt on transient backpressure.
    pub offer_retries: u32,
    /// Time a fresh image may wait for its establish request.
    pub establish_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ack_retry_count: DEFAULT_ACK_RETRY_COUNT,
            ack_retry_pause: DEFAULT_ACK_RETRY_PAUSE,
            offer_retries: DEFAULT_OFFER_RETRIES,
            establish_timeout: DEFAULT_ESTABLISH_TIMEOUT,
        }
    }
}

impl HandshakeConfig {
    /// Check retry budgets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_retry_count == 0 {
            return Err(ConfigError::ZeroBudget("ack_retry_count"));
        }
        if self.offer_retries == 0 {
            return Err(ConfigError::ZeroBudget("offer_retries"));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address clients publish to.
    pub listen_addr: SocketAddr,
    /// Stream the server subscribes to.
    pub server_stream_id: i32,
    /// Stream the server publishes responses on.
    pub client_stream_id: i32,
    /// Duty-cycle configuration.
    pub poller: PollerConfig,
    /// Handshake configuration.
    pub handshake: HandshakeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SERVER_PORT),
            server_stream_id: SERVER_STREAM_ID,
            client_stream_id: CLIENT_STREAM_ID,
            poller: PollerConfig::named(SERVER_THREAD_NAME),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check nested configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poller.validate()?;
        self.handshake.validate()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the stream ids (server inbound, client response).
    pub fn stream_ids(mut self, server: i32, client: i32) -> Self {
        self.config.server_stream_id = server;
        self.config.client_stream_id = client;
        self
    }

    /// Set the duty-cycle configuration.
    pub fn poller(mut self, poller: PollerConfig) -> Self {
        self.config.poller = poller;
        self
    }

    /// Set the idle strategy parameters.
    pub fn idle(mut self, idle: IdleConfig) -> Self {
        self.config.poller.idle = idle;
        self
    }

    /// Set the timer wheel tick and bucket count.
    pub fn timer_wheel(mut self, tick: Duration, buckets: usize) -> Self {
        self.config.poller.timer_tick = tick;
        self.config.poller.timer_buckets = buckets;
        self
    }

    /// Set acknowledgement retry count and spacing.
    pub fn ack_retry(mut self, count: u32, pause: Duration) -> Self {
        self.config.handshake.ack_retry_count = count;
        self.config.handshake.ack_retry_pause = pause;
        self
    }

    /// Set offers per acknowledgement attempt on transient backpressure.
    pub fn offer_retries(mut self, retries: u32) -> Self {
        self.config.handshake.offer_retries = retries;
        self
    }

    /// Set the establish timeout for fresh images.
    pub fn establish_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake.establish_timeout = timeout;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Address the server publishes responses to.
    pub response_addr: SocketAddr,
    /// Stream servers subscribe to.
    pub server_stream_id: i32,
    /// Stream this client subscribes to for responses.
    pub client_stream_id: i32,
    /// Overall deadline for one `connect`.
    pub connect_timeout: Duration,
    /// Establish requests sent within the deadline.
    pub establish_attempts: u32,
    /// Wait after the first establish request; doubles per attempt.
    pub establish_backoff: Duration,
    /// Offers per send on transient backpressure.
    pub send_retries: u32,
    /// Duty-cycle configuration.
    pub poller: PollerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CLIENT_PORT),
            server_stream_id: SERVER_STREAM_ID,
            client_stream_id: CLIENT_STREAM_ID,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            establish_attempts: DEFAULT_ESTABLISH_ATTEMPTS,
            establish_backoff: DEFAULT_ESTABLISH_BACKOFF,
            send_retries: DEFAULT_OFFER_RETRIES,
            poller: PollerConfig::named(CLIENT_THREAD_NAME),
        }
    }
}

impl ClientConfig {
    /// Check nested configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.establish_attempts == 0 {
            return Err(ConfigError::ZeroBudget("establish_attempts"));
        }
        if self.send_retries == 0 {
            return Err(ConfigError::ZeroBudget("send_retries"));
        }
        self.poller.validate()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response address.
    pub fn response_addr(mut self, addr: SocketAddr) -> Self {
        self.config.response_addr = addr;
        self
    }

    /// Set the stream ids (server inbound, client response).
    pub fn stream_ids(mut self, server: i32, client: i32) -> Self {
        self.config.server_stream_id = server;
        self.config.client_stream_id = client;
        self
    }

    /// Set the connect deadline.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set establish attempts and initial backoff.
    pub fn establish_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.config.establish_attempts = attempts;
        self.config.establish_backoff = backoff;
        self
    }

    /// Set the send retry budget.
    pub fn send_retries(mut self, retries: u32) -> Self {
        self.config.send_retries = retries;
        self
    }

    /// Set the duty-cycle configuration.
    pub fn poller(mut self, poller: PollerConfig) -> Self {
        self.config.poller = poller;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_server_builder() {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let config = ServerConfigBuilder::new()
            .listen_addr(addr)
            .timer_wheel(Duration::from_millis(2), 256)
            .ack_retry(3, Duration::from_millis(5))
            .build();

        assert_eq!(config.listen_addr, addr);
        assert_eq!(config.poller.timer_buckets, 256);
        assert_eq!(config.handshake.ack_retry_count, 3);
        assert_eq!(config.poller.thread_name, SERVER_THREAD_NAME);
    }

    #[test]
    fn test_invalid_timer_buckets() {
        let config = ServerConfigBuilder::new()
            .timer_wheel(Duration::from_millis(1), 100)
            .build();
        assert_eq!(config.validate(), Err(ConfigError::TimerBuckets(100)));

        let config = ServerConfigBuilder::new()
            .timer_wheel(Duration::ZERO, 64)
            .build();
        assert_eq!(config.validate(), Err(ConfigError::ZeroTick));
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let config = ServerConfigBuilder::new()
            .ack_retry(0, Duration::from_millis(1))
            .build();
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroBudget("ack_retry_count"))
        );

        let config = ClientConfigBuilder::new()
            .establish_retry(0, Duration::from_millis(10))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_idle_bounds() {
        let idle = IdleConfig {
            min_park: Duration::from_millis(5),
            max_park: Duration::from_millis(1),
            ..IdleConfig::default()
        };
        assert!(matches!(idle.validate(), Err(ConfigError::ParkBounds { .. })));
    }
}
