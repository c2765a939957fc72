use crate::error::{MuxError, Result};
use std::time::Duration;

/// Largest value a frame's 16-bit length field can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Largest user socket id (`2^31 - 2`).
pub const MAX_SOCKET_ID: i32 = i32::MAX - 1;

/// Smallest chunk size that still fits any control message in one frame.
const MIN_CHUNK_SIZE: usize = 16;

/// Configuration shared by every connection group of a [`Mux`](crate::Mux).
///
/// `Config` holds the tunables of the input and output pipelines, the
/// shutdown negotiation timers and the socket id space.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use vsmux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.output_max_chunk_size, 2048);
/// assert_eq!(config.shutdown_refusals_maximum, 5);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use vsmux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .output_max_chunk_size(4096)
///     .input_buffer_size(8192)
///     .shutdown_request_timeout(Duration::from_secs(2))
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest frame payload accepted from the wire; also the read buffer size.
    pub input_buffer_size: usize,
    /// Transient read errors tolerated before a connection is failed.
    pub input_max_errors: u32,
    /// Bytes buffered for a socket id that has not been registered yet.
    pub input_pending_limit: usize,
    /// Bytes buffered across all unregistered socket ids of one group.
    pub input_pending_total_limit: usize,
    /// Unregistered socket ids one group buffers for at a time.
    pub input_pending_max_sockets: usize,
    /// Recently unregistered ids whose late bytes are dead-lettered.
    pub input_retired_window: usize,
    /// Number of recycled message buffers kept by the output pool.
    pub output_message_pool_size: usize,
    /// Capacity of a pooled message buffer; small writes coalesce up to it.
    pub output_message_size: usize,
    /// Largest payload written in a single frame.
    pub output_max_chunk_size: usize,
    /// Longest time one group may hold the output task per turn.
    pub output_max_time_slice: Duration,
    /// Most payload bytes one group may write per turn.
    pub output_max_data_slice: usize,
    /// Transient write errors tolerated before a connection is failed.
    pub output_max_errors: u32,
    pub shutdown_request_timeout: Duration,
    pub shutdown_refusals_maximum: u32,
    pub shutdown_monitor_period: Duration,
    pub static_threads_monitor_period: Duration,
    pub max_socket_id: i32,
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_buffer_size: 4096,
            input_max_errors: 3,
            input_pending_limit: 64 * 1024, // 64KB
            input_pending_total_limit: 1024 * 1024, // 1MB
            input_pending_max_sockets: 256,
            input_retired_window: 1024,
            output_message_pool_size: 1024,
            output_message_size: 256,
            output_max_chunk_size: 2048,
            output_max_time_slice: Duration::from_millis(500),
            output_max_data_slice: 8 * 2048,
            output_max_errors: 3,
            shutdown_request_timeout: Duration::from_millis(5000),
            shutdown_refusals_maximum: 5,
            shutdown_monitor_period: Duration::from_millis(1000),
            static_threads_monitor_period: Duration::from_millis(5000),
            max_socket_id: MAX_SOCKET_ID,
            connect_timeout: Duration::from_millis(5000),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.input_buffer_size == 0 || self.input_buffer_size > MAX_FRAME_PAYLOAD {
            return Err(MuxError::Config(format!(
                "Input buffer size must be between 1 and {MAX_FRAME_PAYLOAD}"
            )));
        }

        if self.output_max_chunk_size < MIN_CHUNK_SIZE
            || self.output_max_chunk_size > MAX_FRAME_PAYLOAD
        {
            return Err(MuxError::Config(format!(
                "Output max chunk size must be between {MIN_CHUNK_SIZE} and {MAX_FRAME_PAYLOAD}"
            )));
        }

        if self.output_max_chunk_size > self.input_buffer_size {
            return Err(MuxError::Config(
                "Output max chunk size cannot exceed input buffer size".to_string(),
            ));
        }

        if self.output_message_size == 0 {
            return Err(MuxError::Config(
                "Output message size cannot be 0".to_string(),
            ));
        }

        if self.output_max_data_slice == 0 || self.output_max_time_slice.is_zero() {
            return Err(MuxError::Config(
                "Output time and data slices must be non-zero".to_string(),
            ));
        }

        if self.shutdown_request_timeout.is_zero()
            || self.shutdown_monitor_period.is_zero()
            || self.static_threads_monitor_period.is_zero()
        {
            return Err(MuxError::Config(
                "Shutdown timeouts and monitor periods must be non-zero".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(MuxError::Config(
                "Connect timeout must be non-zero".to_string(),
            ));
        }

        if self.max_socket_id < 1 || self.max_socket_id > MAX_SOCKET_ID {
            return Err(MuxError::Config(format!(
                "Max socket id must be between 1 and {MAX_SOCKET_ID}"
            )));
        }

        Ok(())
    }

    /// Builds a configuration from named options, starting from the defaults.
    ///
    /// Durations are given in milliseconds. Unknown keys and unparsable
    /// values are rejected.
    ///
    /// ```rust
    /// use vsmux::Config;
    ///
    /// let config = Config::from_options([
    ///     ("output.maxChunkSize", "1024"),
    ///     ("shutdown.requestTimeout", "250"),
    /// ])
    /// .unwrap();
    /// assert_eq!(config.output_max_chunk_size, 1024);
    /// ```
    pub fn from_options<I, K, V>(options: I) -> Result<Config>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = ConfigBuilder::new();
        for (key, value) in options {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            builder = match key {
                "input.bufferSize" => builder.input_buffer_size(parse(key, value)?),
                "input.maxErrors" => builder.input_max_errors(parse(key, value)?),
                "input.pendingLimit" => builder.input_pending_limit(parse(key, value)?),
                "input.pendingTotalLimit" => builder.input_pending_total_limit(parse(key, value)?),
                "input.pendingMaxSockets" => builder.input_pending_max_sockets(parse(key, value)?),
                "input.retiredWindow" => builder.input_retired_window(parse(key, value)?),
                "output.messagePoolSize" => builder.output_message_pool_size(parse(key, value)?),
                "output.messageSize" => builder.output_message_size(parse(key, value)?),
                "output.maxChunkSize" => builder.output_max_chunk_size(parse(key, value)?),
                "output.maxTimeSlice" => builder.output_max_time_slice(millis(key, value)?),
                "output.maxDataSlice" => builder.output_max_data_slice(parse(key, value)?),
                "output.maxErrors" => builder.output_max_errors(parse(key, value)?),
                "shutdown.requestTimeout" => builder.shutdown_request_timeout(millis(key, value)?),
                "shutdown.refusalsMaximum" => builder.shutdown_refusals_maximum(parse(key, value)?),
                "shutdown.monitorPeriod" => builder.shutdown_monitor_period(millis(key, value)?),
                "staticThreads.monitorPeriod" => {
                    builder.static_threads_monitor_period(millis(key, value)?)
                }
                "socketId.max" => builder.max_socket_id(parse(key, value)?),
                "connect.timeout" => builder.connect_timeout(millis(key, value)?),
                other => return Err(MuxError::Config(format!("Unknown option: {other}"))),
            };
        }
        builder.build()
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MuxError::Config(format!("Invalid value for {key}: {value:?}")))
}

fn millis(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

/// Builder for creating custom `Config` instances.
///
/// Starts from [`Config::default`] and validates on [`build`](Self::build).
///
/// ```rust
/// use vsmux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .shutdown_monitor_period(Duration::from_millis(200))
///     .shutdown_refusals_maximum(2)
///     .build()
///     .expect("Valid configuration");
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn input_buffer_size(mut self, size: usize) -> Self {
        self.config.input_buffer_size = size;
        self
    }

    pub fn input_max_errors(mut self, count: u32) -> Self {
        self.config.input_max_errors = count;
        self
    }

    pub fn input_pending_limit(mut self, bytes: usize) -> Self {
        self.config.input_pending_limit = bytes;
        self
    }

    pub fn input_pending_total_limit(mut self, bytes: usize) -> Self {
        self.config.input_pending_total_limit = bytes;
        self
    }

    pub fn input_pending_max_sockets(mut self, count: usize) -> Self {
        self.config.input_pending_max_sockets = count;
        self
    }

    pub fn input_retired_window(mut self, count: usize) -> Self {
        self.config.input_retired_window = count;
        self
    }

    pub fn output_message_pool_size(mut self, count: usize) -> Self {
        self.config.output_message_pool_size = count;
        self
    }

    pub fn output_message_size(mut self, size: usize) -> Self {
        self.config.output_message_size = size;
        self
    }

    pub fn output_max_chunk_size(mut self, size: usize) -> Self {
        self.config.output_max_chunk_size = size;
        self
    }

    pub fn output_max_time_slice(mut self, slice: Duration) -> Self {
        self.config.output_max_time_slice = slice;
        self
    }

    pub fn output_max_data_slice(mut self, bytes: usize) -> Self {
        self.config.output_max_data_slice = bytes;
        self
    }

    pub fn output_max_errors(mut self, count: u32) -> Self {
        self.config.output_max_errors = count;
        self
    }

    pub fn shutdown_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_request_timeout = timeout;
        self
    }

    pub fn shutdown_refusals_maximum(mut self, count: u32) -> Self {
        self.config.shutdown_refusals_maximum = count;
        self
    }

    pub fn shutdown_monitor_period(mut self, period: Duration) -> Self {
        self.config.shutdown_monitor_period = period;
        self
    }

    pub fn static_threads_monitor_period(mut self, period: Duration) -> Self {
        self.config.static_threads_monitor_period = period;
        self
    }

    pub fn max_socket_id(mut self, max: i32) -> Self {
        self.config.max_socket_id = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_socket_id, 2_147_483_646);
    }

    #[test]
    fn test_config_validation() {
        let config = Config {
            output_max_chunk_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            output_max_chunk_size: 70_000,
            input_buffer_size: MAX_FRAME_PAYLOAD,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Peer input buffer must accept our largest chunk
        let config = Config {
            output_max_chunk_size: 8192,
            input_buffer_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            input_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            output_max_data_slice: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            shutdown_monitor_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_socket_id: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Every accepted connect would miss its verification
        let config = Config {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_socket_id: i32::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .input_buffer_size(8192)
            .output_max_chunk_size(8192)
            .output_max_time_slice(Duration::from_millis(50))
            .output_max_data_slice(4096)
            .shutdown_request_timeout(Duration::from_millis(300))
            .shutdown_refusals_maximum(2)
            .shutdown_monitor_period(Duration::from_millis(100))
            .max_socket_id(100)
            .build()
            .unwrap();

        assert_eq!(config.input_buffer_size, 8192);
        assert_eq!(config.output_max_chunk_size, 8192);
        assert_eq!(config.output_max_time_slice, Duration::from_millis(50));
        assert_eq!(config.output_max_data_slice, 4096);
        assert_eq!(config.shutdown_request_timeout, Duration::from_millis(300));
        assert_eq!(config.shutdown_refusals_maximum, 2);
        assert_eq!(config.shutdown_monitor_period, Duration::from_millis(100));
        assert_eq!(config.max_socket_id, 100);
    }

    #[test]
    fn test_config_builder_validation_failure() {
        let result = ConfigBuilder::new().output_max_chunk_size(0).build();

        assert!(result.is_err());
    }

    #[test]
    fn test_from_options() {
        let config = Config::from_options([
            ("input.bufferSize", "8192"),
            ("output.maxChunkSize", "4096"),
            ("output.maxTimeSlice", "20"),
            ("shutdown.refusalsMaximum", " 7 "),
            ("socketId.max", "1000"),
            ("input.pendingTotalLimit", "4096"),
            ("input.pendingMaxSockets", "8"),
            ("input.retiredWindow", "16"),
        ])
        .unwrap();

        assert_eq!(config.input_buffer_size, 8192);
        assert_eq!(config.output_max_chunk_size, 4096);
        assert_eq!(config.output_max_time_slice, Duration::from_millis(20));
        assert_eq!(config.shutdown_refusals_maximum, 7);
        assert_eq!(config.max_socket_id, 1000);
        assert_eq!(config.input_pending_total_limit, 4096);
        assert_eq!(config.input_pending_max_sockets, 8);
        assert_eq!(config.input_retired_window, 16);
    }

    #[test]
    fn test_from_options_rejects_bad_input() {
        assert!(Config::from_options([("output.noSuchOption", "1")]).is_err());
        assert!(Config::from_options([("input.bufferSize", "lots")]).is_err());
        assert!(Config::from_options([("output.maxChunkSize", "4")]).is_err());
        assert!(Config::from_options([("connect.timeout", "0")]).is_err());
    }
}
