//! Connection and dispatch settings.
//!
//! [`Config`] is a plain value: build it with the `with_*` setters or load it
//! from JSON, then hand it to a client or server, which keeps it behind an
//! `Arc`. Durations are written as integer milliseconds in JSON.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use seqlink::{Config, DispatchMode};
//!
//! let config = Config::from_json(r#"{ "max_seq": 1000, "dispatch": { "mode": "ordered" } }"#)
//!     .unwrap()
//!     .with_idle_duration(Duration::from_secs(5));
//!
//! assert_eq!(config.max_seq, 1000);
//! assert_eq!(config.dispatch, DispatchMode::Ordered);
//! assert_eq!(config.write_queue_capacity, 100);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqlinkError};

/// Default socket buffer hint and read buffer capacity (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default inbound/outbound queue capacity, in packets.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default silence after which a session counts as idle.
pub const DEFAULT_IDLE_DURATION: Duration = Duration::from_secs(30);

/// Default exclusive upper bound for sequence ids.
pub const DEFAULT_MAX_SEQ: i32 = 1_000_000;

/// Default TCP connect timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum concurrent handler invocations per client.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Largest queue capacity or worker pool size tokio can represent.
pub const MAX_CAPACITY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// How inbound packets are handed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// One handler call at a time, in arrival order.
    ///
    /// The handler runs on the task that delivers responses, so a handler
    /// that awaits `sync_write` (or `request`) on its own client blocks until
    /// that call times out. Use `async_write` and return, or pick
    /// [`DispatchMode::Unordered`].
    Ordered,
    /// One task per packet, at most `max_concurrent` running at once.
    Unordered {
        /// Size of the worker pool.
        max_concurrent: usize,
    },
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Unordered {
            max_concurrent: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

/// Settings shared by every session a client or server creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SO_RCVBUF hint and read buffer capacity.
    pub read_buffer_size: usize,
    /// SO_SNDBUF hint and byte limit of one write batch.
    pub write_buffer_size: usize,
    /// Capacity of the decoded-packet queue between read loop and handler.
    pub read_queue_capacity: usize,
    /// Capacity of the outbound queue. A full queue fails writes fast.
    pub write_queue_capacity: usize,
    /// Inbound silence after which the session reports idle. Zero disables.
    #[serde(rename = "idle_duration_ms", with = "duration_ms")]
    pub idle_duration: Duration,
    /// Sequence ids are drawn from `[0, max_seq)`.
    pub max_seq: i32,
    /// Timeout for establishing a TCP connection.
    #[serde(rename = "dial_timeout_ms", with = "duration_ms")]
    pub dial_timeout: Duration,
    /// Handler dispatch policy.
    pub dispatch: DispatchMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            read_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_duration: DEFAULT_IDLE_DURATION,
            max_seq: DEFAULT_MAX_SEQ,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dispatch: DispatchMode::default(),
        }
    }
}

impl Config {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set both socket buffer hints.
    pub fn with_buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }

    /// Set both queue capacities.
    pub fn with_queue_capacities(mut self, read: usize, write: usize) -> Self {
        self.read_queue_capacity = read;
        self.write_queue_capacity = write;
        self
    }

    /// Set the idle threshold. `Duration::ZERO` disables idle detection.
    pub fn with_idle_duration(mut self, idle: Duration) -> Self {
        self.idle_duration = idle;
        self
    }

    /// Set the sequence id upper bound.
    pub fn with_max_seq(mut self, max_seq: i32) -> Self {
        self.max_seq = max_seq;
        self
    }

    /// Set the connect timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the dispatch policy.
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        fn reject(msg: &str) -> Result<()> {
            Err(SeqlinkError::InvalidConfig(msg.to_string()))
        }

        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return reject("buffer sizes must be non-zero");
        }
        if self.read_queue_capacity == 0 || self.write_queue_capacity == 0 {
            return reject("queue capacities must be non-zero");
        }
        if self.read_queue_capacity > MAX_CAPACITY || self.write_queue_capacity > MAX_CAPACITY {
            return reject("queue capacities exceed MAX_CAPACITY");
        }
        if self.max_seq <= 0 {
            return reject("max_seq must be positive");
        }
        if self.dial_timeout.is_zero() {
            return reject("dial_timeout must be non-zero");
        }
        if let DispatchMode::Unordered { max_concurrent } = self.dispatch {
            if max_concurrent == 0 {
                return reject("max_concurrent must be non-zero");
            }
            if max_concurrent > MAX_CAPACITY {
                return reject("max_concurrent exceeds MAX_CAPACITY");
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
