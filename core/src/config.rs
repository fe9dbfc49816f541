//! Configuration options.
//!
//! Applications embedding the core are free to define their own command
//! line arguments; the core takes a single configuration struct defining
//! output paths, buffering limits, channel sizes, and flush cadence. The
//! path to a TOML configuration file is typically a command line argument
//! passed to the application.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: RuntimeConfig = toml::from_str(&config_str).expect("Invalid config file");
    config
}

/// Loads a default configuration.
///
/// For demonstration purposes only, not configured for performance:
/// ```toml
/// out = "seine_out"
///
/// byte_channel_capacity = 64
/// flush_interval = 10_000
/// close_older_than = 300_000
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Root output directory for persisted artifacts. Defaults to
    /// `seine_out`.
    #[serde(default = "default_out")]
    pub out: PathBuf,

    /// Enables verbose per-segment tracing. Defaults to `false`.
    #[serde(default)]
    pub tcp_debug: bool,

    /// Maximum pages buffered per connection before the assembler degrades
    /// to forced delivery. `0` = unlimited. Defaults to `0`.
    #[serde(default)]
    pub max_buffered_pages_per_connection: usize,

    /// Maximum pages buffered across all connections of one assembler.
    /// `0` = unlimited. Defaults to `0`.
    #[serde(default)]
    pub max_buffered_pages_total: usize,

    /// Maximum number of connections tracked per pool. `0` = unlimited.
    /// Defaults to `100_000`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-reader byte channel buffer size, in chunks. `0` makes sends
    /// rendezvous with the reader. Defaults to `64`.
    #[serde(default = "default_byte_channel_capacity")]
    pub byte_channel_capacity: usize,

    /// Age (in milliseconds) after which a stalled queue head is
    /// force-delivered past its gap. Also the flush cadence driven by
    /// [`poll_flush`](crate::Assembler::poll_flush). Defaults to
    /// `10_000`.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    /// Quiet time (in milliseconds) before an empty half-connection is
    /// closed. Defaults to `300_000`.
    #[serde(default = "default_close_older_than")]
    pub close_older_than: u64,

    /// Rejects segments on half-connections that never saw a SYN.
    /// Defaults to `false` (mid-stream pickup allowed).
    #[serde(default)]
    pub require_init: bool,

    /// Persists the ANSI-colored conversation rendering instead of the
    /// raw bytes. Defaults to `false`.
    #[serde(default)]
    pub save_colored: bool,

    /// Additionally persists each direction's bytes under `tcpStreams/`.
    /// Defaults to `true`.
    #[serde(default = "default_save_streams")]
    pub save_streams: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            out: default_out(),
            tcp_debug: false,
            max_buffered_pages_per_connection: 0,
            max_buffered_pages_total: 0,
            max_connections: default_max_connections(),
            byte_channel_capacity: default_byte_channel_capacity(),
            flush_interval: default_flush_interval(),
            close_older_than: default_close_older_than(),
            require_init: false,
            save_colored: false,
            save_streams: default_save_streams(),
        }
    }
}

fn default_out() -> PathBuf {
    PathBuf::from("seine_out")
}

fn default_max_connections() -> usize {
    100_000
}

fn default_byte_channel_capacity() -> usize {
    64
}

fn default_flush_interval() -> u64 {
    10_000
}

fn default_close_older_than() -> u64 {
    300_000
}

fn default_save_streams() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            out = "/tmp/capture"
            max_buffered_pages_per_connection = 4000
            "#,
        )
        .unwrap();
        assert_eq!(config.out, PathBuf::from("/tmp/capture"));
        assert_eq!(config.max_buffered_pages_per_connection, 4000);
        assert_eq!(config.max_buffered_pages_total, 0);
        assert_eq!(config.byte_channel_capacity, 64);
        assert!(!config.save_colored);
        assert!(config.save_streams);
    }
}
