//! Error taxonomy for the TR Router engine.
//!
//! `ConfigError` covers the "Configuration-invalid" class: bad documents are
//! rejected at load time and never reach the running engine. `EngineError`
//! wraps both config and MIDI-port failures for the outermost boundary in
//! `main`. Runtime-bound violations (out-of-range notes, salvage failures)
//! are never surfaced as errors — they are handled locally by the sequencer
//! and silently drop the offending emission.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no output_channels defined in config")]
    NoOutputChannels,

    #[error("channel out of range for pattern {pattern:?}: {channel} (expected 1..=16)")]
    ChannelOutOfRange { pattern: String, channel: i64 },

    #[error("input_channel out of range: {0} (expected 1..=16)")]
    InputChannelOutOfRange(i64),

    #[error("pattern {0:?} has length {1} out of range (expected 1..=16)")]
    LengthOutOfRange(String, i64),
}

#[derive(thiserror::Error, Debug)]
pub enum PortError {
    #[error("failed to initialize MIDI subsystem: {0}")]
    Init(String),

    #[error("failed to open virtual MIDI port {0:?}: {1}")]
    Connect(String, String),

    #[error("failed to send MIDI message: {0}")]
    Send(String),
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("MIDI port error: {0}")]
    Port(#[from] PortError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
