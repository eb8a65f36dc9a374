use std::time::Duration;
use thiserror::Error;

/// Creates an anyhow error with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}

/// Creates an anyhow error with the current file and line number, and includes a source error
#[macro_export]
macro_rules! file_error_with_source {
    ($source:expr, $($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}: {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*),
            $source
        )
    };
}

/// Problems with the register table. Always fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("register table is empty")]
    Empty,

    #[error("register {index} has an empty name")]
    EmptyName { index: usize },

    #[error("register name {name} appears more than once (index {index})")]
    DuplicateName { index: usize, name: String },

    #[error("high word {name} at index {index} is not followed by a low word")]
    UnpairedHighWord { index: usize, name: String },

    #[error("low word {name} at index {index} does not follow a high word")]
    OrphanLowWord { index: usize, name: String },

    #[error("low word {low} does not match high word {high}")]
    MismatchedPair { high: String, low: String },

    #[error("register {name} has an empty state table")]
    EmptyTable { name: String },

    #[error("bitfield {name} has {rows} rows, a register holds at most 16")]
    TooManyBits { name: String, rows: usize },

    #[error("register {name} has a non-finite scale factor")]
    InvalidFactor { name: String },
}

/// A malformed station list entry. Ends the current read of the list.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: expected name,host,port but got {content:?}")]
    MissingField { line: usize, content: String },

    #[error("line {line}: invalid port {value:?}")]
    InvalidPort { line: usize, value: String },

    #[error("cannot read station list {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Wire frame validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: frame says {transmitted:02X}, payload gives {computed:02X}")]
    Checksum { transmitted: u8, computed: u8 },

    #[error("malformed frame: {0}")]
    Format(String),
}

/// A single register that could not be decoded. The rest of the record is unaffected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldDecodeError {
    #[error("{token:?} is not an integer")]
    NotAnInteger { token: String },

    #[error("state index {index} outside 0..{len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("word value {value} outside 0..=65535")]
    WordOutOfRange { value: i64 },

    #[error("negative bitfield value {value}")]
    NegativeBitfield { value: i64 },
}

/// Everything that can abort one station's poll for the current cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("no complete frame received within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before a frame was received")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl PollError {
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }
}

/// Raised by record sinks. Logged, never fatal to the poller.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sink channel closed: {0}")]
    Channel(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
