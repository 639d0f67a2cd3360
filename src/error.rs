use std::time::Duration;

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

/// How a failed wire exchange should be treated once the retry budget is spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, resets, a single bad reply. Skipped for this cycle.
    Transient,
    /// Refused connects and protocol violations. Escalate if they persist.
    Escalating,
}

/// Errors from a single request/response exchange with a gateway.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect to {gateway} failed: {source}")]
    Connect {
        gateway: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("modbus exception 0x{0:02x}")]
    Exception(u8),
}

impl LinkError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LinkError::Connect { .. } | LinkError::Protocol(_) | LinkError::Exception(_) => {
                FailureKind::Escalating
            }
            LinkError::Timeout(_) | LinkError::Io(_) => FailureKind::Transient,
        }
    }

    /// Whether the socket is in an unknown state after this error.
    pub fn poisons_connection(&self) -> bool {
        !matches!(self, LinkError::Exception(_))
    }
}

/// Outcome of a retried register read that did not succeed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("gave up after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },
    #[error("persistent failure: {reason}")]
    Fatal { reason: String },
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal { .. })
    }
}

/// The one decode-time failure: a block that does not fit its model layout.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("model {model_id}: expected {expected} words, got {actual}")]
    Structural {
        model_id: u16,
        expected: String,
        actual: usize,
    },
    #[error("model {0} is not in the schema")]
    UnknownModel(u16),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no SunSpec marker at {address} (found 0x{found:08x})")]
    NotSunSpec { address: u16, found: u32 },
    #[error("expected common model at {address}, found model {found}")]
    NoCommonModel { address: u16, found: u16 },
    #[error("model chain runs past the end of the address space at {0}")]
    AddressOverflow(u16),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
