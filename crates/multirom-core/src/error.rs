//! MultiROM error types

use thiserror::Error;

/// The main error type for MultiROM operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error while touching the filesystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No storage marker matched the ROM directory
    #[error("Unknown ROM type: {0}")]
    ClassificationUnknown(String),

    /// The backing data device could not be mounted; nothing else was touched
    #[error("Failed to open mount transaction: {0}")]
    TransactionOpenFailed(String),

    /// A mount configuration file could not be snapshotted
    #[error("Failed to back up mount configuration: {0}")]
    ConfigBackupFailed(String),

    /// A mount transaction is already open on this session
    #[error("Mount transaction already open for {0}")]
    TransactionActive(String),

    /// An invoked tool reported a nonzero status
    #[error("'{tool}' failed (exit code {code}){}", format_stderr(.stderr))]
    ExternalToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    /// An expected output is absent after a tool ran
    #[error("Expected artifact missing: {0}")]
    ArtifactMissing(String),

    /// Recompression with this codec is not available
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Ramdisk magic bytes did not match any known codec
    #[error("Unknown ramdisk compression (magic {0:02X?})")]
    UnknownCompression([u8; 4]),

    /// Malformed cpio, zip or tar payload
    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    /// ROM name is empty or unsafe
    #[error("Invalid ROM name: {0}")]
    InvalidName(String),

    /// Invalid installer manifest
    #[error("Invalid installer manifest: {0}")]
    InvalidManifest(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// File, ROM or package entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Generic error with custom message
    #[error("{0}")]
    Custom(String),
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

/// Result type alias for MultiROM operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a custom error from a string
    pub fn custom(msg: impl Into<String>) -> Self {
        Error::Custom(msg.into())
    }

    /// Create an artifact missing error
    pub fn artifact_missing(msg: impl Into<String>) -> Self {
        Error::ArtifactMissing(msg.into())
    }

    /// Create an invalid archive error
    pub fn invalid_archive(msg: impl Into<String>) -> Self {
        Error::InvalidArchive(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an invalid name error
    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Error::InvalidName(msg.into())
    }

    /// Create an invalid manifest error
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Error::InvalidManifest(msg.into())
    }

    /// Create an unsupported compression error
    pub fn unsupported_compression(msg: impl Into<String>) -> Self {
        Error::UnsupportedCompression(msg.into())
    }

    /// Create an external tool failure
    pub fn tool_failed(tool: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Error::ExternalToolFailed {
            tool: tool.into(),
            code,
            stderr: stderr.into(),
        }
    }
}
