//! Error types for the warren tunnel daemon.

use thiserror::Error;

/// Top-level error type for warren.
#[derive(Error, Debug)]
pub enum WarrenError {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer session / wire protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport and socket errors
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Tracker link errors
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Local control socket errors
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// System I/O errors
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("invalid base64/hex key: {field}")]
    InvalidKey { field: String },

    #[error("invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("unknown tracker section: {name}")]
    UnknownTracker { name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid signature")]
    InvalidSignature,

    #[error("no session keys for session {session_id}")]
    NoSessionKeys { session_id: String },

    #[error("identity file missing or malformed: {reason}")]
    IdentityFile { reason: String },
}

/// Peer session / wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("handshake timeout after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u8 },

    #[error("invalid message length: expected at least {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("duplicate OPEN for substream {id}")]
    DuplicateOpen { id: u32 },

    #[error("data for unknown substream {id}")]
    UnknownSubstream { id: u32 },

    #[error("verification failed for connection {connection}")]
    VerificationFailed { connection: String },

    #[error("session expired")]
    SessionExpired,

    #[error("no active session for {connection}")]
    NoSession { connection: String },

    #[error("message received before session established")]
    NotEstablished,
}

/// Transport / socket errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("connection refused by {endpoint}")]
    ConnectionRefused { endpoint: String },

    #[error("network unreachable: {endpoint}")]
    NetworkUnreachable { endpoint: String },

    #[error("dns resolution failed for {host}")]
    DnsResolutionFailed { host: String },

    #[error("socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("punch attempts exhausted against {endpoint}")]
    PunchFailed { endpoint: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tracker link errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("not registered with tracker {tracker}")]
    NotRegistered { tracker: String },

    #[error("no link configured for tracker {tracker}")]
    NoTracker { tracker: String },

    #[error("request {message_id} timed out")]
    Timeout { message_id: String },

    #[error("tls error: {reason}")]
    Tls { reason: String },

    #[error("master token unavailable for tracker {tracker}")]
    NoMasterToken { tracker: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local control RPC errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("socket path unusable: {path}")]
    SocketUnusable { path: String },

    #[error("malformed request frame")]
    MalformedFrame,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WarrenError {
    /// Get a user-friendly error message with suggested action.
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!("Configuration file not found: {path}\n  Check the path and try again.")
            }
            Self::Config(ConfigError::InvalidKey { field }) => {
                format!("Invalid {field} in configuration. Expected a base64/hex encoded key.")
            }
            Self::Network(NetworkError::BindFailed { addr, reason }) => {
                format!("Failed to bind {addr}: {reason}")
            }
            Self::Tracker(TrackerError::Timeout { message_id }) => {
                format!("Tracker request {message_id} timed out.")
            }
            Self::Crypto(CryptoError::IdentityFile { reason }) => {
                format!("Identity key file unreadable: {reason}")
            }
            _ => format!("{self}"),
        }
    }

    /// Whether retrying or continuing to run after this error is sensible.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Crypto(CryptoError::IdentityFile { .. }) => false,
            Self::Network(_) => true,
            Self::Tracker(_) => true,
            Self::Control(ControlError::MalformedFrame) => true,
            Self::Protocol(_) => true,
            Self::Crypto(_) => true,
            _ => false,
        }
    }

    /// Process exit code for this error when it propagates to the
    /// supervisor (i.e. it was not absorbed by the owning component).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Crypto(_) => 2,
            Self::Network(_) => 3,
            Self::Protocol(_) => 4,
            Self::Tracker(_) => 5,
            Self::Control(_) => 6,
            Self::System(_) => 7,
        }
    }
}

/// Result type alias for warren operations.
pub type Result<T> = std::result::Result<T, WarrenError>;
