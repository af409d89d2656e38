// Error types for the coffer engine.
//
// Every public verb returns `Result<T>`. Errors carry a kind (the taxonomy
// callers match on) plus a stack of frames pushed as the error propagates
// outward, so a failed deep operation reports the whole call path.

use std::fmt;
use thiserror::Error;

/// Error taxonomy. Kinds are what callers match on; the message carries the
/// operation-specific detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown entry class: {0}")]
    UnknownClass(u16),

    #[error("no entry at address {0:#x}")]
    AddressNotFound(u64),

    #[error("entry already exists at address {0:#x}")]
    AlreadyExists(u64),

    #[error("invalid flag combination: {0}")]
    InvalidFlags(String),

    #[error("entry at {0:#x} is protected")]
    Protected(u64),

    #[error("size mismatch at {addr:#x}: recorded {recorded}, image length {actual}")]
    SizeMismatch { addr: u64, recorded: usize, actual: usize },

    #[error("flush dependency {parent:#x} -> {child:#x} would close a cycle")]
    DependencyCycle { parent: u64, child: u64 },

    #[error("tag check failed: {0}")]
    TagMismatch(String),

    #[error("ring {0} is settled")]
    RingSettled(&'static str),

    #[error("container is read-only")]
    ReadOnly,

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("coordinator desync: {0}")]
    CoordinatorDesync(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

/// One propagation step recorded while an error unwinds.
#[derive(Debug, Clone)]
pub struct ErrorFrame {
    pub message: String,
    pub location: &'static std::panic::Location<'static>,
}

/// The crate error: a kind plus the frames pushed on the way out.
#[derive(Debug, Clone)]
pub struct CofferError {
    kind: ErrorKind,
    frames: Vec<ErrorFrame>,
}

impl CofferError {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            frames: vec![ErrorFrame {
                message: String::new(),
                location: std::panic::Location::caller(),
            }],
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn frames(&self) -> &[ErrorFrame] {
        &self.frames
    }

    /// Push a frame describing the operation that observed the error.
    #[track_caller]
    pub fn push_frame(mut self, message: impl Into<String>) -> Self {
        self.frames.push(ErrorFrame {
            message: message.into(),
            location: std::panic::Location::caller(),
        });
        self
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::SizeMismatch { .. }
                | ErrorKind::DependencyCycle { .. }
                | ErrorKind::RingSettled(_)
                | ErrorKind::CoordinatorDesync(_)
        )
    }
}

impl fmt::Display for CofferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in self.frames.iter().rev() {
            if frame.message.is_empty() {
                write!(f, "\n    at {}:{}", frame.location.file(), frame.location.line())?;
            } else {
                write!(
                    f,
                    "\n    {} ({}:{})",
                    frame.message,
                    frame.location.file(),
                    frame.location.line()
                )?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CofferError {}

impl From<ErrorKind> for CofferError {
    #[track_caller]
    fn from(kind: ErrorKind) -> Self {
        CofferError::new(kind)
    }
}

impl From<std::io::Error> for CofferError {
    #[track_caller]
    fn from(e: std::io::Error) -> Self {
        CofferError::new(ErrorKind::Io(e.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, CofferError>;

/// Context combinator for `Result`, pushing a frame onto a propagating error.
pub trait ResultExt<T> {
    fn ctx(self, message: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    #[track_caller]
    fn ctx(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.push_frame(message))
    }
}
