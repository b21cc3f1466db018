//! Error taxonomy shared by the core components.
//!
//! Internals return `anyhow::Result`. Faults that callers need to tell apart
//! are raised as [`GuardError`] so the kind survives the trip through
//! `anyhow` and can be recovered with [`GuardError::kind_of`].

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Elevated rights absent for a mutating device operation.
    Privilege,
    /// Capture device could not be opened or read.
    DeviceUnavailable,
    /// Store read or write failed.
    Persistence,
    /// A collaborator was used before being configured.
    Configuration,
    /// Duplicate username, weak password, malformed encoding.
    Validation,
    /// Capture requested while another capture holds the guard.
    ConcurrencyBusy,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Privilege => "PRIVILEGE_REQUIRED",
            ErrorKind::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            ErrorKind::Persistence => "PERSISTENCE_FAILURE",
            ErrorKind::Configuration => "NOT_CONFIGURED",
            ErrorKind::Validation => "VALIDATION_FAILED",
            ErrorKind::ConcurrencyBusy => "CAPTURE_BUSY",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GuardError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GuardError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn privilege(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Privilege, message)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceUnavailable, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Returns the kind of the first `GuardError` found in the error chain.
    pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<GuardError>())
            .map(|guard| guard.kind)
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for GuardError {}
