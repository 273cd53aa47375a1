//! Narrow, synchronous OS primitives.
//!
//! Every operation of [`SystemOs`] reads or writes one piece of OS state and
//! fails with an [`OsError`] describing why. Implementations never retry; the
//! caller decides whether a failure is worth another attempt.

use std::io;

use chrono::{DateTime, FixedOffset};
use sysconf_core::model::{ClockState, Failure, FailureKind, PlatformState};

pub mod linux;
pub mod memory;
mod passwd;
mod service;
mod wait;

pub use linux::{LinuxOs, LinuxOsConfig};
pub use memory::{MemoryOs, OsCall, OsOperation};

#[derive(Debug, thiserror::Error)]
pub enum OsError {
    #[error("invalid hostname {0:?}")]
    InvalidName(String),
    #[error("{0}")]
    OsRejected(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    ServiceManagerUnavailable(String),
    #[error("unit {0} is not installed")]
    UnitNotFound(String),
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl OsError {
    /// Wrap an I/O error, keeping permission problems distinguishable.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => {
                OsError::PermissionDenied(format!("{}: {}", context, source))
            }
            _ => OsError::Io { context, source },
        }
    }

    pub fn failure(&self) -> Failure {
        let kind = match self {
            OsError::InvalidName(_) | OsError::OsRejected(_) | OsError::UnitNotFound(_) => {
                FailureKind::OsRejected
            }
            OsError::PermissionDenied(_) => FailureKind::PermissionDenied,
            OsError::ServiceManagerUnavailable(_) => FailureKind::ServiceManagerUnavailable,
            OsError::NotFound(_) | OsError::Io { .. } => FailureKind::Io,
        };
        Failure::new(kind, self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Restart,
    Shutdown,
}

/// The OS state sysconf manages, one primitive per piece of state.
///
/// Implementations take care of any OS-level locking; callers may read from
/// several threads while one thread writes.
pub trait SystemOs: Send + Sync {
    fn hostname(&self) -> Result<String, OsError>;
    fn set_hostname(&self, name: &str) -> Result<(), OsError>;

    /// The free-text identity (contact) field of the managed account.
    fn identity_field(&self) -> Result<String, OsError>;
    fn set_identity_field(&self, text: &str) -> Result<(), OsError>;

    /// Fails with [`OsError::NotFound`] when no marker was ever written.
    fn location_marker(&self) -> Result<String, OsError>;
    fn set_location_marker(&self, text: &str) -> Result<(), OsError>;

    fn service_active(&self, unit: &str) -> Result<bool, OsError>;
    /// Enable and start, or stop and disable, a service unit.
    fn set_service_enabled(&self, unit: &str, enabled: bool) -> Result<(), OsError>;

    fn platform(&self) -> Result<PlatformState, OsError>;
    fn clock(&self) -> Result<ClockState, OsError>;
    fn set_current_datetime(&self, datetime: DateTime<FixedOffset>) -> Result<(), OsError>;
    fn power(&self, action: PowerAction) -> Result<(), OsError>;
}
