//! Sandbox error types.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors surfaced by sandbox, instance, monitor and checkpoint operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("firmware file not found: {}", .0.display())]
    FirmwareNotFound(PathBuf),

    #[error("no sandbox found for firmware {0}")]
    SandboxNotFound(String),

    #[error("no emulation instance with marker '{base_name}' in {sandbox}")]
    InstanceNotFound { sandbox: String, base_name: String },

    #[error(
        "monitor socket {socket} not found in {sandbox}; run prepare first or ensure the firmware is running"
    )]
    MonitorNotReady { sandbox: String, socket: String },

    #[error("{operation} failed: {stderr}")]
    Transport { operation: String, stderr: String },

    #[error("{what} not ready after {}s", .waited.as_secs())]
    Timeout {
        what: String,
        waited: Duration,
        log_tail: String,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid {kind} '{value}': {reason}")]
    InvalidName {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("aborted by user")]
    Aborted,

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Not-found errors are reported to the caller but are not faults of the
    /// control plane itself.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FirmwareNotFound(_)
                | Self::SandboxNotFound(_)
                | Self::InstanceNotFound { .. }
                | Self::MonitorNotReady { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Prefix a lower-level failure with what firmbox was doing when it
/// happened, e.g. `spawn docker: No such file or directory`.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.with_context(|| context)
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| Error::Message(format!("{}: {source}", f().into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_the_source() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"));
        let err = res.context("spawn docker").unwrap_err();
        assert!(matches!(err, Error::Message(_)));
        assert_eq!(err.to_string(), "spawn docker: No such file or directory");
    }

    #[test]
    fn with_context_is_lazy_on_success() {
        let res: std::result::Result<u8, &str> = Ok(7);
        let value = res
            .with_context(|| -> String { panic!("context built on success") })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn not_found_classification() {
        assert!(Error::SandboxNotFound("fw.bin".into()).is_not_found());
        assert!(
            Error::MonitorNotReady {
                sandbox: "docker0_fw".into(),
                socket: "/tmp/qemu.1".into(),
            }
            .is_not_found()
        );
        assert!(!Error::Aborted.is_not_found());
        assert!(!Error::message("spawn docker: denied").is_not_found());
    }
}
