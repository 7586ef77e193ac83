use std::io::ErrorKind;
use thiserror::Error;

/// How far an error reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Log it and keep the connection
    Recoverable,
    /// Close the connection that hit it, nothing else
    Fatal,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum VncError {
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Client does not support {0}")]
    Unsupported(&'static str),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("No usable encoder: {0}")]
    EncoderUnavailable(String),
    #[error("Unknown pixel format")]
    WrongPixelFormat,
    #[error("Unknown client message {0}")]
    WrongClientMessage(u8),
    #[error("Invalid screen layout")]
    InvalidLayout,
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Operation timed out")]
    Timeout,
    #[error("Vnc Error with message: {0}")]
    Custom(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl VncError {
    pub fn severity(&self) -> Severity {
        match self {
            VncError::IoError(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => {
                    Severity::Recoverable
                }
                _ => Severity::Fatal,
            },
            _ => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// The remote side went away without saying goodbye
    pub fn is_eof(&self) -> bool {
        matches!(self, VncError::IoError(e) if e.kind() == ErrorKind::UnexpectedEof)
    }
}

impl From<tokio::time::error::Elapsed> for VncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        VncError::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_is_recoverable() {
        let e: VncError = std::io::Error::from(ErrorKind::WouldBlock).into();
        assert_eq!(e.severity(), Severity::Recoverable);
        let e: VncError = std::io::Error::from(ErrorKind::BrokenPipe).into();
        assert!(e.is_fatal());
        assert!(VncError::Protocol("bad".into()).is_fatal());
    }

    #[test]
    fn eof_is_detected() {
        let e: VncError = std::io::Error::from(ErrorKind::UnexpectedEof).into();
        assert!(e.is_eof());
        assert!(!VncError::Timeout.is_eof());
    }
}
