//! Streaming error types.

use thiserror::Error;

/// Errors that can occur while streaming a print.
#[derive(Debug, Error)]
pub enum PrintError {
    /// The device closed the stream (or the read side died) while lines
    /// were still outstanding. Fatal to the current print; the engine does
    /// not reconnect.
    #[error("serial stream interrupted mid-print")]
    StreamInterrupted,

    /// Writing to the device failed.
    #[error("serial io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PrintError::StreamInterrupted;
        assert_eq!(err.to_string(), "serial stream interrupted mid-print");
    }
}
