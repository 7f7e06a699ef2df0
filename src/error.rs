//! Error types for modem-audio.
//!
//! All fallible operations surface a [`SoundError`]. Errors originate on the
//! modem thread and propagate synchronously to the caller; the realtime
//! callback never raises — it records overrun/underrun flags instead.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::Dir;

/// Errors surfaced by the modem-facing audio API.
#[derive(Debug, thiserror::Error)]
pub enum SoundError {
    /// The requested device was not found and no default is available, or the
    /// device has no channels in the requested direction.
    #[error("audio device unavailable: {name}")]
    DeviceUnavailable {
        /// Name of the device (or "default") that could not be used.
        name: String,
    },

    /// No sample rate satisfies the device in the requested direction.
    #[error("no usable sample rate for {dir:?} (requested {requested} Hz)")]
    UnsupportedSampleRate {
        /// Direction that failed negotiation.
        dir: Dir,
        /// The modem rate that was tried first.
        requested: u32,
    },

    /// A file format that cannot be read or written.
    #[error("unsupported file format: {format}")]
    UnsupportedFormat {
        /// Description of the rejected format.
        format: String,
    },

    /// An error reported by the underlying audio backend.
    #[error("audio backend error: {0}")]
    Backend(String),

    /// A data-path semaphore wait expired before the ring had enough
    /// data (capture) or space (playback).
    #[error("{dir:?} transfer timed out after {timeout:?}")]
    Timeout {
        /// Direction whose wait expired.
        dir: Dir,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// An operation was invoked against a stream in the wrong state.
    #[error("invalid stream state: {reason}")]
    InvalidState {
        /// What was expected and what was found.
        reason: String,
    },

    /// File tee I/O failure.
    #[error("file error: {path}: {source}")]
    File {
        /// Path of the offending file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl SoundError {
    /// Creates a backend error from any displayable backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Creates an invalid-state error with the given description.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Creates a file error for the given path.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}
