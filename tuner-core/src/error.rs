//! # Error Module
//!
//! Errors surfaced by the tuner core. Only device setup, configuration and
//! settings persistence can fail; signal absence and buffer over/underrun are
//! normal operating states and never show up here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunerError {
    /// No usable audio device could be opened.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device offered no stream format we can consume.
    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),

    /// `start()` was called before a successful `initialize()`.
    #[error("audio transport is not initialized")]
    NotInitialized,

    /// Building, playing or pausing a device stream failed.
    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("settings storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunerError>;
