// tuner-core/src/lib.rs

//! The core logic for the instrument tuner.
//! This crate is responsible for audio transport, pitch detection and
//! note/cents calculation. It is completely headless and contains no
//! display code.
//!
//! ## Data flow
//! device callback → capture ring ([`transport`]) → analysis window
//! ([`controller`]) → published result → display poll → [`tuning`]

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod fft;
pub mod permissions;
pub mod pitch;
pub mod ring_buffer;
pub mod session;
pub mod settings;
pub mod simulated;
pub mod transport;
pub mod tuning;

pub use config::{EstimatorKind, TunerConfig};
pub use controller::{ControllerState, PitchDetectionController, PitchReading, PitchResult, ResultReader};
pub use error::{Result, TunerError};
pub use session::TunerSession;
pub use transport::{AudioBackend, AudioTransport, DeviceCallback, DeviceInfo};
pub use tuning::{NoteReading, TuningStatus};
