//! # Tuner Session
//!
//! Composition root for one tuning session: an owned [`AudioTransport`], a
//! processing worker thread that owns the [`PitchDetectionController`], and a
//! [`ResultReader`] for whoever refreshes the display.
//!
//! ## Threads
//! - Device thread: fills the capture ring (see `transport`)
//! - Processing worker: wakes every `poll_interval_ms`, drains the capture
//!   ring into the controller and follows sample rate changes. The transport
//!   drops unread capture when the rate changes, and the controller drops its
//!   partial window, so each window holds samples of a single rate.
//! - Caller: polls [`TunerSession::poll`] at its own display rate
//!
//! The session is created at start and everything is torn down when it is
//! stopped or dropped.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, info};

use crate::config::TunerConfig;
use crate::controller::{PitchDetectionController, PitchReading, ResultReader};
use crate::error::{Result, TunerError};
use crate::pitch::{PitchEstimator, build_estimator};
use crate::transport::{AudioBackend, AudioTransport, CaptureReader};
use crate::tuning::NoteReading;

/// Processing thread management, shut down through a one-slot channel.
struct ProcessingWorker {
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

pub struct TunerSession {
    transport: AudioTransport,
    results: ResultReader,
    worker: Option<ProcessingWorker>,
}

impl TunerSession {
    /// Opens the device, starts the processing worker and attaches capture.
    ///
    /// # Arguments
    /// * `backend` - Device to capture from
    /// * `config` - Validated before anything is opened
    ///
    /// # Returns
    /// * `Ok(TunerSession)` - Running session
    /// * `Err(TunerError)` - Invalid configuration or device failure
    pub fn start(backend: Box<dyn AudioBackend>, config: &TunerConfig) -> Result<Self> {
        config.validate()?;
        Self::start_with_estimator(backend, config, build_estimator(config))
    }

    pub fn start_with_estimator(
        backend: Box<dyn AudioBackend>,
        config: &TunerConfig,
        estimator: Box<dyn PitchEstimator>,
    ) -> Result<Self> {
        let mut transport = AudioTransport::new(backend, config);
        transport.initialize()?;

        let controller = PitchDetectionController::with_estimator(config, transport.sample_rate(), estimator);
        let results = controller.result_reader();
        let reader = transport.capture_reader();
        let period = Duration::from_millis(config.poll_interval_ms.max(1));
        let chunk_len = transport.capacity().max(1);

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let thread_handle = thread::Builder::new()
            .name("pitch-processing".into())
            .spawn(move || run_processing(reader, controller, shutdown_rx, period, chunk_len))
            .map_err(TunerError::Io)?;

        let session = Self {
            transport,
            results,
            worker: Some(ProcessingWorker {
                shutdown_tx,
                thread_handle: Some(thread_handle),
            }),
        };
        session.transport.start()?;
        info!(sample_rate = session.transport.sample_rate(), "tuner session started");
        Ok(session)
    }

    /// Latest accepted pitch, or `None` while there is no signal.
    pub fn latest_result(&self) -> Option<PitchReading> {
        self.results.latest_result()
    }

    /// Latest accepted pitch translated to a note, for one display tick.
    pub fn poll(&self) -> Option<NoteReading> {
        self.latest_result().map(|reading| NoteReading::from_frequency(reading.frequency))
    }

    pub fn results(&self) -> ResultReader {
        self.results.clone()
    }

    pub fn transport(&self) -> &AudioTransport {
        &self.transport
    }

    /// Detaches capture without tearing the session down.
    pub fn pause(&self) {
        self.transport.stop();
    }

    pub fn resume(&self) -> Result<()> {
        self.transport.start()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Detaches the transport and joins the processing worker. Idempotent.
    pub fn stop(&mut self) {
        self.transport.stop();
        if let Some(mut worker) = self.worker.take() {
            debug!("shutting down processing worker");
            let _ = worker.shutdown_tx.send(());
            if let Some(handle) = worker.thread_handle.take() {
                let _ = handle.join();
            }
            info!("tuner session stopped");
        }
    }
}

impl Drop for TunerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_processing(
    reader: CaptureReader,
    mut controller: PitchDetectionController,
    shutdown_rx: Receiver<()>,
    period: Duration,
    chunk_len: usize,
) {
    debug!(chunk_len, "processing worker running");
    let mut block = vec![0.0f32; chunk_len];

    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            default(period) => {
                controller.set_sample_rate(reader.sample_rate());
                loop {
                    let read = reader.read_samples(&mut block);
                    controller.process_audio(&block[..read]);
                    if read < block.len() {
                        break;
                    }
                }
            },
        }
    }

    debug!("processing worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;
    use std::time::Instant;

    use crate::simulated::{ManualDevice, SimulatedDevice, TestSignal};
    use crate::transport::{DeviceCallback, DeviceInfo};
    use crate::tuning::TuningStatus;

    fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(value) = probe() {
                return Some(value);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn sine_block(frequency: f64, sample_rate: f64, offset: usize, len: usize) -> Vec<f32> {
        (offset..offset + len)
            .map(|i| 0.5 * (TAU * frequency * i as f64 / sample_rate).sin() as f32)
            .collect()
    }

    struct UnavailableBackend;

    impl AudioBackend for UnavailableBackend {
        fn open(&mut self, _callback: DeviceCallback) -> Result<DeviceInfo> {
            Err(TunerError::DeviceUnavailable("no input device".into()))
        }

        fn close(&mut self) {}
    }

    #[test]
    fn simulated_tone_reaches_display() {
        let device = SimulatedDevice::new(44100.0, 512, TestSignal::Sine { frequency: 440.0, amplitude: 0.5 })
            .with_speed(8.0);
        let session = TunerSession::start(Box::new(device), &TunerConfig::default()).unwrap();

        let note = wait_for(Duration::from_secs(5), || session.poll()).expect("no pitch detected");
        assert_eq!(note.label(), "A4");
        assert_eq!(note.status(), TuningStatus::InTune);
    }

    #[test]
    fn manual_device_drives_detection() {
        let (device, handle) = ManualDevice::new(48000.0, 256);
        let session = TunerSession::start(Box::new(device), &TunerConfig::default()).unwrap();
        assert_eq!(session.transport().sample_rate(), 48000.0);

        let mut offset = 0;
        let note = wait_for(Duration::from_secs(5), || {
            handle.push_input(&sine_block(110.0, 48000.0, offset, 256));
            offset += 256;
            session.poll()
        })
        .expect("no pitch detected");
        assert_eq!(note.label(), "A2");
    }

    #[test]
    fn silence_never_reports_a_note() {
        let device = SimulatedDevice::new(44100.0, 512, TestSignal::Silence).with_speed(8.0);
        let session = TunerSession::start(Box::new(device), &TunerConfig::default()).unwrap();
        let reader = session.results();

        let estimated = wait_for(Duration::from_secs(5), || (reader.snapshot().sequence >= 3).then_some(()));
        assert!(estimated.is_some());
        assert_eq!(session.poll(), None);
    }

    #[test]
    fn device_failure_is_reported() {
        let result = TunerSession::start(Box::new(UnavailableBackend), &TunerConfig::default());
        assert!(matches!(result, Err(TunerError::DeviceUnavailable(_))));
    }

    #[test]
    fn invalid_config_is_rejected_before_opening() {
        let config = TunerConfig { hop_size: 0, ..TunerConfig::default() };
        let result = TunerSession::start(Box::new(UnavailableBackend), &config);
        assert!(matches!(result, Err(TunerError::Config(_))));
    }

    #[test]
    fn pause_detaches_capture_and_stop_is_idempotent() {
        let (device, handle) = ManualDevice::new(44100.0, 512);
        let mut session = TunerSession::start(Box::new(device), &TunerConfig::default()).unwrap();
        assert!(session.transport().is_active());

        session.pause();
        assert!(!session.transport().is_active());
        handle.push_input(&sine_block(440.0, 44100.0, 0, 512));
        assert_eq!(session.transport().read_samples(&mut [0.0; 512]), 0);

        session.resume().unwrap();
        assert!(session.transport().is_active());

        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert!(!session.transport().is_active());
    }
}
