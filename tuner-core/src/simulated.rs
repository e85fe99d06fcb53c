//! # Simulated Devices
//!
//! Backends that need no audio hardware.
//!
//! - [`SimulatedDevice`] runs its own "device thread" that produces a test
//!   signal block by block at the real-time cadence of the configured rate
//!   (optionally sped up) and records everything the transport plays back.
//! - [`ManualDevice`] produces nothing by itself; the owner pushes input
//!   blocks and pulls output blocks through a [`ManualDeviceHandle`].

use std::f64::consts::TAU;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Sender, select};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Result, TunerError};
use crate::transport::{AudioBackend, DeviceCallback, DeviceInfo};

/// Upper bound on recorded playback, in seconds of audio.
const MAX_RECORDED_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestSignal {
    Silence,
    Sine { frequency: f64, amplitude: f32 },
}

/// Shared, switchable signal source for a running [`SimulatedDevice`].
#[derive(Debug, Clone)]
pub struct SignalHandle(Arc<Mutex<TestSignal>>);

impl SignalHandle {
    pub fn set(&self, signal: TestSignal) {
        *self.0.lock() = signal;
    }

    pub fn get(&self) -> TestSignal {
        *self.0.lock()
    }
}

struct DeviceWorker {
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

pub struct SimulatedDevice {
    sample_rate: f64,
    block_size: usize,
    speed: f64,
    signal: SignalHandle,
    played: Arc<Mutex<Vec<f32>>>,
    worker: Option<DeviceWorker>,
}

impl SimulatedDevice {
    /// A stereo-out, mono-in device at `sample_rate` delivering `block_size`
    /// frames per callback in real time.
    pub fn new(sample_rate: f64, block_size: usize, signal: TestSignal) -> Self {
        Self {
            sample_rate,
            block_size: block_size.max(1),
            speed: 1.0,
            signal: SignalHandle(Arc::new(Mutex::new(signal))),
            played: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }

    /// Runs the device clock `speed` times faster than real time.
    pub fn with_speed(mut self, speed: f64) -> Self {
        if speed.is_finite() && speed > 0.0 {
            self.speed = speed;
        }
        self
    }

    pub fn signal(&self) -> SignalHandle {
        self.signal.clone()
    }

    /// Handle to everything played back so far (first channel only).
    pub fn played(&self) -> Arc<Mutex<Vec<f32>>> {
        Arc::clone(&self.played)
    }

    fn block_period(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate / self.speed)
    }
}

impl AudioBackend for SimulatedDevice {
    fn open(&mut self, callback: DeviceCallback) -> Result<DeviceInfo> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(TunerError::DeviceUnavailable(format!(
                "simulated device cannot run at {} Hz",
                self.sample_rate
            )));
        }
        if self.worker.is_some() {
            return Err(TunerError::Stream("simulated device already open".into()));
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let period = self.block_period();
        let sample_rate = self.sample_rate;
        let block_size = self.block_size;
        let signal = self.signal.clone();
        let played = Arc::clone(&self.played);
        let max_recorded = (sample_rate * MAX_RECORDED_SECONDS) as usize;

        callback.on_device_started(sample_rate, Some(block_size));

        let thread_handle = thread::Builder::new()
            .name("simulated-device".into())
            .spawn(move || {
                debug!(sample_rate, block_size, "simulated device thread running");
                let mut input = vec![0.0f32; block_size];
                let mut left = vec![0.0f32; block_size];
                let mut right = vec![0.0f32; block_size];
                let mut phase = 0.0f64;

                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        default(period) => {
                            match signal.get() {
                                TestSignal::Silence => input.fill(0.0),
                                TestSignal::Sine { frequency, amplitude } => {
                                    let step = TAU * frequency / sample_rate;
                                    for sample in input.iter_mut() {
                                        *sample = amplitude * phase.sin() as f32;
                                        phase = (phase + step) % TAU;
                                    }
                                }
                            }

                            {
                                let inputs: [&[f32]; 1] = [&input];
                                let mut outputs: [&mut [f32]; 2] = [&mut left, &mut right];
                                callback.process_block(&inputs, &mut outputs, sample_rate);
                            }

                            let mut recorded = played.lock();
                            if recorded.len() < max_recorded {
                                let room = (max_recorded - recorded.len()).min(left.len());
                                recorded.extend_from_slice(&left[..room]);
                            }
                        },
                    }
                }

                callback.on_device_stopped();
                debug!("simulated device thread finished");
            })
            .map_err(TunerError::Io)?;

        self.worker = Some(DeviceWorker {
            shutdown_tx,
            thread_handle: Some(thread_handle),
        });

        info!(sample_rate, block_size, speed = self.speed, "simulated device opened");
        Ok(DeviceInfo {
            name: "simulated".into(),
            sample_rate,
            block_size: Some(block_size),
            has_input: true,
            has_output: true,
        })
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let _ = worker.shutdown_tx.send(());
            if let Some(handle) = worker.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Device driven entirely by its owner.
pub struct ManualDevice {
    sample_rate: f64,
    block_size: usize,
    handle: ManualDeviceHandle,
}

/// Owner side of a [`ManualDevice`]; valid once the transport opened it.
#[derive(Clone, Default)]
pub struct ManualDeviceHandle(Arc<Mutex<Option<DeviceCallback>>>);

impl ManualDevice {
    pub fn new(sample_rate: f64, block_size: usize) -> (Self, ManualDeviceHandle) {
        let handle = ManualDeviceHandle::default();
        let device = Self {
            sample_rate,
            block_size,
            handle: handle.clone(),
        };
        (device, handle)
    }
}

impl AudioBackend for ManualDevice {
    fn open(&mut self, callback: DeviceCallback) -> Result<DeviceInfo> {
        callback.on_device_started(self.sample_rate, Some(self.block_size));
        *self.handle.0.lock() = Some(callback);
        Ok(DeviceInfo {
            name: "manual".into(),
            sample_rate: self.sample_rate,
            block_size: Some(self.block_size),
            has_input: true,
            has_output: true,
        })
    }

    fn close(&mut self) {
        if let Some(callback) = self.handle.0.lock().take() {
            callback.on_device_stopped();
        }
    }
}

impl ManualDeviceHandle {
    /// Delivers one mono capture block. Returns false when the device is not open.
    pub fn push_input(&self, block: &[f32]) -> bool {
        match self.0.lock().as_ref() {
            Some(callback) => {
                callback.on_input(block, 1);
                true
            }
            None => false,
        }
    }

    /// Requests `frames` mono playback samples, as a device callback would.
    pub fn pull_output(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        if let Some(callback) = self.0.lock().as_ref() {
            callback.on_output(&mut out, 1);
        }
        out
    }

    /// Reports a new device sample rate, as on a device restart.
    pub fn restart_at(&self, sample_rate: f64) {
        if let Some(callback) = self.0.lock().as_ref() {
            callback.on_device_started(sample_rate, None);
        }
    }
}
