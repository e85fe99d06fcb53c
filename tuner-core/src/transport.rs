//! # Audio Transport Module
//!
//! Bridges a device callback thread to the processing side through two
//! circular buffers: one for capture (device → processing) and one for
//! playback (processing → device).
//!
//! ## Threads
//! - The device thread only ever sees a [`DeviceCallback`]. It copies samples
//!   in or out under a short-held lock, never allocates and never lets a
//!   panic escape.
//! - The processing thread drains capture through [`AudioTransport::read_samples`]
//!   or a [`CaptureReader`] handle.
//! - `start()`/`stop()` only flip attach flags, so they never wait on the
//!   device thread.
//!
//! A sample rate change drops unread capture, so the processing side never
//! analyses old-rate samples at the new rate.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{FALLBACK_SAMPLE_RATE, TunerConfig};
use crate::error::{Result, TunerError};
use crate::ring_buffer::CircularBuffer;

/// What a backend learned about the device while opening it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: f64,
    /// Frames per callback, when the device reports it.
    pub block_size: Option<usize>,
    pub has_input: bool,
    pub has_output: bool,
}

/// A platform audio device the transport can drive.
///
/// `open` must start delivering callbacks to the given handle (or be ready
/// to). The transport decides whether those callbacks touch the rings.
pub trait AudioBackend {
    fn open(&mut self, callback: DeviceCallback) -> Result<DeviceInfo>;

    /// Stops callbacks and releases the device. Must be safe to call twice.
    fn close(&mut self);
}

struct TransportShared {
    capture: Mutex<CircularBuffer>,
    playback: Mutex<CircularBuffer>,
    capture_attached: AtomicBool,
    playback_attached: AtomicBool,
    /// Set when the device reports it stopped; cleared when it starts again.
    device_lost: AtomicBool,
    /// `f64` bits of the device sample rate.
    sample_rate: AtomicU64,
    block_size: AtomicUsize,
}

impl TransportShared {
    fn new(block_size: usize) -> Self {
        Self {
            capture: Mutex::new(CircularBuffer::new(0)),
            playback: Mutex::new(CircularBuffer::new(0)),
            capture_attached: AtomicBool::new(false),
            playback_attached: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            sample_rate: AtomicU64::new(FALLBACK_SAMPLE_RATE.to_bits()),
            block_size: AtomicUsize::new(block_size),
        }
    }

    fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate.load(Ordering::Acquire))
    }

    fn set_sample_rate(&self, sample_rate: f64) {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return;
        }
        let previous = self.sample_rate.swap(sample_rate.to_bits(), Ordering::AcqRel);
        if previous != sample_rate.to_bits() {
            self.capture.lock().clear();
        }
    }

    fn read_capture(&self, dst: &mut [f32]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        self.capture.lock().read_into(dst)
    }

    fn write_playback(&self, src: &[f32]) -> usize {
        if src.is_empty() {
            return 0;
        }
        self.playback.lock().write_bounded(src)
    }
}

/// The device-side entry points. Cheap to clone; backends move a clone into
/// each stream callback.
#[derive(Clone)]
pub struct DeviceCallback {
    shared: Arc<TransportShared>,
}

impl DeviceCallback {
    /// Records the rate and block size the device is about to run at.
    pub fn on_device_started(&self, sample_rate: f64, block_size: Option<usize>) {
        self.shared.device_lost.store(false, Ordering::Release);
        self.shared.set_sample_rate(sample_rate);
        if let Some(frames) = block_size.filter(|&f| f > 0) {
            self.shared.block_size.store(frames, Ordering::Release);
        }
    }

    /// Detaches both directions; the device is gone until it reports a start
    /// again, and `AudioTransport::start` fails meanwhile.
    pub fn on_device_stopped(&self) {
        self.shared.device_lost.store(true, Ordering::Release);
        self.shared.capture_attached.store(false, Ordering::Release);
        self.shared.playback_attached.store(false, Ordering::Release);
    }

    /// Interleaved capture block. Channel 0 of every frame is kept.
    pub fn on_input(&self, data: &[f32], channels: usize) {
        if channels == 0 || data.is_empty() || !self.shared.capture_attached.load(Ordering::Acquire) {
            return;
        }
        // A fault here means this block is lost, nothing more.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ring = self.shared.capture.lock();
            for &sample in data.iter().step_by(channels) {
                ring.push_overwrite(sample);
            }
        }));
    }

    /// Interleaved playback block. Every channel of a frame receives the same
    /// sample; underrun and faults produce silence.
    pub fn on_output(&self, data: &mut [f32], channels: usize) {
        if channels == 0 || !self.shared.playback_attached.load(Ordering::Acquire) {
            data.fill(0.0);
            return;
        }
        let filled = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ring = self.shared.playback.lock();
            for frame in data.chunks_mut(channels) {
                frame.fill(ring.pop_or_silence());
            }
        }));
        if filled.is_err() {
            data.fill(0.0);
        }
    }

    /// Planar block as delivered by callback APIs that pass one slice per
    /// channel. `sample_rate` is the rate reported for this block.
    pub fn process_block(&self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], sample_rate: f64) {
        if sample_rate.to_bits() != self.shared.sample_rate.load(Ordering::Relaxed) {
            self.shared.set_sample_rate(sample_rate);
        }

        if let Some(first) = inputs.first() {
            self.on_input(first, 1);
        }

        let Some((first, rest)) = outputs.split_first_mut() else {
            return;
        };
        self.on_output(first, 1);
        for channel in rest.iter_mut() {
            let frames = channel.len().min(first.len());
            channel[..frames].copy_from_slice(&first[..frames]);
            channel[frames..].fill(0.0);
        }
    }
}

/// Owns the device backend and both rings for the lifetime of a session.
pub struct AudioTransport {
    backend: Box<dyn AudioBackend>,
    shared: Arc<TransportShared>,
    ring_multiple: usize,
    device: Option<DeviceInfo>,
}

impl AudioTransport {
    pub fn new(backend: Box<dyn AudioBackend>, config: &TunerConfig) -> Self {
        Self {
            backend,
            shared: Arc::new(TransportShared::new(config.nominal_block_size)),
            ring_multiple: config.ring_multiple,
            device: None,
        }
    }

    /// Opens the device and sizes both rings to `ring_multiple` device blocks.
    ///
    /// Calling this again after success is a no-op. On failure the transport
    /// stays inert: `start()` keeps failing and reads return nothing.
    pub fn initialize(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let callback = DeviceCallback { shared: Arc::clone(&self.shared) };
        let info = match self.backend.open(callback) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "audio device failed to open");
                return Err(e);
            }
        };

        self.shared.set_sample_rate(info.sample_rate);
        if let Some(frames) = info.block_size.filter(|&f| f > 0) {
            self.shared.block_size.store(frames, Ordering::Release);
        }
        let capacity = self.shared.block_size.load(Ordering::Acquire) * self.ring_multiple;
        *self.shared.capture.lock() = CircularBuffer::new(capacity);
        *self.shared.playback.lock() = CircularBuffer::new(capacity);

        info!(
            device = %info.name,
            sample_rate = info.sample_rate,
            capacity,
            output = info.has_output,
            "audio transport initialized"
        );
        self.device = Some(info);
        Ok(())
    }

    /// Attaches the rings to the live callback. Unread capture left over
    /// from a previous run is dropped on the inactive → active edge.
    ///
    /// Fails with [`TunerError::Stream`] after the device reported it stopped.
    pub fn start(&self) -> Result<()> {
        let Some(device) = &self.device else {
            return Err(TunerError::NotInitialized);
        };
        if self.shared.device_lost.load(Ordering::Acquire) {
            return Err(TunerError::Stream("audio device stopped".into()));
        }
        if device.has_input && !self.shared.capture_attached.load(Ordering::Acquire) {
            self.shared.capture.lock().clear();
            self.shared.capture_attached.store(true, Ordering::Release);
        }
        if device.has_output {
            self.shared.playback_attached.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Detaches the rings. Never waits on the device thread.
    pub fn stop(&self) {
        self.shared.capture_attached.store(false, Ordering::Release);
        self.shared.playback_attached.store(false, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.shared.capture_attached.load(Ordering::Acquire)
            || self.shared.playback_attached.load(Ordering::Acquire)
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Copies up to `dst.len()` captured samples. Returns the count.
    pub fn read_samples(&self, dst: &mut [f32]) -> usize {
        self.shared.read_capture(dst)
    }

    /// Queues samples for playback without overwriting queued audio.
    pub fn write_samples(&self, src: &[f32]) -> usize {
        self.shared.write_playback(src)
    }

    /// Device-reported sample rate, or 44100 before any device reported one.
    pub fn sample_rate(&self) -> f64 {
        self.shared.sample_rate()
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capture.lock().capacity()
    }

    /// Handle for draining capture from another thread.
    pub fn capture_reader(&self) -> CaptureReader {
        CaptureReader { shared: Arc::clone(&self.shared) }
    }

    /// Handle for queueing playback from another thread.
    pub fn playback_writer(&self) -> PlaybackWriter {
        PlaybackWriter { shared: Arc::clone(&self.shared) }
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        self.stop();
        self.backend.close();
    }
}

#[derive(Clone)]
pub struct CaptureReader {
    shared: Arc<TransportShared>,
}

impl CaptureReader {
    pub fn read_samples(&self, dst: &mut [f32]) -> usize {
        self.shared.read_capture(dst)
    }

    pub fn available(&self) -> usize {
        self.shared.capture.lock().available()
    }

    pub fn sample_rate(&self) -> f64 {
        self.shared.sample_rate()
    }
}

#[derive(Clone)]
pub struct PlaybackWriter {
    shared: Arc<TransportShared>,
}

impl PlaybackWriter {
    pub fn write_samples(&self, src: &[f32]) -> usize {
        self.shared.write_playback(src)
    }

    pub fn free(&self) -> usize {
        self.shared.playback.lock().free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Hands the callback back to the test instead of running a device.
    struct LoopbackBackend {
        slot: Rc<RefCell<Option<DeviceCallback>>>,
        info: DeviceInfo,
    }

    impl AudioBackend for LoopbackBackend {
        fn open(&mut self, callback: DeviceCallback) -> Result<DeviceInfo> {
            *self.slot.borrow_mut() = Some(callback);
            Ok(self.info.clone())
        }

        fn close(&mut self) {
            self.slot.borrow_mut().take();
        }
    }

    struct BrokenBackend;

    impl AudioBackend for BrokenBackend {
        fn open(&mut self, _callback: DeviceCallback) -> Result<DeviceInfo> {
            Err(TunerError::DeviceUnavailable("no input device".into()))
        }

        fn close(&mut self) {}
    }

    fn loopback(block_size: usize) -> (AudioTransport, Rc<RefCell<Option<DeviceCallback>>>) {
        let slot = Rc::new(RefCell::new(None));
        let backend = LoopbackBackend {
            slot: Rc::clone(&slot),
            info: DeviceInfo {
                name: "loopback".into(),
                sample_rate: 48000.0,
                block_size: Some(block_size),
                has_input: true,
                has_output: true,
            },
        };
        let config = TunerConfig { ring_multiple: 4, ..TunerConfig::default() };
        (AudioTransport::new(Box::new(backend), &config), slot)
    }

    fn callback(slot: &Rc<RefCell<Option<DeviceCallback>>>) -> DeviceCallback {
        slot.borrow().clone().unwrap()
    }

    #[test]
    fn sample_rate_falls_back_before_device_reports() {
        let (transport, _slot) = loopback(16);
        assert_eq!(transport.sample_rate(), 44100.0);
    }

    #[test]
    fn initialize_sizes_ring_from_block_size() {
        let (mut transport, _slot) = loopback(16);
        transport.initialize().unwrap();
        assert_eq!(transport.capacity(), 64);
        assert_eq!(transport.sample_rate(), 48000.0);
        transport.initialize().unwrap();
        assert_eq!(transport.capacity(), 64);
    }

    #[test]
    fn failed_initialize_leaves_transport_inert() {
        let mut transport = AudioTransport::new(Box::new(BrokenBackend), &TunerConfig::default());
        assert!(matches!(transport.initialize(), Err(TunerError::DeviceUnavailable(_))));
        assert!(!transport.is_initialized());
        assert!(matches!(transport.start(), Err(TunerError::NotInitialized)));
        assert!(!transport.is_active());
        let mut out = [0.0; 8];
        assert_eq!(transport.read_samples(&mut out), 0);
    }

    #[test]
    fn detached_capture_ignores_input() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        callback(&slot).on_input(&[1.0, 2.0, 3.0], 1);

        let mut out = [0.0; 8];
        assert_eq!(transport.read_samples(&mut out), 0);
    }

    #[test]
    fn capture_takes_first_channel_of_interleaved_input() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        callback(&slot).on_input(&[0.1, -9.0, 0.2, -9.0, 0.3, -9.0], 2);

        let mut out = [0.0; 8];
        let n = transport.read_samples(&mut out);
        assert_eq!(&out[..n], &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn playback_duplicates_to_all_channels_then_goes_silent() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        assert_eq!(transport.write_samples(&[0.5, 0.25]), 2);

        let mut out = [7.0; 6];
        callback(&slot).on_output(&mut out, 2);
        assert_eq!(out, [0.5, 0.5, 0.25, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn detached_playback_outputs_silence() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.write_samples(&[0.5; 4]);

        let mut out = [7.0; 4];
        callback(&slot).on_output(&mut out, 1);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn planar_block_reports_rate_and_copies_output_channels() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        transport.write_samples(&[0.3, 0.4]);

        let input = [0.9f32, 0.8];
        let inputs: [&[f32]; 1] = [&input];
        let mut left = [1.0f32; 3];
        let mut right = [1.0f32; 3];
        {
            let mut outputs: [&mut [f32]; 2] = [&mut left, &mut right];
            callback(&slot).process_block(&inputs, &mut outputs, 96000.0);
        }
        assert_eq!(transport.sample_rate(), 96000.0);
        assert_eq!(left, [0.3, 0.4, 0.0]);
        assert_eq!(right, left);

        let mut captured = [0.0; 4];
        let n = transport.read_samples(&mut captured);
        assert_eq!(&captured[..n], &input);
    }

    #[test]
    fn start_stop_is_idempotent() {
        let (mut transport, _slot) = loopback(16);
        transport.initialize().unwrap();

        for _ in 0..3 {
            transport.start().unwrap();
            transport.start().unwrap();
            assert!(transport.is_active());
            transport.stop();
            transport.stop();
            assert!(!transport.is_active());
        }
        transport.start().unwrap();
        assert!(transport.is_active());
    }

    #[test]
    fn restart_drops_stale_capture() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        callback(&slot).on_input(&[1.0; 10], 1);
        transport.stop();
        transport.start().unwrap();

        let mut out = [0.0; 16];
        assert_eq!(transport.read_samples(&mut out), 0);
    }

    #[test]
    fn device_stop_detaches() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        callback(&slot).on_device_stopped();
        assert!(!transport.is_active());
    }

    #[test]
    fn start_fails_while_device_is_stopped() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        callback(&slot).on_device_stopped();

        assert!(matches!(transport.start(), Err(TunerError::Stream(_))));
        assert!(!transport.is_active());

        callback(&slot).on_device_started(48000.0, None);
        transport.start().unwrap();
        assert!(transport.is_active());
    }

    #[test]
    fn rate_change_drops_unread_capture() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        let device = callback(&slot);
        device.on_input(&[1.0; 10], 1);

        // Same rate again keeps what is queued.
        device.on_device_started(48000.0, None);
        assert_eq!(transport.capture_reader().available(), 10);

        device.on_device_started(44100.0, None);
        assert_eq!(transport.capture_reader().available(), 0);
        device.on_input(&[0.5, 0.25], 1);

        let mut out = [0.0; 8];
        let n = transport.read_samples(&mut out);
        assert_eq!(&out[..n], &[0.5, 0.25]);
        assert_eq!(transport.sample_rate(), 44100.0);
    }

    #[test]
    fn reader_and_writer_handles_share_rings() {
        let (mut transport, slot) = loopback(16);
        transport.initialize().unwrap();
        transport.start().unwrap();
        let reader = transport.capture_reader();
        let writer = transport.playback_writer();

        callback(&slot).on_input(&[0.5, 0.6], 1);
        assert_eq!(reader.available(), 2);
        let mut out = [0.0; 2];
        assert_eq!(reader.read_samples(&mut out), 2);

        assert_eq!(writer.free(), 63);
        assert_eq!(writer.write_samples(&[0.0; 100]), 63);
        assert_eq!(transport.write_samples(&[1.0]), 0);
    }
}
