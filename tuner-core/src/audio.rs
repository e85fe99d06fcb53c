//! # Audio Device Module
//!
//! CPAL (Cross-Platform Audio Library) backend for the transport. Opens the
//! default input device and, when present, the default output device, and
//! forwards every stream callback to a [`DeviceCallback`].
//!
//! ## Features
//! - Automatic device and format selection (32-bit float only)
//! - Sample rate chosen as close as possible to the requested target
//! - Fixed callback block size when the device reports a supported range
//! - Multi-channel devices handled as interleaved frames
//! - Capture-only operation when no output device exists

use anyhow::{Context, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SupportedBufferSize, SupportedStreamConfig, SupportedStreamConfigRange};
use tracing::{info, warn};

use crate::error::{Result, TunerError};
use crate::transport::{AudioBackend, DeviceCallback, DeviceInfo};

/// Sample rate requested from the device when it supports a range.
pub const TARGET_SAMPLE_RATE: u32 = 44100;

/// Frames per callback requested when the device lets us choose.
pub const NOMINAL_BLOCK_SIZE: u32 = 512;

/// Backend driving the platform's default audio devices.
pub struct CpalBackend {
    target_sample_rate: u32,
    block_size: u32,
    enable_output: bool,
    input_stream: Option<cpal::Stream>,
    output_stream: Option<cpal::Stream>,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(TARGET_SAMPLE_RATE, true)
    }
}

impl CpalBackend {
    pub fn new(target_sample_rate: u32, enable_output: bool) -> Self {
        Self {
            target_sample_rate,
            block_size: NOMINAL_BLOCK_SIZE,
            enable_output,
            input_stream: None,
            output_stream: None,
        }
    }

    /// Requested frames per callback, clamped into whatever the device supports.
    pub fn with_block_size(mut self, frames: usize) -> Self {
        self.block_size = u32::try_from(frames).unwrap_or(u32::MAX).max(1);
        self
    }

    fn open_output(
        &self,
        host: &cpal::Host,
        sample_rate: u32,
        block_size: u32,
        callback: DeviceCallback,
    ) -> anyhow::Result<cpal::Stream> {
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No output device available"))?;
        let configs = device.supported_output_configs()?.collect::<Vec<_>>();
        let supported = find_supported_config(configs, sample_rate, 2)
            .ok_or_else(|| anyhow!("No suitable f32 output format found"))?;
        let channels = supported.channels() as usize;
        let frames = choose_block_size(supported.buffer_size(), block_size);
        let mut config: cpal::StreamConfig = supported.into();
        if let Some(frames) = frames {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback.on_output(data, channels);
            },
            |err| warn!(error = %err, "output stream error"),
            None,
        )?;
        stream.play().context("starting output stream")?;
        Ok(stream)
    }
}

impl AudioBackend for CpalBackend {
    fn open(&mut self, callback: DeviceCallback) -> Result<DeviceInfo> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| TunerError::DeviceUnavailable("no input device available".into()))?;
        let name = device.name().unwrap_or_else(|_| "unknown input".into());

        let configs = device
            .supported_input_configs()
            .map_err(|e| TunerError::DeviceUnavailable(e.to_string()))?
            .collect::<Vec<_>>();
        let supported = find_supported_config(configs, self.target_sample_rate, 1)
            .ok_or_else(|| TunerError::UnsupportedFormat("no f32 input format".into()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let block_size = choose_block_size(supported.buffer_size(), self.block_size);
        info!(device = %name, sample_rate, channels, ?block_size, "using audio input device");

        callback.on_device_started(sample_rate as f64, block_size.map(|f| f as usize));

        let mut config: cpal::StreamConfig = supported.into();
        if let Some(frames) = block_size {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }
        let input_callback = callback.clone();
        let input_stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    input_callback.on_input(data, channels);
                },
                |err| warn!(error = %err, "input stream error"),
                None,
            )
            .map_err(|e| TunerError::Stream(e.to_string()))?;
        input_stream.play().map_err(|e| TunerError::Stream(e.to_string()))?;
        self.input_stream = Some(input_stream);

        let mut has_output = false;
        if self.enable_output {
            match self.open_output(&host, sample_rate, block_size.unwrap_or(self.block_size), callback) {
                Ok(stream) => {
                    self.output_stream = Some(stream);
                    has_output = true;
                }
                Err(e) => warn!(error = %e, "continuing capture-only"),
            }
        }

        Ok(DeviceInfo {
            name,
            sample_rate: sample_rate as f64,
            block_size: block_size.map(|f| f as usize),
            has_input: true,
            has_output,
        })
    }

    fn close(&mut self) {
        for stream in [self.input_stream.take(), self.output_stream.take()].into_iter().flatten() {
            // Properly stop the stream before dropping it
            if let Err(e) = stream.pause() {
                warn!(error = %e, "error pausing stream");
            }
            drop(stream);
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Finds the best supported audio configuration for the target sample rate.
///
/// Only 32-bit float formats qualify. Among those, the configuration closest
/// to `preferred_channels` wins, then the one whose rate range lies closest to
/// `target_rate`. The returned rate is the target clamped into that range.
///
/// # Returns
/// * `Some(config)` - Best matching configuration
/// * `None` - No f32 configuration offered
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
    preferred_channels: u16,
) -> Option<SupportedStreamConfig> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32 && c.channels() > 0)
        .min_by_key(|c| {
            let channel_diff = (c.channels() as i32 - preferred_channels as i32).abs();
            let min_diff = (c.min_sample_rate().0 as i64 - target_rate as i64).abs();
            let max_diff = (c.max_sample_rate().0 as i64 - target_rate as i64).abs();
            let in_range = c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0;
            let rate_diff = if in_range { 0 } else { min_diff.min(max_diff) };
            (channel_diff, rate_diff)
        })
        .map(|c| {
            let rate = target_rate.clamp(c.min_sample_rate().0, c.max_sample_rate().0);
            c.with_sample_rate(cpal::SampleRate(rate))
        })
}

/// Frames per callback to request, or `None` when the device does not say
/// what it supports and keeps its own default.
fn choose_block_size(supported: &SupportedBufferSize, requested: u32) -> Option<u32> {
    match *supported {
        SupportedBufferSize::Range { min, max } if min <= max => Some(requested.clamp(min, max)),
        SupportedBufferSize::Range { .. } | SupportedBufferSize::Unknown => None,
    }
}
