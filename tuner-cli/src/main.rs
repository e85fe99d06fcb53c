//! # Simple Tuner - Terminal Front End
//!
//! Runs a tuning session against the default microphone (or a simulated
//! tone) and prints the detected note once per analysis update.
//!
//! ## Architecture
//! - **Main Thread**: display refresh at `display_rate_hz`, polling the
//!   session's published result
//! - **Processing Thread**: owned by the session, runs pitch detection
//! - **Device Thread**: owned by the audio backend, fills the capture ring
//!
//! ## Usage
//! ```text
//! simple-tuner [--config tuner.json] [--settings settings.json]
//!              [--set key=value]... [--reset-settings]
//!              [--estimator yin|mcleod] [--simulate HZ] [--seconds N]
//! ```
//! Log output is controlled through `RUST_LOG` (default `info`).

mod display;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use crossbeam_channel::select;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tuner_core::audio::{CpalBackend, TARGET_SAMPLE_RATE};
use tuner_core::config::FALLBACK_SAMPLE_RATE;
use tuner_core::permissions::{DesktopPermissions, resolve_microphone_access};
use tuner_core::settings::{StorageBackend, create_config_storage};
use tuner_core::simulated::{SimulatedDevice, TestSignal};
use tuner_core::{AudioBackend, EstimatorKind, TunerConfig, TunerSession};

use display::DisplayState;

/// How long to wait for the user to answer a permission prompt.
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, PartialEq)]
struct Options {
    config_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    set: Vec<(String, f64)>,
    reset_settings: bool,
    estimator: Option<EstimatorKind>,
    simulate: Option<f64>,
    seconds: Option<f64>,
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Options::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let mut value = || args.next().ok_or_else(|| anyhow!("{arg} needs a value"));
            match arg.as_str() {
                "--config" => options.config_path = Some(PathBuf::from(value()?)),
                "--settings" => options.settings_path = Some(PathBuf::from(value()?)),
                "--set" => {
                    let pair = value()?;
                    let (key, number) = pair
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--set expects key=value, got {pair}"))?;
                    let number = number
                        .parse::<f64>()
                        .with_context(|| format!("--set {key}: not a number"))?;
                    options.set.push((key.to_string(), number));
                }
                "--reset-settings" => options.reset_settings = true,
                "--estimator" => {
                    options.estimator = Some(match value()?.as_str() {
                        "yin" => EstimatorKind::Yin,
                        "mcleod" => EstimatorKind::McLeod,
                        other => bail!("unknown estimator {other}, expected yin or mcleod"),
                    })
                }
                "--simulate" => {
                    let hz = value()?.parse::<f64>().context("--simulate expects a frequency in Hz")?;
                    options.simulate = Some(hz);
                }
                "--seconds" => {
                    let seconds = value()?.parse::<f64>().context("--seconds expects a number")?;
                    if !(seconds.is_finite() && seconds > 0.0) {
                        bail!("--seconds must be positive");
                    }
                    options.seconds = Some(seconds);
                }
                other => bail!("unknown argument {other}"),
            }
        }
        Ok(options)
    }

    fn storage_backend(&self) -> StorageBackend {
        match &self.settings_path {
            Some(path) => StorageBackend::JsonFile(path.clone()),
            None => StorageBackend::Memory,
        }
    }
}

/// Main entry point for the tuner.
///
/// Loads configuration layers, checks microphone access, starts the session
/// and refreshes the display until the optional time limit runs out.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::parse(std::env::args().skip(1))?;
    let config = load_config(&options)?;

    let backend: Box<dyn AudioBackend> = match options.simulate {
        Some(frequency) => {
            info!(frequency, "using simulated input");
            Box::new(SimulatedDevice::new(
                FALLBACK_SAMPLE_RATE,
                config.nominal_block_size,
                TestSignal::Sine { frequency, amplitude: 0.5 },
            ))
        }
        None => {
            let status = resolve_microphone_access(&DesktopPermissions, PERMISSION_TIMEOUT);
            if !status.is_granted() {
                bail!("microphone access not granted ({status:?})");
            }
            Box::new(CpalBackend::new(TARGET_SAMPLE_RATE, false).with_block_size(config.nominal_block_size))
        }
    };

    let mut session = TunerSession::start(backend, &config).context("starting tuner session")?;
    run_display(&session, config.display_rate_hz, options.seconds);
    session.stop();
    Ok(())
}

/// Defaults, then the JSON config file, then the settings store.
fn load_config(options: &Options) -> anyhow::Result<TunerConfig> {
    let mut storage = create_config_storage(options.storage_backend())?;
    if options.reset_settings {
        storage.clear()?;
        info!("stored settings cleared");
    }
    for (key, value) in &options.set {
        storage.set_double(key, *value)?;
        info!(key = %key, value, "setting stored");
    }

    let mut config = match &options.config_path {
        Some(path) => TunerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => TunerConfig::default(),
    };
    if let Some(estimator) = options.estimator {
        config.estimator = estimator;
    }

    match config.clone().apply_overrides(&*storage) {
        Ok(config) => Ok(config),
        Err(e) => {
            warn!(error = %e, "ignoring stored settings");
            config.validate()?;
            Ok(config)
        }
    }
}

/// Refreshes the display at `rate_hz`, printing a line whenever a new
/// analysis result has been published.
fn run_display(session: &TunerSession, rate_hz: u32, seconds: Option<f64>) {
    let ticker = crossbeam_channel::tick(Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64));
    let deadline = match seconds {
        Some(seconds) => crossbeam_channel::after(Duration::from_secs_f64(seconds)),
        None => crossbeam_channel::never(),
    };
    let results = session.results();
    let mut display = DisplayState::default();
    let mut last_sequence = 0;

    loop {
        select! {
            recv(deadline) -> _ => break,
            recv(ticker) -> _ => {
                let sequence = results.snapshot().sequence;
                if sequence == last_sequence {
                    continue;
                }
                last_sequence = sequence;
                println!("{}", display.update(session.poll().as_ref()));
            },
        }
    }
}
