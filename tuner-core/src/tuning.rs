//! # Musical Tuning Module
//!
//! Equal temperament arithmetic referenced to A4 = 440 Hz (MIDI note 69).
//! Every function here is total: out-of-range MIDI numbers are clamped to
//! 0..=127 and nothing panics.
//!
//! ## Features
//! - Frequency ↔ MIDI note number conversion
//! - Pitch class names (sharps) and octave numbers
//! - Signed cent deviation from a note's exact pitch
//! - A ready-made [`NoteReading`] for display code

use once_cell::sync::Lazy;

/// Reference pitch for MIDI note 69.
pub const A4_FREQUENCY: f64 = 440.0;
pub const A4_MIDI: i32 = 69;
pub const MIDI_MIN: i32 = 0;
pub const MIDI_MAX: i32 = 127;

/// Deviation within which a note counts as in tune, in cents.
pub const IN_TUNE_THRESHOLD: f64 = 5.0;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Exact equal-tempered frequency of every MIDI note, computed once.
static MIDI_FREQUENCIES: Lazy<[f64; 128]> = Lazy::new(|| {
    let mut table = [0.0; 128];
    for (note, frequency) in table.iter_mut().enumerate() {
        *frequency = A4_FREQUENCY * 2.0_f64.powf((note as f64 - A4_MIDI as f64) / 12.0);
    }
    table
});

#[inline]
fn clamp_midi(note: i32) -> usize {
    note.clamp(MIDI_MIN, MIDI_MAX) as usize
}

/// Nearest MIDI note to `frequency`: `round(69 + 12 * log2(f / 440))`,
/// clamped to 0..=127.
///
/// Non-positive and NaN frequencies map to 0; +∞ maps to 127.
pub fn frequency_to_midi(frequency: f64) -> i32 {
    if frequency.is_nan() || frequency <= 0.0 {
        return MIDI_MIN;
    }
    let exact = A4_MIDI as f64 + 12.0 * (frequency / A4_FREQUENCY).log2();
    exact.round().clamp(MIDI_MIN as f64, MIDI_MAX as f64) as i32
}

/// Exact pitch of a MIDI note: `440 * 2^((n - 69) / 12)`.
pub fn midi_to_frequency(note: i32) -> f64 {
    MIDI_FREQUENCIES[clamp_midi(note)]
}

/// Calculates the deviation of `frequency` from `midi_note` in cents.
///
/// Cents are a logarithmic unit of pitch measurement where:
/// - 100 cents = 1 semitone
/// - 1200 cents = 1 octave
/// - Positive values indicate sharpness, negative values indicate flatness
///
/// When `midi_note == frequency_to_midi(frequency)` the result lies in about
/// [-50, +50]. A non-positive frequency has no pitch and yields NaN.
pub fn calculate_cents(frequency: f64, midi_note: i32) -> f64 {
    if !(frequency > 0.0) {
        return f64::NAN;
    }
    1200.0 * (frequency / midi_to_frequency(midi_note)).log2()
}

/// Pitch class of a MIDI note, independent of octave (e.g. 69 → "A").
pub fn midi_to_note_name(note: i32) -> &'static str {
    NOTE_NAMES[clamp_midi(note) % 12]
}

/// Octave number in scientific pitch notation (MIDI 60 = C4).
pub fn midi_to_octave(note: i32) -> i32 {
    clamp_midi(note) as i32 / 12 - 1
}

/// Whether a deviation reads as flat, in tune or sharp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningStatus {
    Flat,
    InTune,
    Sharp,
}

impl TuningStatus {
    pub fn from_cents(cents: f64) -> Self {
        if cents.abs() <= IN_TUNE_THRESHOLD {
            TuningStatus::InTune
        } else if cents < 0.0 {
            TuningStatus::Flat
        } else {
            TuningStatus::Sharp
        }
    }
}

/// Everything the display needs about one detected frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteReading {
    pub frequency: f64,
    pub midi_note: i32,
    pub name: &'static str,
    pub octave: i32,
    pub cents: f64,
    /// Exact pitch of `midi_note`.
    pub reference_frequency: f64,
}

impl NoteReading {
    pub fn from_frequency(frequency: f64) -> Self {
        let midi_note = frequency_to_midi(frequency);
        Self {
            frequency,
            midi_note,
            name: midi_to_note_name(midi_note),
            octave: midi_to_octave(midi_note),
            cents: calculate_cents(frequency, midi_note),
            reference_frequency: midi_to_frequency(midi_note),
        }
    }

    /// Note name with octave, e.g. "C#3".
    pub fn label(&self) -> String {
        format!("{}{}", self.name, self.octave)
    }

    pub fn status(&self) -> TuningStatus {
        TuningStatus::from_cents(self.cents)
    }
}

/// Formats a deviation with explicit sign and one decimal, e.g. "+3.2 cents".
pub fn format_cents(cents: f64) -> String {
    if cents.is_finite() {
        format!("{cents:+.1} cents")
    } else {
        "--".to_string()
    }
}
