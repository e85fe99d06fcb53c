//! # Terminal Display
//!
//! Turns the latest session result into one line of text per analysis
//! update: note, frequency, cents and a needle drawn with ASCII.

use std::collections::VecDeque;

use tuner_core::tuning::{TuningStatus, format_cents};
use tuner_core::NoteReading;

/// Number of readings averaged for the needle position.
pub const SMOOTHING_FACTOR: usize = 5;

/// Half-width of the needle scale in characters; the scale spans ±50 cents.
const METER_HALF_WIDTH: usize = 10;

/// Display-side state kept between ticks.
#[derive(Debug, Default)]
pub struct DisplayState {
    smoothing_buffer: VecDeque<f64>,
    last_note: Option<i32>,
}

impl DisplayState {
    /// Feeds one poll result and returns the line to print.
    ///
    /// The needle is smoothed over the last [`SMOOTHING_FACTOR`] readings of
    /// the same note. A note change or "no signal" starts smoothing over.
    pub fn update(&mut self, reading: Option<&NoteReading>) -> String {
        let Some(note) = reading else {
            self.smoothing_buffer.clear();
            self.last_note = None;
            return format!("{:>4}  {:>10}  {}", "--", "no signal", render_meter(None));
        };

        if self.last_note != Some(note.midi_note) {
            self.smoothing_buffer.clear();
            self.last_note = Some(note.midi_note);
        }
        self.smoothing_buffer.push_back(note.cents);
        if self.smoothing_buffer.len() > SMOOTHING_FACTOR {
            self.smoothing_buffer.pop_front();
        }
        let smoothed = self.smoothed_cents().unwrap_or(note.cents);

        format!(
            "{:>4}  {:>8.2} Hz  {:>12}  {}  {}",
            note.label(),
            note.frequency,
            format_cents(smoothed),
            render_meter(Some(smoothed)),
            status_text(TuningStatus::from_cents(smoothed)),
        )
    }

    pub fn smoothed_cents(&self) -> Option<f64> {
        if self.smoothing_buffer.is_empty() {
            return None;
        }
        Some(self.smoothing_buffer.iter().sum::<f64>() / self.smoothing_buffer.len() as f64)
    }
}

fn status_text(status: TuningStatus) -> &'static str {
    match status {
        TuningStatus::Flat => "flat",
        TuningStatus::InTune => "in tune",
        TuningStatus::Sharp => "sharp",
    }
}

/// Draws `[----------|----------]` with the needle as `*`.
pub fn render_meter(cents: Option<f64>) -> String {
    let width = 2 * METER_HALF_WIDTH + 1;
    let mut cells = vec!['-'; width];
    cells[METER_HALF_WIDTH] = '|';
    if let Some(cents) = cents.filter(|c| c.is_finite()) {
        let offset = (cents.clamp(-50.0, 50.0) / 50.0 * METER_HALF_WIDTH as f64).round() as isize;
        let index = (METER_HALF_WIDTH as isize + offset) as usize;
        cells[index] = '*';
    }
    format!("[{}]", cells.into_iter().collect::<String>())
}
