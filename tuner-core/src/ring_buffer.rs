//! # Circular Buffer Module
//!
//! Fixed-capacity sample ring shared between a device callback and the
//! processing side. The ring itself is single-threaded; the transport wraps
//! it in a short-held lock.
//!
//! Positions are kept modulo the capacity and `write == read` means empty,
//! so at most `capacity - 1` samples are unread at any time.
//!
//! Two write policies exist because the two directions want different things:
//! - capture (`push_overwrite`) keeps the freshest audio and drops the oldest
//! - playback (`push_bounded`) refuses to overwrite audio still queued for output

/// Pre-allocated ring of `f32` samples. Never grows after construction.
#[derive(Debug)]
pub struct CircularBuffer {
    samples: Box<[f32]>,
    write_position: usize,
    read_position: usize,
}

impl CircularBuffer {
    /// Creates a zeroed ring. Capacities below 2 are raised to 2 so the
    /// ring can hold at least one sample.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: vec![0.0; capacity].into_boxed_slice(),
            write_position: 0,
            read_position: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Number of unread samples.
    #[inline]
    pub fn available(&self) -> usize {
        let capacity = self.capacity();
        (self.write_position + capacity - self.read_position) % capacity
    }

    /// Number of samples that can be queued without dropping anything.
    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - 1 - self.available()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write_position == self.read_position
    }

    /// Appends one sample, discarding the oldest unread sample when full.
    #[inline]
    pub fn push_overwrite(&mut self, sample: f32) {
        let capacity = self.capacity();
        self.samples[self.write_position] = sample;
        self.write_position = (self.write_position + 1) % capacity;
        if self.write_position == self.read_position {
            self.read_position = (self.read_position + 1) % capacity;
        }
    }

    /// Appends every sample of `src` with overwrite-oldest semantics.
    pub fn write_overwrite(&mut self, src: &[f32]) {
        for &sample in src {
            self.push_overwrite(sample);
        }
    }

    /// Appends one sample unless the ring is full.
    ///
    /// # Returns
    /// * `true` - The sample was queued
    /// * `false` - The ring is full, nothing was written
    #[inline]
    pub fn push_bounded(&mut self, sample: f32) -> bool {
        let next_write = (self.write_position + 1) % self.capacity();
        if next_write == self.read_position {
            return false;
        }
        self.samples[self.write_position] = sample;
        self.write_position = next_write;
        true
    }

    /// Queues as much of `src` as fits and stops at the first sample that
    /// does not. Returns the count written.
    pub fn write_bounded(&mut self, src: &[f32]) -> usize {
        let mut written = 0;
        for &sample in src {
            if !self.push_bounded(sample) {
                break;
            }
            written += 1;
        }
        written
    }

    /// Removes the oldest unread sample.
    #[inline]
    pub fn pop(&mut self) -> Option<f32> {
        if self.is_empty() {
            return None;
        }
        let sample = self.samples[self.read_position];
        self.read_position = (self.read_position + 1) % self.capacity();
        Some(sample)
    }

    /// Copies up to `dst.len()` unread samples into `dst` in FIFO order.
    /// Returns the count copied; an underrun simply yields fewer samples.
    pub fn read_into(&mut self, dst: &mut [f32]) -> usize {
        let mut read = 0;
        while read < dst.len() {
            match self.pop() {
                Some(sample) => {
                    dst[read] = sample;
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    /// Next output sample, or silence on underrun. Never returns stale data.
    #[inline]
    pub fn pop_or_silence(&mut self) -> f32 {
        self.pop().unwrap_or(0.0)
    }

    /// Drops all unread samples.
    pub fn clear(&mut self) {
        self.read_position = self.write_position;
    }
}
