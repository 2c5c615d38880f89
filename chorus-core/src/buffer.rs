use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Wraparound PCM buffer shared between the network feeder and the
/// audio callback. There are no head or tail pointers: the producer
/// writes chunks into the future at absolute logical offsets, and the
/// consumer reads strictly behind it at offsets derived from the clock.
///
/// Cells are relaxed atomics so both sides can touch the same memory
/// without locks. Tearing of an individual sample is the only hazard of
/// the shared scalar discipline, and a 32 bit atomic cell rules it out.
pub struct SampleBuffer {
    cells: Box<[AtomicU32]>,
    channels: usize,
}

impl SampleBuffer {
    /// Sizes the buffer for `max_latency_ms` worth of audio:
    /// `floor(ms * rate / 1000) * channels` cells.
    pub fn for_latency(max_latency_ms: u64, sample_rate: u32, channels: usize) -> SampleBuffer {
        let frames = (max_latency_ms * u64::from(sample_rate)) / 1000;
        SampleBuffer::with_len(frames as usize * channels, channels)
    }

    pub fn with_len(len: usize, channels: usize) -> SampleBuffer {
        assert!(len > 0 && len % channels == 0);

        let mut cells = Vec::with_capacity(len);
        cells.resize_with(len, || AtomicU32::new(0));

        SampleBuffer { cells: cells.into_boxed_slice(), channels }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Writes `samples` starting at logical offset `offset`, wrapping
    /// modulo the buffer length.
    pub fn write(&self, offset: u64, samples: &[f32]) {
        let len = self.cells.len() as u64;
        for (k, sample) in samples.iter().enumerate() {
            let index = ((offset + k as u64) % len) as usize;
            self.cells[index].store(sample.to_bits(), Ordering::Relaxed);
        }
    }

    /// Reads `out.len()` samples starting at logical offset `offset`.
    pub fn read(&self, offset: u64, out: &mut [f32]) {
        let len = self.cells.len() as u64;
        for (k, slot) in out.iter_mut().enumerate() {
            let index = ((offset + k as u64) % len) as usize;
            *slot = f32::from_bits(self.cells[index].load(Ordering::Relaxed));
        }
    }

    /// Reads like [`SampleBuffer::read`] but zeroes each cell behind
    /// itself, so a region the producer never revisits plays as
    /// silence instead of a stale lap of audio.
    pub fn take(&self, offset: u64, out: &mut [f32]) {
        let len = self.cells.len() as u64;
        for (k, slot) in out.iter_mut().enumerate() {
            let index = ((offset + k as u64) % len) as usize;
            *slot = f32::from_bits(self.cells[index].swap(0, Ordering::Relaxed));
        }
    }
}

/// One f64 of milliseconds shared across threads as a raw bit pattern.
/// Written by the control context, read by the audio callback; a single
/// 64 bit load/store keeps it tear-free.
#[derive(Default)]
pub struct AtomicMillis(AtomicU64);

impl AtomicMillis {
    pub fn new(millis: f64) -> AtomicMillis {
        AtomicMillis(AtomicU64::new(millis.to_bits()))
    }

    pub fn store(&self, millis: f64) {
        self.0.store(millis.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Linear gain shared with the write path, same discipline as
/// [`AtomicMillis`].
pub struct AtomicGain(AtomicU32);

impl Default for AtomicGain {
    fn default() -> Self {
        AtomicGain::new(1.0)
    }
}

impl AtomicGain {
    pub fn new(gain: f32) -> AtomicGain {
        AtomicGain(AtomicU32::new(gain.to_bits()))
    }

    pub fn store(&self, gain: f32) {
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_follows_latency() {
        let buffer = SampleBuffer::for_latency(100, 48_000, 2);
        assert_eq!(buffer.len(), 4800 * 2);
    }

    #[test]
    fn write_then_read_round_trips() {
        let buffer = SampleBuffer::with_len(16, 2);
        let written: Vec<f32> = (0..6).map(|i| i as f32 / 10.0).collect();
        buffer.write(4, &written);

        let mut out = vec![0.0f32; 6];
        buffer.read(4, &mut out);
        assert_eq!(out, written);
    }

    #[test]
    fn writes_wrap_modulo_length() {
        let buffer = SampleBuffer::with_len(8, 1);
        buffer.write(6, &[1.0, 2.0, 3.0, 4.0]);

        let mut out = vec![0.0f32; 4];
        buffer.read(6, &mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        // physical cells 0 and 1 hold the wrapped tail
        let mut head = vec![0.0f32; 2];
        buffer.read(8, &mut head);
        assert_eq!(head, [3.0, 4.0]);
    }

    #[test]
    fn take_clears_behind_itself() {
        let buffer = SampleBuffer::with_len(8, 1);
        buffer.write(0, &[0.5; 8]);

        let mut out = vec![0.0f32; 8];
        buffer.take(0, &mut out);
        assert_eq!(out, [0.5; 8]);

        buffer.read(0, &mut out);
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn atomic_scalars_round_trip() {
        let delay = AtomicMillis::new(0.0);
        delay.store(-123.456);
        assert_eq!(delay.load(), -123.456);

        let gain = AtomicGain::default();
        assert_eq!(gain.load(), 1.0);
        gain.store(0.25);
        assert_eq!(gain.load(), 0.25);
    }
}
