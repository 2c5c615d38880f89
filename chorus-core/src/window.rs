use heapless::{HistoryBuffer, Vec};

/// Bounded ring of recent numeric samples. Timing probes are
/// heavy-tailed under network spikes, so consumers reach for the median
/// rather than the mean.
#[derive(Default)]
pub struct SampleWindow<const N: usize> {
    samples: HistoryBuffer<f64, N>,
}

impl<const N: usize> SampleWindow<N> {
    pub fn new() -> Self {
        SampleWindow { samples: HistoryBuffer::new() }
    }

    /// Appends a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, value: f64) {
        self.samples.write(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.len() == 0
    }

    /// True once the window holds at least `count` samples.
    pub fn is_full(&self, count: usize) -> bool {
        self.samples.len() >= count
    }

    pub fn flush(&mut self) {
        self.samples = HistoryBuffer::new();
    }

    pub fn median(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }

        let mut sorted = Vec::<f64, N>::new();
        sorted.extend_from_slice(&self.samples).unwrap();
        sorted.sort_unstable_by(f64::total_cmp);

        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            Some(sorted[mid])
        } else {
            Some((sorted[mid - 1] + sorted[mid]) / 2.0)
        }
    }

    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }

        let sum: f64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as f64)
    }
}
