use chorus_protocol::{CHUNK_FRAMES, SAMPLE_RATE};

/// Stream parameters a source advertises alongside its chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: usize,
    pub chunk_frames: usize,
}

impl Default for StreamParams {
    fn default() -> Self {
        StreamParams {
            sample_rate: SAMPLE_RATE,
            channels: 2,
            chunk_frames: CHUNK_FRAMES,
        }
    }
}

impl StreamParams {
    pub fn chunk_samples(&self) -> usize {
        self.chunk_frames * self.channels
    }

    pub fn chunk_duration_millis(&self) -> f64 {
        self.chunk_frames as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// One fixed-size slice of a source stream. Produced in index order,
/// but sinks tolerate out of order arrival because the index alone
/// fixes the chunk's position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub index: u64,
    pub samples: Vec<f32>,
}

impl AudioChunk {
    /// Presentation time on the owner peer's clock.
    pub fn pts(&self, started_at: f64, params: &StreamParams) -> f64 {
        started_at + self.index as f64 * params.chunk_duration_millis()
    }

    /// Absolute logical sample offset of this chunk in the shared
    /// buffer's coordinate space.
    pub fn buffer_offset(&self, params: &StreamParams) -> u64 {
        self.index * params.chunk_samples() as u64
    }
}

/// How many milliseconds ahead of the local clock sample zero of the
/// stream sits. The audio callback multiplies this out by rate and
/// channel count to find its read offset.
pub fn delay_from_local_now(peer_now: f64, started_at: f64, latency_ms: f64, local_now: f64) -> f64 {
    peer_now - started_at - latency_ms - local_now
}

/// Frame index that should be playing at local instant `now + delay`.
pub fn playback_frame(now_millis: f64, delay_millis: f64, sample_rate: u32) -> i64 {
    ((now_millis + delay_millis) * f64::from(sample_rate) / 1000.0) as i64
}
