use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use chorus_core::audio::{delay_from_local_now, AudioChunk};
use chorus_core::buffer::{AtomicMillis, SampleBuffer};
use chorus_device::output::OutputHandle;

use crate::peer::PeerHandle;
use crate::sink::{SinkError, SyncSink};
use crate::source::SourceInfo;

/// Renders a source on the local output device. Chunks land in the
/// shared circular buffer at offsets fixed by their index; the audio
/// callback (see chorus-device) follows the clock through the buffer,
/// steered by the shared delay scalar this sink maintains.
pub struct LocalSink {
    id: Uuid,
    peer: PeerHandle,
    info: watch::Receiver<SourceInfo>,
    buffer: Arc<SampleBuffer>,
    delay: Arc<AtomicMillis>,
    volume: f32,
    scratch: Vec<f32>,
    output: Option<OutputHandle>,
}

impl LocalSink {
    /// Waits for the source's peer to reach first time sync, then
    /// acquires the device and starts the callback.
    pub async fn start(
        peer: PeerHandle,
        info: watch::Receiver<SourceInfo>,
        max_latency_ms: u64,
    ) -> Result<LocalSink, SinkError> {
        peer.wait_for_first_time_sync().await.map_err(|_| SinkError::PeerGone)?;

        let params = info.borrow().params;
        let buffer = Arc::new(SampleBuffer::for_latency(
            max_latency_ms,
            params.sample_rate,
            params.channels,
        ));
        let delay = Arc::new(AtomicMillis::new(0.0));

        let mut sink = LocalSink {
            id: Uuid::new_v4(),
            peer,
            info,
            buffer: buffer.clone(),
            delay: delay.clone(),
            volume: 1.0,
            scratch: Vec::new(),
            output: None,
        };

        // position the read window before the first callback fires
        sink.resync();

        let output = chorus_device::output::open(params, buffer, delay).map_err(SinkError::Device)?;
        sink.output = Some(output);

        Ok(sink)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl SyncSink for LocalSink {
    fn write_chunk(&mut self, chunk: &AudioChunk) {
        let params = self.info.borrow().params;
        let offset = chunk.buffer_offset(&params);

        if self.volume == 1.0 {
            self.buffer.write(offset, &chunk.samples);
        } else {
            self.scratch.clear();
            self.scratch.extend(chunk.samples.iter().map(|s| s * self.volume));
            self.buffer.write(offset, &self.scratch);
        }
    }

    fn resync(&mut self) {
        let (started_at, latency_ms) = {
            let info = self.info.borrow();
            (info.started_at, info.latency_ms)
        };

        let delay = delay_from_local_now(
            self.peer.current_time(true),
            started_at,
            latency_ms,
            chorus_util::time::now(),
        );

        self.delay.store(delay);
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    fn stop(&mut self) {
        // dropping the handle stops the stream and frees the callback
        self.output.take();
    }
}
