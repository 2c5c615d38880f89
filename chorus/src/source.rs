use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use chorus_core::audio::{AudioChunk, StreamParams};

/// Chunks buffered between the producing collaborator and the sink
/// scheduler before backpressure kicks in.
const CHUNK_QUEUE: usize = 64;

/// A source stream as seen by sinks: timestamped PCM chunks anchored
/// by `started_at` on the owner peer's clock.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub id: Uuid,
    pub peer_uuid: Uuid,
    pub name: String,
    /// Instant sample zero left the source, owner peer's clock.
    pub started_at: f64,
    pub latency_ms: f64,
    pub params: StreamParams,
}

pub fn channel(info: SourceInfo) -> (SourceWriter, SourceHandle) {
    let (info_tx, info_rx) = watch::channel(info);
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);

    (
        SourceWriter { info: info_tx, chunks: chunk_tx },
        SourceHandle { info: info_rx, chunks: chunk_rx },
    )
}

/// Producing end, held by the capture/decode collaborator.
pub struct SourceWriter {
    info: watch::Sender<SourceInfo>,
    chunks: mpsc::Sender<AudioChunk>,
}

impl SourceWriter {
    /// Mutates the source description and wakes every piped sink into
    /// its resync path.
    pub fn update(&self, update: impl FnOnce(&mut SourceInfo)) {
        self.info.send_modify(update);
    }

    /// Queues one chunk without blocking; a full queue means the sink
    /// side has stalled longer than the queue covers, so the chunk is
    /// dropped and playback relies on later chunks.
    pub fn push_chunk(&self, chunk: AudioChunk) {
        match self.chunks.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                log::warn!("chunk queue full, dropping chunk {}", chunk.index);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Consuming end, handed to exactly one pipe.
pub struct SourceHandle {
    pub(crate) info: watch::Receiver<SourceInfo>,
    pub(crate) chunks: mpsc::Receiver<AudioChunk>,
}

impl SourceHandle {
    pub fn info(&self) -> SourceInfo {
        self.info.borrow().clone()
    }

    /// A watch on the source description, for sinks that track it
    /// independently of the pipe.
    pub fn info_watch(&self) -> watch::Receiver<SourceInfo> {
        self.info.clone()
    }
}
