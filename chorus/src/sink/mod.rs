pub mod airplay;
pub mod local;
pub mod pipe;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use chorus_core::audio::AudioChunk;

/// Cadence of the output-device availability poll.
pub const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("peer deleted before sink start")]
    PeerGone,
    #[error("opening output device: {0:?}")]
    Device(chorus_device::OpenError),
    #[error("binding airplay socket: {0}")]
    Bind(#[from] chorus_network::BindError),
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
}

/// A scheduled sink: something that renders a source's chunk stream at
/// wall-clock-aligned positions. The pipe drives these methods from
/// the control context; rendering itself happens elsewhere (audio
/// callback or pacer task).
pub trait SyncSink: Send {
    /// Places a chunk at its stream position in the shared buffer.
    fn write_chunk(&mut self, chunk: &AudioChunk);

    /// Recomputes the shared delay scalar from the owning peer's
    /// current clock estimate.
    fn resync(&mut self);

    fn set_volume(&mut self, volume: f32);

    /// Stops rendering and releases the output resources.
    fn stop(&mut self);
}

/// Polls device presence and publishes it as sink availability. Not an
/// error state, just a flag consumers watch.
pub fn spawn_availability_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(chorus_device::default_output_available());

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(AVAILABILITY_POLL_INTERVAL);
        loop {
            tick.tick().await;
            let available = chorus_device::default_output_available();
            if tx.send(available).is_err() {
                break;
            }
        }
    });

    rx
}
