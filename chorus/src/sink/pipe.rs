use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::peer::{PeerEvent, PeerHandle, PeerState};
use crate::sink::SyncSink;
use crate::source::SourceHandle;

/// The binding record created when a source is piped to a sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipeBinding {
    pub source_id: Uuid,
    pub sink_id: Uuid,
    pub started_at: f64,
    pub latency_ms: f64,
}

/// Owns a source-to-sink binding: feeds chunks into the sink, keeps
/// its delay fresh (1 Hz tick, peer delta updates, source updates),
/// and re-emits volume changes to the sink.
pub struct Pipe {
    binding: PipeBinding,
    volume: watch::Sender<f32>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Pipe {
    pub fn spawn(source: SourceHandle, peer: PeerHandle, sink_id: Uuid, sink: Box<dyn SyncSink>) -> Pipe {
        let info = source.info();
        let binding = PipeBinding {
            source_id: info.id,
            sink_id,
            started_at: info.started_at,
            latency_ms: info.latency_ms,
        };

        let (volume_tx, volume_rx) = watch::channel(1.0f32);
        let (stop_tx, stop_rx) = oneshot::channel();

        let task = tokio::spawn(run(source, peer, sink, volume_rx, stop_rx));

        Pipe {
            binding,
            volume: volume_tx,
            stop: Some(stop_tx),
            task,
        }
    }

    pub fn binding(&self) -> &PipeBinding {
        &self.binding
    }

    pub fn set_volume(&self, volume: f32) {
        let _ = self.volume.send(volume);
    }

    /// Unpipes: detaches every listener and stops the sink.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}

async fn run(
    mut source: SourceHandle,
    peer: PeerHandle,
    mut sink: Box<dyn SyncSink>,
    mut volume: watch::Receiver<f32>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut events = peer.subscribe();

    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            chunk = source.chunks.recv() => match chunk {
                Some(chunk) => sink.write_chunk(&chunk),
                None => break,
            },

            _ = tick.tick() => sink.resync(),

            event = events.recv() => match event {
                Ok(PeerEvent::TimedeltaUpdated(_)) => sink.resync(),
                Ok(PeerEvent::StateChanged(PeerState::Deleted) | PeerEvent::Destroyed(_)) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },

            changed = source.info.changed() => match changed {
                Ok(()) => sink.resync(),
                Err(_) => break,
            },

            changed = volume.changed() => match changed {
                Ok(()) => {
                    let level = *volume.borrow();
                    sink.set_volume(level);
                }
                Err(_) => break,
            },

            _ = &mut stop => break,
        }
    }

    sink.stop();
}
