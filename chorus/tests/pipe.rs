use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use chorus::peer::manager::PeerManager;
use chorus::sink::pipe::Pipe;
use chorus::sink::SyncSink;
use chorus::source::{self, SourceInfo};
use chorus_core::audio::{AudioChunk, StreamParams};
use chorus_protocol::control::PeerDescriptor;

#[derive(Debug, Clone, PartialEq)]
enum SinkCall {
    Chunk(u64),
    Resync,
    Volume(f32),
    Stopped,
}

#[derive(Clone, Default)]
struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl SyncSink for RecordingSink {
    fn write_chunk(&mut self, chunk: &AudioChunk) {
        self.calls.lock().unwrap().push(SinkCall::Chunk(chunk.index));
    }

    fn resync(&mut self) {
        self.calls.lock().unwrap().push(SinkCall::Resync);
    }

    fn set_volume(&mut self, volume: f32) {
        self.calls.lock().unwrap().push(SinkCall::Volume(volume));
    }

    fn stop(&mut self) {
        self.calls.lock().unwrap().push(SinkCall::Stopped);
    }
}

fn descriptor(name: &str) -> PeerDescriptor {
    PeerDescriptor {
        uuid: Uuid::new_v4(),
        instance_uuid: Uuid::new_v4(),
        name: name.to_string(),
        version: "0.1.0".to_string(),
        capacities: vec![],
    }
}

fn source_info(peer_uuid: Uuid) -> SourceInfo {
    SourceInfo {
        id: Uuid::new_v4(),
        peer_uuid,
        name: "deck".to_string(),
        started_at: 100.0,
        latency_ms: 50.0,
        params: StreamParams::default(),
    }
}

async fn wait_until(sink: &RecordingSink, pred: impl Fn(&[SinkCall]) -> bool) {
    for _ in 0..200 {
        if pred(&sink.calls()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached, calls: {:?}", sink.calls());
}

#[tokio::test(start_paused = true)]
async fn pipe_feeds_resyncs_and_stops() {
    let manager = PeerManager::new(descriptor("local"), Duration::from_secs(30));
    let peer = manager.local().clone();

    let info = source_info(peer.uuid().unwrap());
    let source_id = info.id;
    let (writer, handle) = source::channel(info);

    let sink = RecordingSink::default();
    let sink_id = Uuid::new_v4();
    let pipe = Pipe::spawn(handle, peer, sink_id, Box::new(sink.clone()));

    assert_eq!(pipe.binding().source_id, source_id);
    assert_eq!(pipe.binding().sink_id, sink_id);
    assert_eq!(pipe.binding().started_at, 100.0);
    assert_eq!(pipe.binding().latency_ms, 50.0);

    // chunks are forwarded in order
    writer.push_chunk(AudioChunk { index: 0, samples: vec![0.0; 4] });
    writer.push_chunk(AudioChunk { index: 1, samples: vec![0.0; 4] });
    wait_until(&sink, |calls| {
        calls.contains(&SinkCall::Chunk(0)) && calls.contains(&SinkCall::Chunk(1))
    })
    .await;

    // the periodic tick keeps the delay fresh
    wait_until(&sink, |calls| calls.iter().any(|c| *c == SinkCall::Resync)).await;

    // a source update forces a resync
    let resyncs_before = sink.calls().iter().filter(|c| **c == SinkCall::Resync).count();
    writer.update(|info| info.latency_ms = 80.0);
    wait_until(&sink, |calls| {
        calls.iter().filter(|c| **c == SinkCall::Resync).count() > resyncs_before
    })
    .await;

    // volume changes are re-emitted to the sink
    pipe.set_volume(0.5);
    wait_until(&sink, |calls| calls.contains(&SinkCall::Volume(0.5))).await;

    pipe.stop().await;
    assert!(sink.calls().contains(&SinkCall::Stopped));
}

#[tokio::test(start_paused = true)]
async fn pipe_stops_when_the_source_ends() {
    let manager = PeerManager::new(descriptor("local"), Duration::from_secs(30));
    let peer = manager.local().clone();

    let (writer, handle) = source::channel(source_info(peer.uuid().unwrap()));

    let sink = RecordingSink::default();
    let pipe = Pipe::spawn(handle, peer, Uuid::new_v4(), Box::new(sink.clone()));

    drop(writer);

    wait_until(&sink, |calls| calls.contains(&SinkCall::Stopped)).await;
    pipe.stop().await;
}