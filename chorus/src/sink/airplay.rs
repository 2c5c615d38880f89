use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use chorus_core::audio::{delay_from_local_now, playback_frame, AudioChunk, StreamParams};
use chorus_core::buffer::{AtomicMillis, SampleBuffer};
use chorus_network::{AirplayTransport, SendError, TransportEvent};
use chorus_protocol::packet::ResendRange;

use crate::peer::PeerHandle;
use crate::sink::{SinkError, SyncSink};
use crate::source::SourceInfo;

/// Audio packets kept around for range resends.
const RESEND_WINDOW_PACKETS: usize = 512;

/// Pacer drift beyond this many packets causes a jump instead of
/// letting the send loop sprint to catch up.
const PACER_RESYNC_PACKETS: i64 = 4;

/// Seam where the payload codec plugs in. AirPlay expects ALAC frames
/// (encrypted once session keys are in play); the codec itself is
/// supplied by a collaborator, with packed PCM as the fallback.
pub trait PacketEncoder: Send {
    fn encode_packet(&mut self, samples: &[f32], out: &mut Vec<u8>);
}

/// Signed 16 bit big-endian packing.
pub struct Pcm16BeEncoder;

impl PacketEncoder for Pcm16BeEncoder {
    fn encode_packet(&mut self, samples: &[f32], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(samples.len() * 2);

        for sample in samples {
            let scaled = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            out.extend_from_slice(&scaled.to_be_bytes());
        }
    }
}

/// Renders a source to an AirPlay speaker: the pacer task walks the
/// shared buffer at packet cadence, sending audio packets and sync
/// beacons, and answers range resends from a bounded window of sent
/// packets.
pub struct AirplaySink {
    id: Uuid,
    peer: PeerHandle,
    info: watch::Receiver<SourceInfo>,
    buffer: Arc<SampleBuffer>,
    delay: Arc<AtomicMillis>,
    volume: f32,
    scratch: Vec<f32>,
    pacer: Option<JoinHandle<()>>,
}

impl AirplaySink {
    pub async fn start(
        peer: PeerHandle,
        info: watch::Receiver<SourceInfo>,
        client: SocketAddr,
        base_port: u16,
        frames_per_packet: u32,
        max_latency_ms: u64,
        encoder: Box<dyn PacketEncoder>,
    ) -> Result<AirplaySink, SinkError> {
        peer.wait_for_first_time_sync().await.map_err(|_| SinkError::PeerGone)?;

        let params = info.borrow().params;
        let buffer = Arc::new(SampleBuffer::for_latency(
            max_latency_ms,
            params.sample_rate,
            params.channels,
        ));
        let delay = Arc::new(AtomicMillis::new(0.0));

        let mut transport = AirplayTransport::bind(base_port)?;
        transport.set_client(client);
        log::info!(
            "airplay sink bound to port {}, streaming to {client}",
            transport.local_port()?
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.spawn_receiver(move |event| {
            let _ = event_tx.send(event);
        })?;

        let mut sink = AirplaySink {
            id: Uuid::new_v4(),
            peer,
            info: info.clone(),
            buffer: buffer.clone(),
            delay: delay.clone(),
            volume: 1.0,
            scratch: Vec::new(),
            pacer: None,
        };

        sink.resync();

        let pacer = Pacer {
            transport,
            buffer,
            delay,
            info,
            params,
            frames_per_packet,
            encoder,
            window: VecDeque::new(),
            next_frame: None,
            first_sync: true,
        };
        sink.pacer = Some(tokio::spawn(pacer.run(event_rx)));

        Ok(sink)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl SyncSink for AirplaySink {
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
        if let Some(pacer) = self.pacer.take() {
            pacer.abort();
        }
    }
}

struct Pacer {
    transport: AirplayTransport,
    buffer: Arc<SampleBuffer>,
    delay: Arc<AtomicMillis>,
    info: watch::Receiver<SourceInfo>,
    params: StreamParams,
    frames_per_packet: u32,
    encoder: Box<dyn PacketEncoder>,
    window: VecDeque<(u16, Vec<u8>)>,
    next_frame: Option<i64>,
    first_sync: bool,
}

impl Pacer {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let packet_period =
            Duration::from_secs_f64(f64::from(self.frames_per_packet) / f64::from(self.params.sample_rate));

        let mut packet_tick = tokio::time::interval(packet_period);
        packet_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sync_tick = tokio::time::interval(Duration::from_secs(1));
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut samples = vec![0.0f32; self.frames_per_packet as usize * self.params.channels];
        let mut payload = Vec::new();

        loop {
            tokio::select! {
                _ = packet_tick.tick() => {
                    self.send_packet(&mut samples, &mut payload);
                }

                _ = sync_tick.tick() => {
                    self.send_sync();
                }

                event = events.recv() => match event {
                    Some(TransportEvent::ResendRequested(range)) => self.resend(range),
                    None => break,
                },
            }
        }
    }

    fn target_frame(&self) -> i64 {
        playback_frame(chorus_util::time::now(), self.delay.load(), self.params.sample_rate)
    }

    fn send_packet(&mut self, samples: &mut [f32], payload: &mut Vec<u8>) {
        let target = self.target_frame();
        let frames = i64::from(self.frames_per_packet);

        let next = self.next_frame.get_or_insert(target);
        if (target - *next).abs() > frames * PACER_RESYNC_PACKETS {
            *next = target;
        }

        if *next < 0 {
            // stream has not reached sample zero yet
            *next = target.max(0);
            return;
        }

        let offset = *next as u64 * self.params.channels as u64;
        self.buffer.take(offset, samples);
        self.encoder.encode_packet(samples, payload);

        match self.transport.send_audio(*next as u32, payload, self.frames_per_packet) {
            Ok((seqnum, packet)) => {
                self.window.push_back((seqnum, packet));
                while self.window.len() > RESEND_WINDOW_PACKETS {
                    self.window.pop_front();
                }
                *next += frames;
            }
            Err(SendError::NoClient) => {}
            Err(e) => log::warn!("sending audio packet: {e}"),
        }
    }

    fn send_sync(&mut self) {
        let latency_ms = self.info.borrow().latency_ms;
        let latency_frames =
            (latency_ms * f64::from(self.params.sample_rate) / 1000.0) as u32;

        let next = self.target_frame().max(0) as u32;

        match self.transport.send_sync(next, latency_frames, self.first_sync) {
            Ok(()) => self.first_sync = false,
            Err(SendError::NoClient) => {}
            Err(e) => log::warn!("sending sync beacon: {e}"),
        }
    }

    fn resend(&self, range: ResendRange) {
        for i in 0..range.missed_count {
            let seqnum = range.missed_seq.wrapping_add(i);

            match self.window.iter().find(|(seq, _)| *seq == seqnum) {
                Some((_, packet)) => {
                    if let Err(e) = self.transport.resend(packet) {
                        log::warn!("resending packet {seqnum}: {e}");
                    }
                }
                None => log::debug!("resend requested for {seqnum}, no longer in window"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16be_packs_and_clamps() {
        let mut encoder = Pcm16BeEncoder;
        let mut out = Vec::new();

        encoder.encode_packet(&[0.0, 1.0, -2.0], &mut out);

        assert_eq!(out.len(), 6);
        assert_eq!(&out[0..2], &0i16.to_be_bytes());
        assert_eq!(&out[2..4], &i16::MAX.to_be_bytes());
        // -2.0 clamps to -1.0
        assert_eq!(&out[4..6], &(-i16::MAX).to_be_bytes());
    }
}
