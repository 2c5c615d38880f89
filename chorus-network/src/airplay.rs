use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use chorus_protocol::ntp::NtpTimestamp;
use chorus_protocol::packet::{
    build_audio, build_sync, build_timing, parse_resend, parse_timing, ResendRange, TimingStamps,
};
use chorus_protocol::rtp::{PayloadType, RtpHeader};

use crate::socket::{bind_from, BindError};

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("client port not established")]
    NoClient,
    #[error("socket: {0}")]
    Socket(#[from] io::Error),
}

/// Events the receive loop surfaces to the sink layer. Timing requests
/// are answered inline and never reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    ResendRequested(ResendRange),
}

/// RTP dialect spoken by AirPlay speakers, over one bound UDP socket:
/// audio packets and sync beacons out, timing requests answered in
/// place, range-resend requests surfaced upward.
pub struct AirplayTransport {
    socket: UdpSocket,
    client: Option<SocketAddr>,
    session_id: u32,
    streaming: bool,
    shutdown: Arc<AtomicBool>,
    // per-session payload encryption hook; the transformation itself
    // is not applied yet
    #[allow(unused)]
    aes_key: Option<[u8; 16]>,
    #[allow(unused)]
    aes_iv: Option<[u8; 16]>,
}

impl Drop for AirplayTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl AirplayTransport {
    pub fn bind(base_port: u16) -> Result<AirplayTransport, BindError> {
        let socket = bind_from(base_port)?;

        Ok(AirplayTransport {
            socket,
            client: None,
            session_id: rand::random(),
            streaming: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            aes_key: None,
            aes_iv: None,
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Records where audio and sync packets go. Nothing is sent before
    /// this is known.
    pub fn set_client(&mut self, addr: SocketAddr) {
        self.client = Some(addr);
    }

    pub fn set_session_keys(&mut self, key: [u8; 16], iv: [u8; 16]) {
        self.aes_key = Some(key);
        self.aes_iv = Some(iv);
    }

    fn require_client(&self) -> Result<SocketAddr, SendError> {
        self.client.ok_or(SendError::NoClient)
    }

    /// Sends one audio packet and returns its sequence number together
    /// with the raw bytes, which the caller keeps for resends.
    pub fn send_audio(
        &mut self,
        timestamp: u32,
        payload: &[u8],
        frames_per_packet: u32,
    ) -> Result<(u16, Vec<u8>), SendError> {
        let client = self.require_client()?;

        let is_first = !self.streaming;
        let packet = build_audio(timestamp, self.session_id, is_first, payload, frames_per_packet);

        self.socket.send_to(&packet, client)?;
        self.streaming = true;

        let header = RtpHeader::parse(&packet).expect("own packet parses");
        Ok((header.seqnum, packet))
    }

    /// Re-sends a previously built audio packet verbatim.
    pub fn resend(&self, packet: &[u8]) -> Result<(), SendError> {
        let client = self.require_client()?;
        self.socket.send_to(packet, client)?;
        Ok(())
    }

    pub fn send_sync(&self, next_timestamp: u32, latency: u32, is_first: bool) -> Result<(), SendError> {
        let client = self.require_client()?;
        let packet = build_sync(next_timestamp, latency, chorus_util::time::now(), is_first);
        self.socket.send_to(&packet, client)?;
        Ok(())
    }

    /// Spawns the blocking receive loop on its own thread. Parsed
    /// events are handed to `on_event`, which is expected to funnel
    /// them back onto the control context. The thread winds down
    /// shortly after the transport is dropped.
    pub fn spawn_receiver(
        &self,
        on_event: impl Fn(TransportEvent) + Send + 'static,
    ) -> io::Result<std::thread::JoinHandle<()>> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let shutdown = self.shutdown.clone();

        Ok(chorus_util::thread::start("chorus/airplay-rx", move || {
            receive_loop(&socket, &shutdown, on_event);
        }))
    }
}

fn receive_loop(socket: &UdpSocket, shutdown: &AtomicBool, on_event: impl Fn(TransportEvent)) {
    let mut buf = [0u8; MAX_DATAGRAM];

    while !shutdown.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                log::warn!("receiving airplay packet: {e:?}");
                continue;
            }
        };

        match handle_datagram(&buf[..len], chorus_util::time::now()) {
            DatagramAction::Reply(reply) => {
                if let Err(e) = socket.send_to(&reply, from) {
                    log::warn!("replying to timing request: {e:?}");
                }
            }
            DatagramAction::Surface(event) => on_event(event),
            DatagramAction::Ignore => {}
        }
    }
}

enum DatagramAction {
    Reply(Vec<u8>),
    Surface(TransportEvent),
    Ignore,
}

/// Classifies one inbound datagram. Malformed or unexpected packets
/// are dropped, never fatal.
fn handle_datagram(packet: &[u8], now_millis: f64) -> DatagramAction {
    let Some(header) = RtpHeader::parse(packet) else {
        log::debug!("dropping unparseable datagram ({} bytes)", packet.len());
        return DatagramAction::Ignore;
    };

    match header.payload_type {
        PayloadType::TimingRequest => match parse_timing(packet) {
            Some((request, stamps)) => {
                DatagramAction::Reply(timing_response(request, stamps, now_millis))
            }
            None => {
                log::debug!("dropping short timing request");
                DatagramAction::Ignore
            }
        },
        PayloadType::RangeResend => match parse_resend(packet) {
            Some((_, range)) => DatagramAction::Surface(TransportEvent::ResendRequested(range)),
            None => DatagramAction::Ignore,
        },
        other => {
            log::debug!("dropping unexpected {other:?} packet");
            DatagramAction::Ignore
        }
    }
}

/// Reflects a timing request: reference = the requester's send time,
/// received and send = our clock now, sequence number preserved.
fn timing_response(request: RtpHeader, stamps: TimingStamps, now_millis: f64) -> Vec<u8> {
    let header = RtpHeader {
        extension: false,
        source: 0,
        marker: true,
        payload_type: PayloadType::TimingResponse,
        seqnum: request.seqnum,
    };

    let now = NtpTimestamp::from_millis(now_millis);

    build_timing(
        header,
        TimingStamps {
            reference: NtpTimestamp::from_millis(stamps.send.to_millis()),
            received: now,
            send: now,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::packet::build_timing;

    fn timing_request(seqnum: u16, send_millis: f64) -> Vec<u8> {
        build_timing(
            RtpHeader::new(PayloadType::TimingRequest, seqnum),
            TimingStamps {
                reference: NtpTimestamp::default(),
                received: NtpTimestamp::default(),
                send: NtpTimestamp::from_millis(send_millis),
            },
        )
    }

    #[test]
    fn reflects_timing_requests() {
        let request = timing_request(41, 1_700_000_000_000.0);

        let DatagramAction::Reply(reply) = handle_datagram(&request, 5000.0) else {
            panic!("expected a timing reply");
        };

        let (header, stamps) = parse_timing(&reply).unwrap();
        assert_eq!(header.payload_type, PayloadType::TimingResponse);
        assert_eq!(header.seqnum, 41);

        assert!((stamps.reference.to_millis() - 1_700_000_000_000.0).abs() < 1.0);
        assert!((stamps.received.to_millis() - 5000.0).abs() < 1.0);
        assert!((stamps.send.to_millis() - 5000.0).abs() < 1.0);
    }

    #[test]
    fn surfaces_resend_ranges() {
        let mut packet = vec![0u8; 8];
        packet[..4].copy_from_slice(&RtpHeader::new(PayloadType::RangeResend, 1).encode());
        packet[4..6].copy_from_slice(&100u16.to_be_bytes());
        packet[6..8].copy_from_slice(&3u16.to_be_bytes());

        match handle_datagram(&packet, 0.0) {
            DatagramAction::Surface(TransportEvent::ResendRequested(range)) => {
                assert_eq!(range, ResendRange { missed_seq: 100, missed_count: 3 });
            }
            _ => panic!("expected a resend event"),
        }
    }

    #[test]
    fn drops_malformed_packets() {
        assert!(matches!(handle_datagram(&[], 0.0), DatagramAction::Ignore));
        assert!(matches!(handle_datagram(&[0x80], 0.0), DatagramAction::Ignore));
        // valid header, truncated timing body
        let short = &timing_request(1, 0.0)[..10];
        assert!(matches!(handle_datagram(short, 0.0), DatagramAction::Ignore));
    }

    #[test]
    fn refuses_to_send_without_client() {
        let mut transport = AirplayTransport::bind(40_000).unwrap();
        assert!(matches!(
            transport.send_audio(0, &[], 352),
            Err(SendError::NoClient)
        ));
        assert!(matches!(transport.send_sync(0, 0, true), Err(SendError::NoClient)));
    }

    #[test]
    fn first_audio_packet_carries_the_marker() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut transport = AirplayTransport::bind(40_100).unwrap();
        transport.set_client(receiver.local_addr().unwrap());

        let (seq_a, first) = transport.send_audio(352 * 2, &[0u8; 8], 352).unwrap();
        let (seq_b, second) = transport.send_audio(352 * 3, &[0u8; 8], 352).unwrap();

        assert_eq!(seq_a, 2);
        assert_eq!(seq_b, 3);
        assert!(RtpHeader::parse(&first).unwrap().marker);
        assert!(!RtpHeader::parse(&second).unwrap().marker);
    }
}
