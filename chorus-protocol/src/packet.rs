use crate::ntp::{NtpTimestamp, NTP_SIZE};
use crate::rtp::{PayloadType, RtpHeader, HEADER_SIZE};

pub const TIMING_PACKET_SIZE: usize = HEADER_SIZE + 3 * NTP_SIZE;
pub const SYNC_PACKET_SIZE: usize = HEADER_SIZE + 4 + NTP_SIZE + 4;
pub const AUDIO_HEADER_SIZE: usize = HEADER_SIZE + 8;
pub const RESEND_PACKET_SIZE: usize = HEADER_SIZE + 4;

// the sync beacon always carries this sequence number
pub const SYNC_SEQNUM: u16 = 7;

/// The three timestamp slots of a timing packet, in order of
/// appearance on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingStamps {
    pub reference: NtpTimestamp,
    pub received: NtpTimestamp,
    pub send: NtpTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRange {
    pub missed_seq: u16,
    pub missed_count: u16,
}

pub fn build_timing(header: RtpHeader, stamps: TimingStamps) -> Vec<u8> {
    let mut packet = vec![0u8; TIMING_PACKET_SIZE];
    packet[..HEADER_SIZE].copy_from_slice(&header.encode());
    stamps.reference.write(&mut packet[HEADER_SIZE..]);
    stamps.received.write(&mut packet[HEADER_SIZE + NTP_SIZE..]);
    stamps.send.write(&mut packet[HEADER_SIZE + 2 * NTP_SIZE..]);
    packet
}

pub fn parse_timing(packet: &[u8]) -> Option<(RtpHeader, TimingStamps)> {
    let header = RtpHeader::parse(packet)?;

    match header.payload_type {
        PayloadType::TimingRequest | PayloadType::TimingResponse => {}
        _ => return None,
    }

    if packet.len() < TIMING_PACKET_SIZE {
        return None;
    }

    let stamps = TimingStamps {
        reference: NtpTimestamp::parse(&packet[HEADER_SIZE..])?,
        received: NtpTimestamp::parse(&packet[HEADER_SIZE + NTP_SIZE..])?,
        send: NtpTimestamp::parse(&packet[HEADER_SIZE + 2 * NTP_SIZE..])?,
    };

    Some((header, stamps))
}

/// Sync beacon: tells the sink which RTP timestamp is about to play and
/// what the sender's clock reads. `is_first` rides in the extension bit
/// so sinks can reset their anchor on stream start.
pub fn build_sync(next_timestamp: u32, latency: u32, now_millis: f64, is_first: bool) -> Vec<u8> {
    let header = RtpHeader {
        extension: is_first,
        source: 0,
        marker: true,
        payload_type: PayloadType::Sync,
        seqnum: SYNC_SEQNUM,
    };

    let mut packet = vec![0u8; SYNC_PACKET_SIZE];
    packet[..HEADER_SIZE].copy_from_slice(&header.encode());
    packet[4..8].copy_from_slice(&next_timestamp.wrapping_sub(latency).to_be_bytes());
    NtpTimestamp::from_millis(now_millis.max(0.0)).write(&mut packet[8..16]);
    packet[16..20].copy_from_slice(&next_timestamp.to_be_bytes());
    packet
}

/// Audio data packet. The sequence number is derived from the RTP
/// timestamp so resend bookkeeping needs no extra state. The marker
/// bit is raised on the first packet of a stream.
pub fn build_audio(
    timestamp: u32,
    session_id: u32,
    is_first: bool,
    payload: &[u8],
    frames_per_packet: u32,
) -> Vec<u8> {
    let header = RtpHeader {
        extension: false,
        source: 0,
        marker: is_first,
        payload_type: PayloadType::AudioData,
        seqnum: audio_seqnum(timestamp, frames_per_packet),
    };

    let mut packet = vec![0u8; AUDIO_HEADER_SIZE + payload.len()];
    packet[..HEADER_SIZE].copy_from_slice(&header.encode());
    packet[4..8].copy_from_slice(&timestamp.to_be_bytes());
    packet[8..12].copy_from_slice(&session_id.to_be_bytes());
    packet[AUDIO_HEADER_SIZE..].copy_from_slice(payload);
    packet
}

pub fn audio_seqnum(timestamp: u32, frames_per_packet: u32) -> u16 {
    (timestamp / frames_per_packet) as u16
}

pub fn parse_resend(packet: &[u8]) -> Option<(RtpHeader, ResendRange)> {
    let header = RtpHeader::parse(packet)?;

    if header.payload_type != PayloadType::RangeResend {
        return None;
    }

    if packet.len() < RESEND_PACKET_SIZE {
        return None;
    }

    let range = ResendRange {
        missed_seq: u16::from_be_bytes([packet[4], packet[5]]),
        missed_count: u16::from_be_bytes([packet[6], packet[7]]),
    };

    Some((header, range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_round_trip() {
        let header = RtpHeader::new(PayloadType::TimingRequest, 41);
        let stamps = TimingStamps {
            reference: NtpTimestamp { seconds: 1, fraction: 2 },
            received: NtpTimestamp { seconds: 3, fraction: 4 },
            send: NtpTimestamp::from_millis(1_700_000_000_000.0),
        };

        let packet = build_timing(header, stamps);
        assert_eq!(packet.len(), TIMING_PACKET_SIZE);
        assert_eq!(parse_timing(&packet), Some((header, stamps)));
    }

    #[test]
    fn timing_rejects_truncated_packet() {
        let packet = build_timing(RtpHeader::new(PayloadType::TimingRequest, 0), TimingStamps::default());
        assert_eq!(parse_timing(&packet[..TIMING_PACKET_SIZE - 1]), None);
    }

    #[test]
    fn sync_layout() {
        let packet = build_sync(44100, 11025, 2500.0, true);

        let header = RtpHeader::parse(&packet).unwrap();
        assert_eq!(header.payload_type, PayloadType::Sync);
        assert_eq!(header.seqnum, SYNC_SEQNUM);
        assert!(header.marker);
        assert!(header.extension);

        assert_eq!(u32::from_be_bytes(packet[4..8].try_into().unwrap()), 44100 - 11025);
        assert_eq!(NtpTimestamp::parse(&packet[8..16]).unwrap().to_millis().round(), 2500.0);
        assert_eq!(u32::from_be_bytes(packet[16..20].try_into().unwrap()), 44100);
    }

    #[test]
    fn audio_header_bytes() {
        let first = build_audio(352 * 3, 0xdeadbeef, true, &[1, 2, 3], 352);
        assert_eq!(first[0], 0x80);
        assert_eq!(first[1], 0xe0);
        assert_eq!(u16::from_be_bytes([first[2], first[3]]), 3);
        assert_eq!(u32::from_be_bytes(first[4..8].try_into().unwrap()), 352 * 3);
        assert_eq!(u32::from_be_bytes(first[8..12].try_into().unwrap()), 0xdeadbeef);
        assert_eq!(&first[12..], &[1, 2, 3]);

        let later = build_audio(352 * 4, 0xdeadbeef, false, &[], 352);
        assert_eq!(later[1], 0x60);
    }

    #[test]
    fn resend_round_trip() {
        let header = RtpHeader::new(PayloadType::RangeResend, 9);
        let mut packet = vec![0u8; RESEND_PACKET_SIZE];
        packet[..4].copy_from_slice(&header.encode());
        packet[4..6].copy_from_slice(&513u16.to_be_bytes());
        packet[6..8].copy_from_slice(&4u16.to_be_bytes());

        let (parsed, range) = parse_resend(&packet).unwrap();
        assert_eq!(parsed.seqnum, 9);
        assert_eq!(range, ResendRange { missed_seq: 513, missed_count: 4 });
    }
}
