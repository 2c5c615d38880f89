pub const HEADER_SIZE: usize = 4;

// RTP version 2, present in the first byte of every packet we emit.
const VERSION_BITS: u8 = 0x80;
const EXTENSION_BIT: u8 = 0x10;
const SOURCE_MASK: u8 = 0x0f;
const MARKER_BIT: u8 = 0x80;
const PAYLOAD_MASK: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    TimingRequest,
    TimingResponse,
    Sync,
    RangeResend,
    AudioData,
}

impl PayloadType {
    pub fn from_wire(value: u8) -> Option<PayloadType> {
        match value {
            0x52 => Some(PayloadType::TimingRequest),
            0x53 => Some(PayloadType::TimingResponse),
            0x54 => Some(PayloadType::Sync),
            0x55 => Some(PayloadType::RangeResend),
            0x60 => Some(PayloadType::AudioData),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PayloadType::TimingRequest => 0x52,
            PayloadType::TimingResponse => 0x53,
            PayloadType::Sync => 0x54,
            PayloadType::RangeResend => 0x55,
            PayloadType::AudioData => 0x60,
        }
    }
}

/// The 4 byte header in front of every packet on the AirPlay data and
/// control sockets. Byte 0 carries the extension bit and the 4 bit
/// source, byte 1 the marker bit and payload type, bytes 2..4 the
/// big-endian sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub extension: bool,
    pub source: u8,
    pub marker: bool,
    pub payload_type: PayloadType,
    pub seqnum: u16,
}

impl RtpHeader {
    pub fn new(payload_type: PayloadType, seqnum: u16) -> RtpHeader {
        RtpHeader {
            extension: false,
            source: 0,
            marker: false,
            payload_type,
            seqnum,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let byte0 = VERSION_BITS
            | if self.extension { EXTENSION_BIT } else { 0 }
            | (self.source & SOURCE_MASK);

        let byte1 = if self.marker { MARKER_BIT } else { 0 }
            | self.payload_type.to_wire();

        let seq = self.seqnum.to_be_bytes();
        [byte0, byte1, seq[0], seq[1]]
    }

    /// Returns None for short input or an unknown payload type, both of
    /// which the receive path drops without further ceremony.
    pub fn parse(bytes: &[u8]) -> Option<RtpHeader> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        Some(RtpHeader {
            extension: bytes[0] & EXTENSION_BIT != 0,
            source: bytes[0] & SOURCE_MASK,
            marker: bytes[1] & MARKER_BIT != 0,
            payload_type: PayloadType::from_wire(bytes[1] & PAYLOAD_MASK)?,
            seqnum: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}
