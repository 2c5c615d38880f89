pub mod control;
pub mod ntp;
pub mod packet;
pub mod rtp;

/// Sample rate every source is expected to produce. Sources resample
/// before chunking, so the sync pipeline only ever sees this rate.
pub const SAMPLE_RATE: u32 = 48_000;

/// Frames per audio chunk as produced by sources (10 ms at 48 kHz).
pub const CHUNK_FRAMES: usize = 480;

/// Frames carried by one AirPlay audio packet.
pub const FRAMES_PER_PACKET: u32 = 352;
