/// 8 byte fixed-point time representation used by the AirPlay timing
/// exchange: big-endian integer seconds, then big-endian fractional
/// seconds with denominator 2^32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

pub const NTP_SIZE: usize = 8;

const FRACTION_UNIT: f64 = 4294967296.0; // 2^32

impl NtpTimestamp {
    /// Converts from milliseconds. Negative inputs clamp to zero,
    /// values past the representable range saturate.
    pub fn from_millis(millis: f64) -> NtpTimestamp {
        let millis = millis.max(0.0);

        let mut seconds = (millis / 1000.0).floor() as u64;
        let frac_millis = millis - (seconds as f64) * 1000.0;
        let mut fraction = ((frac_millis / 1000.0) * FRACTION_UNIT).round() as u64;

        // rounding can push the fraction to a whole second
        if fraction >= 1 << 32 {
            seconds += 1;
            fraction = 0;
        }

        if seconds > u64::from(u32::MAX) {
            return NtpTimestamp { seconds: u32::MAX, fraction: u32::MAX };
        }

        NtpTimestamp {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    pub fn to_millis(self) -> f64 {
        let seconds = f64::from(self.seconds);
        let fraction = f64::from(self.fraction) / FRACTION_UNIT;
        (seconds + fraction) * 1000.0
    }

    pub fn write(self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        out[4..8].copy_from_slice(&self.fraction.to_be_bytes());
    }

    pub fn parse(bytes: &[u8]) -> Option<NtpTimestamp> {
        if bytes.len() < NTP_SIZE {
            return None;
        }

        Some(NtpTimestamp {
            seconds: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            fraction: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        })
    }
}
