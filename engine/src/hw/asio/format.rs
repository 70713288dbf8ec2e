use serde::{Deserialize, Serialize};

pub const POSSIBLE_RATES: [f64; 16] = [
    8_000.0, 10_000.0, 11_025.0, 12_000.0, 16_000.0, 20_000.0, 22_050.0, 24_000.0, 30_000.0,
    32_000.0, 40_000.0, 44_100.0, 48_000.0, 88_200.0, 96_000.0, 192_000.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Int16Msb,
    Int24Msb,
    Int32Msb,
    Float32Msb,
    Float64Msb,
    Int32Msb16,
    Int32Msb18,
    Int32Msb20,
    Int32Msb24,
    Int16Lsb,
    Int24Lsb,
    Int32Lsb,
    Float32Lsb,
    Float64Lsb,
    Int32Lsb16,
    Int32Lsb18,
    Int32Lsb20,
    Int32Lsb24,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    PcmSigned,
    PcmFloat,
}

impl SampleType {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Int16Msb,
            1 => Self::Int24Msb,
            2 => Self::Int32Msb,
            3 => Self::Float32Msb,
            4 => Self::Float64Msb,
            8 => Self::Int32Msb16,
            9 => Self::Int32Msb18,
            10 => Self::Int32Msb20,
            11 => Self::Int32Msb24,
            16 => Self::Int16Lsb,
            17 => Self::Int24Lsb,
            18 => Self::Int32Lsb,
            19 => Self::Float32Lsb,
            20 => Self::Float64Lsb,
            24 => Self::Int32Lsb16,
            25 => Self::Int32Lsb18,
            26 => Self::Int32Lsb20,
            27 => Self::Int32Lsb24,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Int16Msb => 0,
            Self::Int24Msb => 1,
            Self::Int32Msb => 2,
            Self::Float32Msb => 3,
            Self::Float64Msb => 4,
            Self::Int32Msb16 => 8,
            Self::Int32Msb18 => 9,
            Self::Int32Msb20 => 10,
            Self::Int32Msb24 => 11,
            Self::Int16Lsb => 16,
            Self::Int24Lsb => 17,
            Self::Int32Lsb => 18,
            Self::Float32Lsb => 19,
            Self::Float64Lsb => 20,
            Self::Int32Lsb16 => 24,
            Self::Int32Lsb18 => 25,
            Self::Int32Lsb20 => 26,
            Self::Int32Lsb24 => 27,
        }
    }

    /// Significant bits per sample.
    pub fn bits(self) -> usize {
        match self {
            Self::Int16Msb | Self::Int16Lsb | Self::Int32Msb16 | Self::Int32Lsb16 => 16,
            Self::Int32Msb18 | Self::Int32Lsb18 => 18,
            Self::Int32Msb20 | Self::Int32Lsb20 => 20,
            Self::Int24Msb | Self::Int24Lsb | Self::Int32Msb24 | Self::Int32Lsb24 => 24,
            Self::Int32Msb | Self::Int32Lsb | Self::Float32Msb | Self::Float32Lsb => 32,
            Self::Float64Msb | Self::Float64Lsb => 64,
        }
    }

    /// Bytes one sample occupies in a hardware buffer.
    pub fn container_bytes(self) -> usize {
        if self.is_padded_int32() {
            4
        } else {
            self.bits() / 8
        }
    }

    pub fn frame_size(self, channels: usize) -> usize {
        self.container_bytes() * channels
    }

    pub fn encoding(self) -> Encoding {
        match self {
            Self::Float32Msb | Self::Float64Msb | Self::Float32Lsb | Self::Float64Lsb => {
                Encoding::PcmFloat
            }
            _ => Encoding::PcmSigned,
        }
    }

    pub fn is_big_endian(self) -> bool {
        self.code() < 16
    }

    fn is_padded_int32(self) -> bool {
        matches!(
            self,
            Self::Int32Msb16
                | Self::Int32Msb18
                | Self::Int32Msb20
                | Self::Int32Msb24
                | Self::Int32Lsb16
                | Self::Int32Lsb18
                | Self::Int32Lsb20
                | Self::Int32Lsb24
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: Encoding,
    /// `None` when any of the driver's rates is acceptable.
    pub sample_rate: Option<f64>,
    pub sample_size_bits: usize,
    pub channels: usize,
    pub frame_size: usize,
    pub big_endian: bool,
    pub sample_type: SampleType,
}

impl AudioFormat {
    pub fn new(sample_rate: Option<f64>, sample_type: SampleType, channels: usize) -> Self {
        Self {
            encoding: sample_type.encoding(),
            sample_rate,
            sample_size_bits: sample_type.bits(),
            channels,
            frame_size: sample_type.frame_size(channels),
            big_endian: sample_type.is_big_endian(),
            sample_type,
        }
    }

    pub fn sample_bytes(&self) -> usize {
        self.sample_type.container_bytes()
    }

    /// Whether `self`, a supported format, accepts the requested `other`.
    /// An unspecified rate on either side matches any rate.
    pub fn matches(&self, other: &AudioFormat) -> bool {
        let rate_ok = match (self.sample_rate, other.sample_rate) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => true,
        };
        rate_ok
            && self.encoding == other.encoding
            && self.sample_size_bits == other.sample_size_bits
            && self.channels == other.channels
            && self.frame_size == other.frame_size
            && (self.sample_size_bits <= 8 || self.big_endian == other.big_endian)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rate = match self.sample_rate {
            Some(rate) => format!("{rate} Hz"),
            None => "any rate".to_string(),
        };
        write!(
            f,
            "{:?} {rate}, {} bit, {} channel(s), {} bytes/frame, {}",
            self.encoding,
            self.sample_size_bits,
            self.channels,
            self.frame_size,
            if self.big_endian {
                "big-endian"
            } else {
                "little-endian"
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_known_types() {
        for code in 0..32 {
            if let Some(kind) = SampleType::from_code(code) {
                assert_eq!(kind.code(), code);
            }
        }
        assert_eq!(SampleType::from_code(5), None);
    }

    #[test]
    fn padded_int32_uses_four_byte_containers() {
        assert_eq!(SampleType::Int32Lsb16.bits(), 16);
        assert_eq!(SampleType::Int32Lsb16.frame_size(2), 8);
        assert_eq!(SampleType::Int24Lsb.frame_size(2), 6);
        assert_eq!(SampleType::Float64Msb.frame_size(1), 8);
    }

    #[test]
    fn encoding_and_endianness_follow_the_type() {
        assert_eq!(SampleType::Float32Lsb.encoding(), Encoding::PcmFloat);
        assert_eq!(SampleType::Int32Msb20.encoding(), Encoding::PcmSigned);
        assert!(SampleType::Int16Msb.is_big_endian());
        assert!(!SampleType::Int32Lsb24.is_big_endian());
    }

    #[test]
    fn unspecified_rate_matches_any_rate() {
        let any = AudioFormat::new(None, SampleType::Int32Lsb, 2);
        let fixed = AudioFormat::new(Some(48_000.0), SampleType::Int32Lsb, 2);
        assert!(any.matches(&fixed));
        assert!(fixed.matches(&any));
        let mono = AudioFormat::new(Some(48_000.0), SampleType::Int32Lsb, 1);
        assert!(!fixed.matches(&mono));
        let other_rate = AudioFormat::new(Some(44_100.0), SampleType::Int32Lsb, 2);
        assert!(!fixed.matches(&other_rate));
    }
}
