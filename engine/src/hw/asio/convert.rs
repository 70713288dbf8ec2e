use super::format::SampleType;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

fn full_scale(bits: usize) -> f64 {
    (1_i64 << (bits - 1)) as f64
}

fn quantize(value: f32, bits: usize) -> i32 {
    let scale = full_scale(bits);
    let scaled = (value.clamp(-1.0, 1.0) as f64 * scale).round();
    scaled.clamp(-scale, scale - 1.0) as i32
}

fn encode_with<B: ByteOrder>(sample_type: SampleType, value: f32, dst: &mut [u8]) {
    match sample_type {
        SampleType::Int16Msb | SampleType::Int16Lsb => {
            B::write_i16(dst, quantize(value, 16) as i16)
        }
        SampleType::Int24Msb | SampleType::Int24Lsb => B::write_i24(dst, quantize(value, 24)),
        SampleType::Float32Msb | SampleType::Float32Lsb => B::write_f32(dst, value),
        SampleType::Float64Msb | SampleType::Float64Lsb => B::write_f64(dst, value as f64),
        other => B::write_i32(dst, quantize(value, other.bits())),
    }
}

fn decode_with<B: ByteOrder>(sample_type: SampleType, src: &[u8]) -> f32 {
    match sample_type {
        SampleType::Int16Msb | SampleType::Int16Lsb => {
            (B::read_i16(src) as f64 / full_scale(16)) as f32
        }
        SampleType::Int24Msb | SampleType::Int24Lsb => {
            (B::read_i24(src) as f64 / full_scale(24)) as f32
        }
        SampleType::Float32Msb | SampleType::Float32Lsb => B::read_f32(src),
        SampleType::Float64Msb | SampleType::Float64Lsb => B::read_f64(src) as f32,
        other => (B::read_i32(src) as f64 / full_scale(other.bits())) as f32,
    }
}

/// Writes one sample into `dst`, which must hold at least one container.
pub fn encode_sample(sample_type: SampleType, value: f32, dst: &mut [u8]) {
    if sample_type.is_big_endian() {
        encode_with::<BigEndian>(sample_type, value, dst);
    } else {
        encode_with::<LittleEndian>(sample_type, value, dst);
    }
}

pub fn decode_sample(sample_type: SampleType, src: &[u8]) -> f32 {
    if sample_type.is_big_endian() {
        decode_with::<BigEndian>(sample_type, src)
    } else {
        decode_with::<LittleEndian>(sample_type, src)
    }
}

pub fn encode_interleaved(sample_type: SampleType, samples: &[f32], dst: &mut Vec<u8>) {
    let bytes = sample_type.container_bytes();
    let start = dst.len();
    dst.resize(start + samples.len() * bytes, 0);
    for (sample, chunk) in samples
        .iter()
        .zip(dst[start..].chunks_exact_mut(bytes))
    {
        encode_sample(sample_type, *sample, chunk);
    }
}

pub fn decode_interleaved(sample_type: SampleType, src: &[u8], dst: &mut Vec<f32>) {
    let bytes = sample_type.container_bytes();
    dst.extend(
        src.chunks_exact(bytes)
            .map(|chunk| decode_sample(sample_type, chunk)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int16_msb_is_big_endian_full_scale() {
        let mut buf = [0_u8; 2];
        encode_sample(SampleType::Int16Msb, 0.5, &mut buf);
        assert_eq!(buf, [0x40, 0x00]);
        encode_sample(SampleType::Int16Msb, 1.0, &mut buf);
        assert_eq!(buf, [0x7f, 0xff]);
        encode_sample(SampleType::Int16Msb, -1.0, &mut buf);
        assert_eq!(buf, [0x80, 0x00]);
    }

    #[test]
    fn int32_lsb16_keeps_sixteen_bits_in_low_word() {
        let mut buf = [0_u8; 4];
        encode_sample(SampleType::Int32Lsb16, 0.5, &mut buf);
        assert_eq!(buf, [0x00, 0x40, 0x00, 0x00]);
        assert_eq!(decode_sample(SampleType::Int32Lsb16, &buf), 0.5);
    }

    #[test]
    fn int24_lsb_uses_three_bytes() {
        let mut out = Vec::new();
        encode_interleaved(SampleType::Int24Lsb, &[0.25, -0.25], &mut out);
        assert_eq!(out.len(), 6);
        assert_eq!(&out[..3], &[0x00, 0x00, 0x20]);
        let mut back = Vec::new();
        decode_interleaved(SampleType::Int24Lsb, &out, &mut back);
        assert_eq!(back, vec![0.25, -0.25]);
    }

    #[test]
    fn float_types_pass_through() {
        let mut buf = [0_u8; 8];
        encode_sample(SampleType::Float64Msb, 0.125, &mut buf);
        assert_eq!(decode_sample(SampleType::Float64Msb, &buf), 0.125);
        encode_sample(SampleType::Float32Lsb, -0.75, &mut buf[..4]);
        assert_eq!(decode_sample(SampleType::Float32Lsb, &buf[..4]), -0.75);
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        let mut buf = [0_u8; 4];
        encode_sample(SampleType::Int32Lsb, 3.0, &mut buf);
        assert_eq!(LittleEndian::read_i32(&buf), i32::MAX);
    }
}
