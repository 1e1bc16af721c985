//! Sample encoding conversion and channel mapping.
//!
//! Samples are normalized to `f64` in `[-1.0, 1.0)` when the encodings differ
//! and copied byte-for-byte when they match.

use crate::buffer::Chunk;
use crate::format::{Layout, PcmFormat, SampleFormat};

/// Decode one little-endian sample to a normalized value.
pub fn read_sample(fmt: SampleFormat, b: &[u8]) -> f64 {
    match fmt {
        SampleFormat::U8 => (b[0] as f64 - 128.0) / 128.0,
        SampleFormat::I16 => i16::from_le_bytes([b[0], b[1]]) as f64 / 32_768.0,
        SampleFormat::I24 => {
            let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
            v as f64 / 8_388_608.0
        }
        SampleFormat::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / 2_147_483_648.0,
        SampleFormat::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
        SampleFormat::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
    }
}

/// Encode a normalized value, clamping integer encodings to their range.
pub fn write_sample(fmt: SampleFormat, v: f64, out: &mut [u8]) {
    match fmt {
        SampleFormat::U8 => {
            out[0] = ((v * 128.0).round().clamp(-128.0, 127.0) + 128.0) as u8;
        }
        SampleFormat::I16 => {
            let s = (v * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
            out[..2].copy_from_slice(&s.to_le_bytes());
        }
        SampleFormat::I24 => {
            let s = (v * 8_388_608.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
            out[..3].copy_from_slice(&s.to_le_bytes()[..3]);
        }
        SampleFormat::I32 => {
            let s = (v * 2_147_483_648.0)
                .round()
                .clamp(-2_147_483_648.0, 2_147_483_647.0) as i32;
            out[..4].copy_from_slice(&s.to_le_bytes());
        }
        SampleFormat::F32 => out[..4].copy_from_slice(&(v as f32).to_le_bytes()),
        SampleFormat::F64 => out[..8].copy_from_slice(&v.to_le_bytes()),
    }
}

/// Source channel feeding destination channel `dst_ch`.
///
/// Mono is duplicated, extra destination channels reuse the last source
/// channel. Down-mixing to mono is handled by [`read_mapped`].
fn map_channel(src_channels: usize, dst_ch: usize) -> usize {
    dst_ch.min(src_channels.saturating_sub(1))
}

fn read_mapped(
    src: &Chunk<'_>,
    src_fmt: &PcmFormat,
    frame: usize,
    dst_channels: usize,
    dst_ch: usize,
) -> f64 {
    let sc = src_fmt.channels as usize;
    if dst_channels == 1 && sc > 1 {
        let sum: f64 = (0..sc)
            .map(|c| read_sample(src_fmt.sample, src.sample(src_fmt, frame, c)))
            .sum();
        return sum / sc as f64;
    }
    let c = map_channel(sc, dst_ch);
    read_sample(src_fmt.sample, src.sample(src_fmt, frame, c))
}

/// Destination byte offset of (`frame`, `channel`).
///
/// Planar output keeps channel `c` at `c * plane_stride`.
fn dst_offset(fmt: &PcmFormat, plane_stride: usize, frame: usize, channel: usize) -> usize {
    let ss = fmt.sample.bytes();
    match fmt.layout {
        Layout::Interleaved => frame * fmt.frame_size() + channel * ss,
        Layout::Planar => channel * plane_stride + frame * ss,
    }
}

/// Convert `frames` frames from `src` into `dst`.
pub fn convert(
    src: &Chunk<'_>,
    src_fmt: &PcmFormat,
    dst: &mut [u8],
    dst_fmt: &PcmFormat,
    plane_stride: usize,
    frames: usize,
) {
    let dc = dst_fmt.channels as usize;
    let ss = dst_fmt.sample.bytes();
    let same_encoding = src_fmt.sample == dst_fmt.sample && src_fmt.channels == dst_fmt.channels;

    if same_encoding {
        if let (Chunk::Interleaved(b), Layout::Interleaved) = (src, dst_fmt.layout) {
            let n = frames * dst_fmt.frame_size();
            dst[..n].copy_from_slice(&b[..n]);
            return;
        }
        for f in 0..frames {
            for c in 0..dc {
                let off = dst_offset(dst_fmt, plane_stride, f, c);
                dst[off..off + ss].copy_from_slice(src.sample(src_fmt, f, c));
            }
        }
        return;
    }

    for f in 0..frames {
        for c in 0..dc {
            let v = read_mapped(src, src_fmt, f, dc, c);
            let off = dst_offset(dst_fmt, plane_stride, f, c);
            write_sample(dst_fmt.sample, v, &mut dst[off..off + ss]);
        }
    }
}

/// Append `frames` frames of `src` to `out` as interleaved `f32`.
pub fn to_f32_interleaved(src: &Chunk<'_>, fmt: &PcmFormat, frames: usize, out: &mut Vec<f32>) {
    let channels = fmt.channels as usize;
    out.reserve(frames * channels);
    for f in 0..frames {
        for c in 0..channels {
            out.push(read_sample(fmt.sample, src.sample(fmt, f, c)) as f32);
        }
    }
}

/// Encode interleaved `f32` samples into `fmt`, replacing the contents of `out`.
///
/// Returns the plane stride for planar output.
pub fn from_f32_interleaved(samples: &[f32], fmt: &PcmFormat, out: &mut Vec<u8>) -> usize {
    let channels = fmt.channels as usize;
    let frames = samples.len() / channels.max(1);
    let ss = fmt.sample.bytes();
    let stride = frames * ss;
    out.clear();
    out.resize(frames * fmt.frame_size(), 0);
    for f in 0..frames {
        for c in 0..channels {
            let off = dst_offset(fmt, stride, f, c);
            write_sample(fmt.sample, samples[f * channels + c] as f64, &mut out[off..off + ss]);
        }
    }
    stride
}

/// Multiply every sample in `bytes` by `factor`.
pub fn scale(bytes: &mut [u8], fmt: SampleFormat, factor: f64) {
    let ss = fmt.bytes();
    for s in bytes.chunks_exact_mut(ss) {
        let v = read_sample(fmt, s) * factor;
        write_sample(fmt, v, s);
    }
}

/// Linear factor for a gain in decibels.
pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

pub fn gain_to_db(gain: f64) -> f64 {
    if gain <= 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * gain.log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Planes;

    fn s16(v: &[i16]) -> Vec<u8> {
        v.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn f32s(b: &[u8]) -> Vec<f32> {
        b.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn integer_extremes_map_to_unit_range() {
        assert_eq!(read_sample(SampleFormat::I16, &i16::MIN.to_le_bytes()), -1.0);
        assert_eq!(read_sample(SampleFormat::U8, &[128]), 0.0);
        let mut out = [0u8; 3];
        write_sample(SampleFormat::I24, -1.0, &mut out);
        assert_eq!(read_sample(SampleFormat::I24, &out), -1.0);
    }

    #[test]
    fn writes_clamp_out_of_range_values() {
        let mut out = [0u8; 2];
        write_sample(SampleFormat::I16, 1.5, &mut out);
        assert_eq!(i16::from_le_bytes(out), i16::MAX);
    }

    #[test]
    fn s16_to_f32_interleaved() {
        let src = s16(&[16_384, -16_384, 0, 32_767]);
        let src_fmt = PcmFormat::new(SampleFormat::I16, 2, 44_100);
        let dst_fmt = PcmFormat::new(SampleFormat::F32, 2, 44_100);
        let mut dst = vec![0u8; 16];
        convert(&Chunk::Interleaved(&src), &src_fmt, &mut dst, &dst_fmt, 0, 2);
        let out = f32s(&dst);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[1], -0.5);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn stereo_to_mono_averages() {
        let src = s16(&[1000, 3000]);
        let src_fmt = PcmFormat::new(SampleFormat::I16, 2, 8000);
        let dst_fmt = PcmFormat::new(SampleFormat::I16, 1, 8000);
        let mut dst = vec![0u8; 2];
        convert(&Chunk::Interleaved(&src), &src_fmt, &mut dst, &dst_fmt, 0, 1);
        assert_eq!(i16::from_le_bytes([dst[0], dst[1]]), 2000);
    }

    #[test]
    fn mono_to_stereo_duplicates() {
        let src = s16(&[123]);
        let src_fmt = PcmFormat::new(SampleFormat::I16, 1, 8000);
        let dst_fmt = PcmFormat::new(SampleFormat::I16, 2, 8000);
        let mut dst = vec![0u8; 4];
        convert(&Chunk::Interleaved(&src), &src_fmt, &mut dst, &dst_fmt, 0, 1);
        assert_eq!(dst, s16(&[123, 123]));
    }

    #[test]
    fn interleaved_to_planar_uses_stride() {
        let src = s16(&[1, 2, 3, 4]);
        let src_fmt = PcmFormat::new(SampleFormat::I16, 2, 8000);
        let dst_fmt = src_fmt.planar();
        // Capacity of 3 frames per plane, 2 used.
        let mut dst = vec![0u8; 12];
        convert(&Chunk::Interleaved(&src), &src_fmt, &mut dst, &dst_fmt, 6, 2);
        let planes = Planes::new(&dst, 6, 4, 2);
        assert_eq!(planes.channel(0), s16(&[1, 3]).as_slice());
        assert_eq!(planes.channel(1), s16(&[2, 4]).as_slice());
    }

    #[test]
    fn f32_roundtrip_helpers() {
        let src = s16(&[8192, -8192]);
        let fmt = PcmFormat::new(SampleFormat::I16, 2, 8000);
        let mut f = Vec::new();
        to_f32_interleaved(&Chunk::Interleaved(&src), &fmt, 1, &mut f);
        assert_eq!(f, vec![0.25, -0.25]);
        let mut out = Vec::new();
        from_f32_interleaved(&f, &fmt, &mut out);
        assert_eq!(out, src);
    }

    #[test]
    fn scale_applies_gain() {
        let mut b = s16(&[1000, -1000]);
        scale(&mut b, SampleFormat::I16, 0.5);
        assert_eq!(b, s16(&[500, -500]));
        assert!((db_to_gain(-6.0) - 0.501).abs() < 0.001);
        assert!((gain_to_db(0.5) + 6.02).abs() < 0.01);
    }
}
