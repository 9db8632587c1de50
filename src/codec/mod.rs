//! Audio codec: µ-law ↔ PCM16 and the two fixed-ratio resamplers the
//! bridge needs (8→16 kHz on the way to the speech model, 24→8 kHz on
//! the way back to the carrier). Pure, deterministic, no allocation
//! beyond the output buffer — no crate dependency, same way the rest of
//! this crate hand-writes small signal-processing functions rather than
//! pulling in a DSP crate for a four-line computation.

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Decode a single G.711 µ-law byte to signed 16-bit linear PCM.
pub fn mulaw_decode(b: u8) -> i16 {
    let b = !b;
    let sign = (b & 0x80) != 0;
    let exponent = ((b >> 4) & 0x07) as i16;
    let mantissa = (b & 0x0f) as i16;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode a signed 16-bit linear PCM sample to a G.711 µ-law byte.
pub fn mulaw_encode(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = if sample < 0 {
        // i16::MIN negation would overflow; clamp first.
        (sample.max(-MULAW_CLIP) as i32).unsigned_abs() as i16
    } else {
        sample.min(MULAW_CLIP)
    };
    let biased = magnitude + MULAW_BIAS;

    let mut exponent: i16 = 7;
    for exp in (0..=7).rev() {
        if biased & (0x1 << (exp + 7)) != 0 {
            exponent = exp;
            break;
        }
    }
    let mantissa = (biased >> (exponent + 3)) & 0x0f;
    let byte = sign | ((exponent as u8) << 4) | (mantissa as u8);
    !byte
}

/// Decode a buffer of µ-law bytes to PCM16.
pub fn mulaw_decode_buf(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_decode(b)).collect()
}

/// Encode a buffer of PCM16 samples to µ-law bytes.
pub fn mulaw_encode_buf(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| mulaw_encode(s)).collect()
}

/// Upsample 8 kHz PCM16 to 16 kHz by emitting each sample followed by
/// the linear average of it and its successor (the final sample's
/// successor is itself).
pub fn upsample_8k_to_16k(pcm: &[i16]) -> Vec<i16> {
    if pcm.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for i in 0..pcm.len() {
        let current = pcm[i];
        let next = pcm.get(i + 1).copied().unwrap_or(current);
        out.push(current);
        out.push(midpoint(current, next));
    }
    out
}

/// Downsample 24 kHz PCM16 to 8 kHz by averaging non-overlapping groups
/// of 3 adjacent samples; a final partial group is padded by repeating
/// its last sample.
pub fn downsample_24k_to_8k(pcm: &[i16]) -> Vec<i16> {
    downsample_3tap_average(pcm)
}

/// Identical 3-tap average, kept as a distinct name for the split-mode
/// call site — no additional low-pass filtering beyond the average.
pub fn downsample_24k_to_8k_linear_interp(pcm: &[i16]) -> Vec<i16> {
    downsample_3tap_average(pcm)
}

fn downsample_3tap_average(pcm: &[i16]) -> Vec<i16> {
    if pcm.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(pcm.len().div_ceil(3));
    let mut chunks = pcm.chunks_exact(3);
    for chunk in &mut chunks {
        out.push(average3(chunk[0], chunk[1], chunk[2]));
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let last = *remainder.last().unwrap();
        let a = remainder[0];
        let b = *remainder.get(1).unwrap_or(&last);
        let c = last;
        out.push(average3(a, b, c));
    }
    out
}

/// Pack PCM16 samples as little-endian bytes for the wire (the speech
/// model's audio frames are `16-bit LPCM`, base64-wrapped by the
/// caller).
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Unpack little-endian PCM16 bytes back to samples. A trailing odd
/// byte (malformed frame) is dropped.
pub fn le_bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

fn midpoint(a: i16, b: i16) -> i16 {
    ((a as i32 + b as i32) / 2) as i16
}

fn average3(a: i16, b: i16, c: i16) -> i16 {
    ((a as i32 + b as i32 + c as i32) / 3) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_is_bounded() {
        for sample in (-32000i16..32000).step_by(137) {
            let encoded = mulaw_encode(sample);
            let decoded = mulaw_decode(encoded);
            assert!(
                (decoded as i32 - sample as i32).abs() < 260,
                "sample={sample} decoded={decoded}"
            );
        }
    }

    #[test]
    fn mulaw_encode_decode_is_stable_on_its_own_output() {
        for sample in [-12345i16, -1, 0, 1, 4000, 32000] {
            let once = mulaw_decode(mulaw_encode(sample));
            let twice = mulaw_decode(mulaw_encode(once));
            assert_eq!(mulaw_encode(once), mulaw_encode(twice));
        }
    }

    #[test]
    fn silence_round_trips_exactly() {
        assert_eq!(mulaw_decode(mulaw_encode(0)), 0);
    }

    #[test]
    fn upsample_of_dc_signal_returns_dc_value() {
        let dc = vec![1234i16; 100];
        let up = upsample_8k_to_16k(&dc);
        assert_eq!(up.len(), 200);
        assert!(up.iter().all(|&s| s == 1234));
    }

    #[test]
    fn downsample_of_dc_signal_returns_dc_value() {
        let dc = vec![-500i16; 99];
        let down = downsample_24k_to_8k(&dc);
        assert_eq!(down.len(), 33);
        assert!(down.iter().all(|&s| s == -500));
    }

    #[test]
    fn downsample_pads_partial_final_group() {
        let pcm = vec![10i16, 20, 30, 40];
        let down = downsample_24k_to_8k(&pcm);
        assert_eq!(down.len(), 2);
        assert_eq!(down[0], 20);
        // final partial group [40] padded by repeating itself -> avg(40, 40, 40) = 40
        assert_eq!(down[1], 40);
    }

    #[test]
    fn upsample_empty_is_empty() {
        assert!(upsample_8k_to_16k(&[]).is_empty());
    }

    #[test]
    fn pcm16_byte_packing_round_trips() {
        let samples: Vec<i16> = vec![-32768, -1, 0, 1, 32767];
        let bytes = pcm16_to_le_bytes(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(le_bytes_to_pcm16(&bytes), samples);
    }

    #[test]
    fn le_bytes_to_pcm16_drops_trailing_odd_byte() {
        let bytes = [0x01, 0x00, 0xff];
        assert_eq!(le_bytes_to_pcm16(&bytes), vec![1]);
    }
}
