//! Polyline codec for incident geometry
//!
//! Encodes coordinate sequences in the Google polyline format: each
//! coordinate is quantized to five decimal places and delta-encoded
//! against the previous point, so nearby points cost very few bytes. The
//! quantization is lossy (about one meter) but deterministic, which is what
//! lets identical geometries hash to identical business keys.
//!
//! Pure functions only; no network or database concerns belong here.

/// Quantization factor: five decimal places.
const PRECISION: f64 = 1e5;

/// Errors from decoding a polyline string
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolylineError {
    #[error("polyline truncated mid-value")]
    Truncated,

    #[error("invalid polyline character {0:#x}")]
    InvalidCharacter(u8),
}

/// Encode a sequence of (latitude, longitude) pairs
pub fn encode(coordinates: &[(f64, f64)]) -> String {
    // Worst case is ~6 chars per delta, two deltas per point.
    let mut out = String::with_capacity(coordinates.len() * 8);
    let mut prev_lat = 0i64;
    let mut prev_lng = 0i64;

    for &(lat, lng) in coordinates {
        let lat_e5 = scale(lat);
        let lng_e5 = scale(lng);
        encode_value(lat_e5 - prev_lat, &mut out);
        encode_value(lng_e5 - prev_lng, &mut out);
        prev_lat = lat_e5;
        prev_lng = lng_e5;
    }

    out
}

/// Decode a polyline string back into (latitude, longitude) pairs
pub fn decode(encoded: &str) -> Result<Vec<(f64, f64)>, PolylineError> {
    let bytes = encoded.as_bytes();
    let mut coordinates = Vec::new();
    let mut index = 0;
    let mut lat = 0i64;
    let mut lng = 0i64;

    while index < bytes.len() {
        let (d_lat, next) = decode_value(bytes, index)?;
        let (d_lng, next) = decode_value(bytes, next)?;
        lat += d_lat;
        lng += d_lng;
        index = next;
        coordinates.push((lat as f64 / PRECISION, lng as f64 / PRECISION));
    }

    Ok(coordinates)
}

fn scale(value: f64) -> i64 {
    (value * PRECISION).round() as i64
}

/// Zigzag the signed delta and emit little-endian 5-bit chunks offset
/// into the printable ASCII range
fn encode_value(value: i64, out: &mut String) {
    let mut v = value << 1;
    if value < 0 {
        v = !v;
    }
    while v >= 0x20 {
        out.push((((0x20 | (v & 0x1f)) + 63) as u8) as char);
        v >>= 5;
    }
    out.push(((v + 63) as u8) as char);
}

fn decode_value(bytes: &[u8], mut index: usize) -> Result<(i64, usize), PolylineError> {
    let mut result = 0i64;
    let mut shift = 0u32;

    loop {
        let Some(&byte) = bytes.get(index) else {
            return Err(PolylineError::Truncated);
        };
        if !(63..=127).contains(&byte) {
            return Err(PolylineError::InvalidCharacter(byte));
        }
        index += 1;

        let chunk = (byte - 63) as i64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;

        if chunk < 0x20 {
            break;
        }
    }

    let value = if result & 1 != 0 {
        !(result >> 1)
    } else {
        result >> 1
    };

    Ok((value, index))
}
