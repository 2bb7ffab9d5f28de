//! Geohash codec used for geographic sharding.
//!
//! Longitude is bisected first, then latitude, alternating, five bits per
//! base32 character.

use thiserror::Error;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// ~156km cells, the unit of shard ownership
pub const PRECISION_REGION: usize = 3;
/// ~39km x 19km
pub const PRECISION_CITY: usize = 4;
/// ~5km x 5km, used for a node's own position
pub const PRECISION_LOCAL: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeohashError {
    #[error("invalid geohash character {0:?}")]
    InvalidChar(char),
}

pub fn encode(lat: f64, lon: f64, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut out = String::with_capacity(precision);
    let mut bits = 0usize;
    let mut bit_count = 0;
    let mut is_lon = true;

    while out.len() < precision {
        let (value, range) = if is_lon {
            (lon, &mut lon_range)
        } else {
            (lat, &mut lat_range)
        };
        let mid = (range.0 + range.1) / 2.0;
        if value >= mid {
            bits = (bits << 1) | 1;
            range.0 = mid;
        } else {
            bits <<= 1;
            range.1 = mid;
        }
        is_lon = !is_lon;
        bit_count += 1;

        if bit_count == 5 {
            out.push(BASE32[bits] as char);
            bits = 0;
            bit_count = 0;
        }
    }
    out
}

/// Decode to the center of the cell. Lossy: the original point is only
/// known to lie within the cell.
pub fn decode(hash: &str) -> Result<(f64, f64), GeohashError> {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut is_lon = true;

    for ch in hash.chars() {
        let lower = ch.to_ascii_lowercase();
        let idx = BASE32
            .iter()
            .position(|&b| b as char == lower)
            .ok_or(GeohashError::InvalidChar(ch))?;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            let range = if is_lon { &mut lon_range } else { &mut lat_range };
            let mid = (range.0 + range.1) / 2.0;
            if bit == 1 {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            is_lon = !is_lon;
        }
    }

    Ok((
        (lat_range.0 + lat_range.1) / 2.0,
        (lon_range.0 + lon_range.1) / 2.0,
    ))
}

/// Height and width in degrees of a cell at `precision`.
pub fn cell_size(precision: usize) -> (f64, f64) {
    let bits = precision as u32 * 5;
    let lat_bits = bits / 2;
    let lon_bits = (bits + 1) / 2;
    (180.0 / 2f64.powi(lat_bits as i32), 360.0 / 2f64.powi(lon_bits as i32))
}

/// The eight surrounding cells at the same precision, in row order from
/// south-west to north-east. Longitude wraps at the antimeridian; latitude
/// is clamped, so cells touching a pole can repeat.
pub fn neighbors(hash: &str) -> Result<Vec<String>, GeohashError> {
    let (lat, lon) = decode(hash)?;
    let precision = hash.len();
    let (lat_delta, lon_delta) = cell_size(precision);

    let mut out = Vec::with_capacity(8);
    for dlat in [-lat_delta, 0.0, lat_delta] {
        for dlon in [-lon_delta, 0.0, lon_delta] {
            if dlat == 0.0 && dlon == 0.0 {
                continue;
            }
            let mut nlon = lon + dlon;
            if nlon > 180.0 {
                nlon -= 360.0;
            } else if nlon < -180.0 {
                nlon += 360.0;
            }
            let nlat = (lat + dlat).clamp(-90.0, 90.0);
            out.push(encode(nlat, nlon, precision));
        }
    }
    Ok(out)
}

/// Geohash precision used when loading a map viewport at `zoom`.
pub fn precision_for_zoom(zoom: u8) -> usize {
    match zoom {
        z if z >= 12 => PRECISION_LOCAL,
        z if z >= 8 => PRECISION_CITY,
        _ => PRECISION_REGION,
    }
}
