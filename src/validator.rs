//! Classifies a tile payload as valid, empty, or invalid using type-specific
//! rules (raster vs vector). Pure and deterministic — no I/O.

use std::collections::HashSet;
use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use sha2::{Digest, Sha256};

use crate::config::TileKind;

const MIN_RASTER_LEN: usize = 16;
const MIN_VECTOR_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Valid { content_type: &'static str },
    Empty,
    Invalid { reason: String },
}

/// Holds the configured set of "known empty tile" body fingerprints
/// (sha256 hex digests), resolving the Open Question in spec.md §9.
pub struct Validator {
    empty_fingerprints: HashSet<[u8; 32]>,
}

impl Validator {
    pub fn new(fingerprints: &[String]) -> Self {
        let empty_fingerprints = fingerprints
            .iter()
            .filter_map(|hex_digest| decode_hex32(hex_digest))
            .collect();
        Validator { empty_fingerprints }
    }

    fn is_known_empty(&self, bytes: &[u8]) -> bool {
        if bytes.iter().all(|&b| b == 0) {
            return true;
        }
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        self.empty_fingerprints.contains(&digest)
    }

    /// Transparently gunzips `bytes` if `gzipped` is set; used for vector
    /// tiles served with `Content-Encoding: gzip` or a `.pbf.gz` extension.
    pub fn maybe_decompress(&self, bytes: Vec<u8>, gzipped: bool) -> std::io::Result<Vec<u8>> {
        if !gzipped {
            return Ok(bytes);
        }
        let mut decoder = GzDecoder::new(&bytes[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn classify(&self, kind: TileKind, bytes: &[u8]) -> Classification {
        match kind {
            TileKind::Raster => self.classify_raster(bytes),
            TileKind::Vector => self.classify_vector(bytes),
        }
    }

    fn classify_raster(&self, bytes: &[u8]) -> Classification {
        if bytes.len() < MIN_RASTER_LEN {
            return Classification::Invalid {
                reason: format!("raster payload too short ({} bytes)", bytes.len()),
            };
        }

        let content_type = match raster_magic(bytes) {
            Some(ct) => ct,
            None => {
                return Classification::Invalid {
                    reason: "payload does not match any known raster magic bytes".to_string(),
                }
            }
        };

        if self.is_known_empty(bytes) {
            return Classification::Empty;
        }

        if content_type == "image/png" && png_fully_transparent(bytes) {
            return Classification::Empty;
        }

        Classification::Valid { content_type }
    }

    fn classify_vector(&self, bytes: &[u8]) -> Classification {
        if bytes.len() < MIN_VECTOR_LEN {
            return Classification::Invalid {
                reason: format!("vector payload too short ({} bytes)", bytes.len()),
            };
        }

        if self.is_known_empty(bytes) {
            return Classification::Empty;
        }

        if !looks_like_framed_protobuf(bytes) {
            return Classification::Invalid {
                reason: "payload is not a well-framed protobuf tile".to_string(),
            };
        }

        Classification::Valid { content_type: "application/x-protobuf" }
    }
}

fn decode_hex32(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Recognizes the three raster formats the tile store can write a stored
/// extension for (`extension_for` in `store.rs`): PNG, JPEG, WebP. GIF is
/// deliberately not matched here — a valid GIF tile would have nowhere
/// correct to land on disk.
fn raster_magic(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Structurally decodes a PNG and reports whether every pixel's alpha
/// channel is zero. Unlike a fingerprint, this catches any byte-exact
/// encoding of a transparent tile, not just a specific pre-seeded blob.
/// Only 8-bit grayscale+alpha and truecolor+alpha are decoded; other color
/// types (no alpha channel, or palette/16-bit) return `false` since full
/// transparency can't be determined from pixel bytes alone.
fn png_fully_transparent(bytes: &[u8]) -> bool {
    const SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    if !bytes.starts_with(&SIGNATURE) {
        return false;
    }

    let mut pos = 8usize;
    let mut width = 0u32;
    let mut height = 0u32;
    let mut bit_depth = 0u8;
    let mut color_type = 0u8;
    let mut idat = Vec::new();
    let mut saw_ihdr = false;

    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        let tag = &bytes[pos + 4..pos + 8];
        let data_start = pos + 8;
        let data_end = match data_start.checked_add(len) {
            Some(e) if e <= bytes.len() => e,
            _ => return false,
        };
        let data = &bytes[data_start..data_end];

        match tag {
            b"IHDR" => {
                if data.len() < 13 {
                    return false;
                }
                width = u32::from_be_bytes(data[0..4].try_into().unwrap());
                height = u32::from_be_bytes(data[4..8].try_into().unwrap());
                bit_depth = data[8];
                color_type = data[9];
                saw_ihdr = true;
            }
            b"IDAT" => idat.extend_from_slice(data),
            b"IEND" => break,
            _ => {}
        }

        pos = data_end + 4; // skip CRC
    }

    if !saw_ihdr || bit_depth != 8 || width == 0 || height == 0 {
        return false;
    }
    let bpp = match color_type {
        4 => 2, // grayscale + alpha
        6 => 4, // truecolor + alpha
        _ => return false,
    };

    let mut raw = Vec::new();
    let mut decoder = ZlibDecoder::new(&idat[..]);
    if decoder.read_to_end(&mut raw).is_err() {
        return false;
    }

    let stride = width as usize * bpp;
    let mut prev_line = vec![0u8; stride];
    let mut pos = 0usize;

    for _ in 0..height {
        if pos >= raw.len() {
            return false;
        }
        let filter = raw[pos];
        pos += 1;
        if pos + stride > raw.len() {
            return false;
        }
        let mut line = raw[pos..pos + stride].to_vec();
        pos += stride;

        for i in 0..stride {
            let left = if i >= bpp { line[i - bpp] } else { 0 };
            let up = prev_line[i];
            let upper_left = if i >= bpp { prev_line[i - bpp] } else { 0 };
            let recon = match filter {
                0 => line[i],
                1 => line[i].wrapping_add(left),
                2 => line[i].wrapping_add(up),
                3 => line[i].wrapping_add(((left as u16 + up as u16) / 2) as u8),
                4 => line[i].wrapping_add(paeth_predictor(left, up, upper_left)),
                _ => return false,
            };
            line[i] = recon;
        }

        for pixel in line.chunks_exact(bpp) {
            if pixel[bpp - 1] != 0 {
                return false;
            }
        }

        prev_line = line;
    }

    true
}

fn paeth_predictor(a: u8, b: u8, c: u8) -> u8 {
    let (a, b, c) = (a as i32, b as i32, c as i32);
    let p = a + b - c;
    let pa = (p - a).abs();
    let pb = (p - b).abs();
    let pc = (p - c).abs();
    if pa <= pb && pa <= pc {
        a as u8
    } else if pb <= pc {
        b as u8
    } else {
        c as u8
    }
}

/// A minimal structural check for Mapbox Vector Tile framing: walks the
/// top-level protobuf fields as `(tag, wire_type)` + value, verifying the
/// byte stream is well-formed and contains at least one length-delimited
/// field 3 (the `layers` repeated message in the MVT spec). Full decoding of
/// the nested layer messages is intentionally not performed.
fn looks_like_framed_protobuf(bytes: &[u8]) -> bool {
    let mut pos = 0usize;
    let mut saw_layers_field = false;

    while pos < bytes.len() {
        let (tag, tag_len) = match read_varint(bytes, pos) {
            Some(v) => v,
            None => return false,
        };
        pos += tag_len;

        let field_number = tag >> 3;
        let wire_type = tag & 0x7;

        match wire_type {
            0 => {
                // varint
                let (_, len) = match read_varint(bytes, pos) {
                    Some(v) => v,
                    None => return false,
                };
                pos += len;
            }
            1 => pos += 8,  // 64-bit
            5 => pos += 4,  // 32-bit
            2 => {
                // length-delimited
                let (len, len_bytes) = match read_varint(bytes, pos) {
                    Some(v) => v,
                    None => return false,
                };
                pos += len_bytes;
                if pos as u64 + len > bytes.len() as u64 {
                    return false;
                }
                if field_number == 3 {
                    saw_layers_field = true;
                }
                pos += len as usize;
            }
            _ => return false,
        }
    }

    saw_layers_field
}

fn read_varint(bytes: &[u8], start: usize) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut i = start;
    loop {
        let byte = *bytes.get(i)?;
        value |= ((byte & 0x7F) as u64) << shift;
        i += 1;
        if byte & 0x80 == 0 {
            return Some((value, i - start));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}
