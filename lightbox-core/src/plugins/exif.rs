//! Byte-level fast paths over the prefetch buffer.
//!
//! These scans exist to avoid a second I/O round-trip on network
//! storage: orientation and an embedded XMP rating are pulled straight
//! out of the first few hundred kilobytes already in memory.

use super::sidecar::parse_xmp_fields;

/// Little-endian IFD entry for tag 0x0112 (Orientation), type SHORT,
/// count 1. The value follows as the next two bytes.
const ORIENTATION_TAG_LE: [u8; 8] = [0x12, 0x01, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00];

/// Scan for the EXIF Orientation value (1..=8). Defaults to 1 when the
/// pattern is absent or out of range.
pub fn scan_orientation(buffer: &[u8]) -> u16 {
    if let Some(pos) = find(buffer, &ORIENTATION_TAG_LE) {
        let value_at = pos + ORIENTATION_TAG_LE.len();
        if value_at + 2 <= buffer.len() {
            let value = u16::from_le_bytes([buffer[value_at], buffer[value_at + 1]]);
            if (1..=8).contains(&value) {
                return value;
            }
        }
    }
    1
}

/// Extract a rating from an embedded `x:xmpmeta` packet, if one is in
/// the buffer.
pub fn scan_embedded_xmp_rating(buffer: &[u8]) -> Option<u8> {
    let packet = embedded_xmp_packet(buffer)?;
    parse_xmp_fields(packet).rating.and_then(|r| {
        if (0..=5).contains(&r) {
            Some(r as u8)
        } else {
            None
        }
    })
}

/// Borrow the embedded XMP packet out of the buffer, if present.
pub fn embedded_xmp_packet(buffer: &[u8]) -> Option<&[u8]> {
    let start = find(buffer, b"<x:xmpmeta")?;
    let end = find(&buffer[start..], b"</x:xmpmeta>")? + start;
    Some(&buffer[start..end + b"</x:xmpmeta>".len()])
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
