//! Picking id encoding
//!
//! The picking pass draws every instance with a flat color holding its
//! index plus one, so a cleared black pixel reads back as "nothing".

use glam::Vec4;

/// Color that encodes `index`.
pub fn encode_index(index: usize) -> Vec4 {
    let value = (index as u32).wrapping_add(1);
    Vec4::new(
        (value & 0xff) as f32 / 255.0,
        ((value >> 8) & 0xff) as f32 / 255.0,
        ((value >> 16) & 0xff) as f32 / 255.0,
        1.0,
    )
}

/// Index encoded in a read-back pixel, `None` for the clear color.
pub fn decode_index(pixel: [u8; 4]) -> Option<usize> {
    let value = pixel[0] as u32 | (pixel[1] as u32) << 8 | (pixel[2] as u32) << 16;
    value.checked_sub(1).map(|v| v as usize)
}

/// Largest index the 24-bit encoding can carry.
pub const MAX_PICKABLE: usize = (1 << 24) - 2;
