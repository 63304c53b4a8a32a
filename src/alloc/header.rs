//! Intrusive block header and back-offset trailer.
//!
//! Every live allocation starts with a [`BlockHeader`] at the beginning of
//! its span. The user pointer is handed out somewhere past the header
//! (alignment padding may sit in between); a 32-bit back-offset written
//! immediately below the user pointer records the distance back to the
//! header start, so `deallocate` can recover the header from the user
//! pointer alone.

/// Sentinel value identifying a live allocation.
///
/// Free blocks start with their size (a multiple of the 16-byte quantum),
/// so the low nibble of the first word never collides with this value.
pub const HEADER_MAGIC: u32 = 0xA11C_8E8D;

/// Size of the back-offset trailer below the user pointer. A consequence
/// of the trailer encoding is that alignments below 4 are meaningless;
/// the allocator quantum raises the effective minimum to 16 anyway.
pub const BACK_OFFSET_SIZE: usize = size_of::<u32>();

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

pub const TAG_LEN: usize = 32;

/// Fixed metadata stamped at the start of every allocated block.
#[repr(C)]
pub struct BlockHeader {
    pub magic: u32,
    /// Total span of the block: header, padding, payload and any absorbed
    /// trailing remainder.
    pub size: usize,
    /// NUL-terminated label, at most 31 bytes of it meaningful.
    pub tag: [u8; TAG_LEN],
}

/// Copy `tag` into a fixed NUL-terminated buffer, truncating at 31 bytes.
pub fn encode_tag(tag: &str) -> [u8; TAG_LEN] {
    let mut buf = [0u8; TAG_LEN];
    let len = tag.len().min(TAG_LEN - 1);
    buf[..len].copy_from_slice(&tag.as_bytes()[..len]);
    buf
}

/// Recover the label from a tag buffer, replacing non-printable bytes
/// with `'?'` so the result is always safe to ship to a UI.
pub fn decode_tag(tag: &[u8; TAG_LEN]) -> String {
    tag.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if (32..127).contains(&b) { b as char } else { '?' })
        .collect()
}
