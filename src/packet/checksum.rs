//! Internet checksum (RFC 1071) helpers for IPv4 headers.

/// Minimum IPv4 header length in bytes.
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Byte offset of the checksum field inside an IPv4 header.
const IPV4_CHECKSUM_OFFSET: usize = 10;

/// Ones'-complement sum of all 16-bit big-endian words in `data`, folded to
/// 16 bits but not inverted.
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    // Fold 32-bit sum to 16 bits (add carry bits)
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16
}

/// Compute the internet checksum of `data`.
///
/// The checksum field itself must be zeroed by the caller before computing
/// the value for a header that is being built.
#[must_use]
pub fn internet_checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}

/// Recompute and store the checksum of the IPv4 header at the start of
/// `header`. The slice must cover exactly the header (IHL * 4 bytes).
pub fn fill_ipv4_checksum(header: &mut [u8]) {
    header[IPV4_CHECKSUM_OFFSET] = 0;
    header[IPV4_CHECKSUM_OFFSET + 1] = 0;
    let checksum = internet_checksum(header);
    header[IPV4_CHECKSUM_OFFSET..IPV4_CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
}

/// Verify the IPv4 header checksum of `frame`.
///
/// Returns `false` for frames that are too short, not IPv4, or whose IHL
/// points past the end of the buffer.
#[must_use]
pub fn verify_ipv4_checksum(frame: &[u8]) -> bool {
    if frame.len() < IPV4_MIN_HEADER_LEN || frame[0] >> 4 != 4 {
        return false;
    }

    let header_len = usize::from(frame[0] & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || frame.len() < header_len {
        return false;
    }

    // Valid checksum results in 0xFFFF after folding
    ones_complement_sum(&frame[..header_len]) == 0xFFFF
}
